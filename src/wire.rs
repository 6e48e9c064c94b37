// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Binary framing shared by every transport.
//!
//! Each envelope on the wire starts with a one-byte tag: either a complete
//! encoded message batch, or one piece of a fragmented batch. Batches above
//! the fragmentation threshold must be split, because several transports
//! (and some proxies in front of them) reject large single writes.

use crate::types::ChannelMsg;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

const TAG_COMPLETE: u8 = 0x00;
const TAG_FRAGMENT_HEADER: u8 = 0x01;
const TAG_FRAGMENT_DATA: u8 = 0x02;

/// Batches above this size must be fragmented.
pub const DEFAULT_FRAGMENT_THRESHOLD: usize = 80 * 1024;

/// Partial fragment sets older than this are discarded.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is truncated")]
    Truncated,
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("fragment set {fragment_id} reassembled to {actual} bytes, header promised {expected}")]
    LengthMismatch {
        fragment_id: u32,
        expected: u32,
        actual: usize,
    },
    #[error("fragment header for {0} declares zero fragments")]
    EmptyFragmentSet(u32),
    #[error("failed to decode message batch: {0}")]
    Batch(String),
}

/// One envelope as it appears on the wire, after transport-level
/// segmentation and before batch decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Complete(Vec<u8>),
    FragmentHeader {
        fragment_id: u32,
        total_len: u32,
        total_fragments: u16,
        flags: u8,
    },
    FragmentData {
        fragment_id: u32,
        index: u16,
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Complete(payload) => {
                let mut bytes = Vec::with_capacity(1 + payload.len());
                bytes.push(TAG_COMPLETE);
                bytes.extend_from_slice(payload);
                bytes
            }
            Self::FragmentHeader {
                fragment_id,
                total_len,
                total_fragments,
                flags,
            } => {
                let mut bytes = Vec::with_capacity(12);
                bytes.push(TAG_FRAGMENT_HEADER);
                bytes.extend_from_slice(&fragment_id.to_be_bytes());
                bytes.extend_from_slice(&total_len.to_be_bytes());
                bytes.extend_from_slice(&total_fragments.to_be_bytes());
                bytes.push(*flags);
                bytes
            }
            Self::FragmentData {
                fragment_id,
                index,
                payload,
            } => {
                let mut bytes = Vec::with_capacity(7 + payload.len());
                bytes.push(TAG_FRAGMENT_DATA);
                bytes.extend_from_slice(&fragment_id.to_be_bytes());
                bytes.extend_from_slice(&index.to_be_bytes());
                bytes.extend_from_slice(payload);
                bytes
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&tag, rest) = bytes.split_first().ok_or(FrameError::Truncated)?;
        match tag {
            TAG_COMPLETE => Ok(Self::Complete(rest.to_vec())),
            TAG_FRAGMENT_HEADER => {
                if rest.len() < 11 {
                    return Err(FrameError::Truncated);
                }
                Ok(Self::FragmentHeader {
                    fragment_id: u32::from_be_bytes(rest[0..4].try_into().expect("sliced 4 bytes")),
                    total_len: u32::from_be_bytes(rest[4..8].try_into().expect("sliced 4 bytes")),
                    total_fragments: u16::from_be_bytes(
                        rest[8..10].try_into().expect("sliced 2 bytes"),
                    ),
                    flags: rest[10],
                })
            }
            TAG_FRAGMENT_DATA => {
                if rest.len() < 6 {
                    return Err(FrameError::Truncated);
                }
                Ok(Self::FragmentData {
                    fragment_id: u32::from_be_bytes(rest[0..4].try_into().expect("sliced 4 bytes")),
                    index: u16::from_be_bytes(rest[4..6].try_into().expect("sliced 2 bytes")),
                    payload: rest[6..].to_vec(),
                })
            }
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

pub fn encode_batch(batch: &[ChannelMsg]) -> Result<Vec<u8>, FrameError> {
    postcard::to_allocvec(batch).map_err(|e| FrameError::Batch(e.to_string()))
}

pub fn decode_batch(bytes: &[u8]) -> Result<Vec<ChannelMsg>, FrameError> {
    postcard::from_bytes(bytes).map_err(|e| FrameError::Batch(e.to_string()))
}

/// Splits an encoded batch into frames. Small batches travel as one complete
/// frame; larger ones become a header frame plus data frames of at most
/// `threshold` bytes each.
pub fn split_into_frames(payload: Vec<u8>, threshold: usize, fragment_id: u32) -> Vec<Frame> {
    assert!(threshold > 0, "fragmentation threshold must be positive");
    if payload.len() <= threshold {
        return vec![Frame::Complete(payload)];
    }

    let total_len = payload.len();
    let chunks: Vec<&[u8]> = payload.chunks(threshold).collect();
    let mut frames = Vec::with_capacity(chunks.len() + 1);
    frames.push(Frame::FragmentHeader {
        fragment_id,
        total_len: total_len as u32,
        total_fragments: chunks.len() as u16,
        flags: 0,
    });
    for (index, chunk) in chunks.into_iter().enumerate() {
        frames.push(Frame::FragmentData {
            fragment_id,
            index: index as u16,
            payload: chunk.to_vec(),
        });
    }
    frames
}

#[derive(Debug, Default)]
struct PartialBatch {
    total_len: Option<u32>,
    total_fragments: Option<u16>,
    pieces: HashMap<u16, Vec<u8>>,
    first_seen: Option<Instant>,
}

impl PartialBatch {
    fn is_complete(&self) -> bool {
        self.total_fragments
            .is_some_and(|total| self.pieces.len() == usize::from(total))
    }

    fn assemble(self, fragment_id: u32) -> Result<Vec<u8>, FrameError> {
        let total_fragments = self
            .total_fragments
            .expect("assemble is only called on complete sets");
        let mut payload = Vec::new();
        for index in 0..total_fragments {
            let piece = self
                .pieces
                .get(&index)
                .expect("complete sets contain every index");
            payload.extend_from_slice(piece);
        }
        let expected = self.total_len.expect("header carries the total length");
        if payload.len() != expected as usize {
            return Err(FrameError::LengthMismatch {
                fragment_id,
                expected,
                actual: payload.len(),
            });
        }
        Ok(payload)
    }
}

/// Per-connection reassembly state. Fragments may arrive in any order, and
/// the header may trail its data. Sets that stay incomplete past the timeout
/// are dropped wholesale.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<u32, PartialBatch>,
    timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            partials: HashMap::new(),
            timeout,
        }
    }

    /// Feeds one frame in. Returns the reassembled batch payload once a set
    /// completes, or immediately for complete frames.
    pub fn accept(&mut self, frame: Frame, now: Instant) -> Result<Option<Vec<u8>>, FrameError> {
        match frame {
            Frame::Complete(payload) => Ok(Some(payload)),
            Frame::FragmentHeader {
                fragment_id,
                total_len,
                total_fragments,
                flags: _,
            } => {
                if total_fragments == 0 {
                    return Err(FrameError::EmptyFragmentSet(fragment_id));
                }
                let partial = self.partials.entry(fragment_id).or_default();
                partial.first_seen.get_or_insert(now);
                // Re-sent headers carry no new information.
                partial.total_len = Some(total_len);
                partial.total_fragments = Some(total_fragments);
                self.try_finish(fragment_id)
            }
            Frame::FragmentData {
                fragment_id,
                index,
                payload,
            } => {
                let partial = self.partials.entry(fragment_id).or_default();
                partial.first_seen.get_or_insert(now);
                partial.pieces.insert(index, payload);
                self.try_finish(fragment_id)
            }
        }
    }

    fn try_finish(&mut self, fragment_id: u32) -> Result<Option<Vec<u8>>, FrameError> {
        let complete = self
            .partials
            .get(&fragment_id)
            .is_some_and(PartialBatch::is_complete);
        if !complete {
            return Ok(None);
        }
        let partial = self
            .partials
            .remove(&fragment_id)
            .expect("checked for presence above");
        partial.assemble(fragment_id).map(Some)
    }

    /// Drops partial sets whose first fragment is older than the timeout.
    pub fn purge_stale(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.partials.retain(|fragment_id, partial| {
            let stale = partial
                .first_seen
                .is_some_and(|t| now.duration_since(t) >= timeout);
            if stale {
                warn!("Discarding incomplete fragment set {fragment_id}");
            }
            !stale
        });
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
