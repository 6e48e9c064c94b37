// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers, peer identities and the wire-level message set shared by all
//! transports.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Opaque document identifier, chosen by the application.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::AsRef,
    derive_more::From,
)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Stable peer identifier. Survives reconnects, so peer-level bookkeeping
/// (like the last version we know a peer to hold) can be keyed by it.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::AsRef,
    derive_more::From,
)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh 64-bit identifier, formatted as a decimal string.
    pub fn random() -> Self {
        Self(rand::random::<u64>().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Names one attached adapter within a repo.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    derive_more::Display,
    derive_more::AsRef,
    derive_more::From,
)]
pub struct AdapterId(String);

impl From<&str> for AdapterId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local channel identifier. Never reused after removal.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display,
)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerType {
    User,
    Service,
    Storage,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    pub name: String,
    pub peer_type: PeerType,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, peer_type: PeerType) -> Self {
        Self {
            peer_id: PeerId::random(),
            name: name.into(),
            peer_type,
        }
    }
}

/// Which side of the runtime a channel belongs to. Storage channels bypass
/// the rules engine; network channels are fully gated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ChannelKind {
    #[default]
    #[display("network")]
    Network,
    #[display("storage")]
    Storage,
}

/// Version vectors travel as their Loro binary encoding.
pub type EncodedVersion = Vec<u8>;

/// One document entry of a sync-request: "this is the version I hold".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocVersionRequest {
    pub doc_id: DocId,
    pub requester_doc_version: EncodedVersion,
}

/// How a sync-response carries (or declines to carry) document data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transmission {
    UpToDate { version: EncodedVersion },
    Snapshot { data: Vec<u8>, version: EncodedVersion },
    Update { data: Vec<u8> },
    Unavailable,
}

impl Transmission {
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Snapshot { data, .. } | Self::Update { data } => data.len(),
            Self::UpToDate { .. } | Self::Unavailable => 0,
        }
    }
}

/// Presence data for one namespace of one document. Relayed with a hop
/// limit, so hub topologies forward it without looping forever.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralMessage {
    pub doc_id: DocId,
    pub namespace: String,
    pub data: Vec<u8>,
    pub hops_remaining: u8,
}

/// Presence state piggybacked onto a sync-response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralBlob {
    pub namespace: String,
    pub data: Vec<u8>,
}

/// The closed set of messages every transport carries. Adapters only differ
/// in how these are framed, never in what they mean.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMsg {
    EstablishRequest {
        identity: PeerIdentity,
    },
    EstablishResponse {
        identity: PeerIdentity,
    },
    DirectoryRequest,
    DirectoryResponse {
        doc_ids: Vec<DocId>,
    },
    SyncRequest {
        docs: Vec<DocVersionRequest>,
        bidirectional: bool,
        include_ephemeral: bool,
    },
    SyncResponse {
        doc_id: DocId,
        transmission: Transmission,
        ephemeral: Option<Vec<EphemeralBlob>>,
    },
    Ephemeral(EphemeralMessage),
    Heartbeat,
}

impl ChannelMsg {
    /// Stable name used for logging and per-message-type middleware keys.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EstablishRequest { .. } => "establish-request",
            Self::EstablishResponse { .. } => "establish-response",
            Self::DirectoryRequest => "directory-request",
            Self::DirectoryResponse { .. } => "directory-response",
            Self::SyncRequest { .. } => "sync-request",
            Self::SyncResponse { .. } => "sync-response",
            Self::Ephemeral(_) => "ephemeral",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Self::SyncResponse { transmission, .. } => transmission.payload_len(),
            Self::Ephemeral(message) => message.data.len(),
            _ => 0,
        }
    }
}

/// Outbound: one message, addressed to a set of channels.
#[derive(Clone, Debug)]
pub struct AddressedEnvelope {
    pub to_channel_ids: Vec<ChannelId>,
    pub message: ChannelMsg,
}

impl AddressedEnvelope {
    pub fn to_one(channel_id: ChannelId, message: ChannelMsg) -> Self {
        Self {
            to_channel_ids: vec![channel_id],
            message,
        }
    }
}

/// Inbound: one message, tagged with the channel it came from.
#[derive(Clone, Debug)]
pub struct ReturnEnvelope {
    pub from_channel_id: ChannelId,
    pub message: ChannelMsg,
}

/// Per-channel transfer progress of one document, as reported to the
/// application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    /// A sync-request is out, no response yet.
    Loading,
    /// The channel delivered a snapshot or update.
    Found,
    /// The channel answered "unavailable".
    NotFound,
    /// The channel announced the document, but no transfer was requested.
    Aware,
}

impl LoadState {
    /// Whether this state settles a `wait_for_sync` call.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Found | Self::NotFound)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelReadyState {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub load: LoadState,
}

/// Immutable projection of a document's per-channel progress. Handed to
/// subscribers; never aliases the synchronizer's own state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DocReadyState {
    pub channels: Vec<ChannelReadyState>,
    /// Set once when the document is deleted locally.
    pub removed: bool,
}

impl DocReadyState {
    pub fn settled_for(&self, kind: ChannelKind) -> bool {
        self.channels
            .iter()
            .any(|c| c.kind == kind && c.load.is_settled())
    }
}

/// Errors surfaced to the application through `wait_for_sync`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("timed out after {timeout_ms}ms waiting for {kind} sync of {doc_id}")]
    SyncTimeout {
        kind: ChannelKind,
        timeout_ms: u64,
        doc_id: DocId,
        last_seen: DocReadyState,
    },
    #[error("no {kind} adapters are attached to this repo")]
    NoAdapters { kind: ChannelKind },
    #[error("wait for sync was aborted")]
    Aborted,
    #[error("the synchronizer has shut down")]
    Stopped,
}

pub mod factories {
    use super::{DocId, PeerId, PeerIdentity, PeerType};

    pub fn user_identity(name: &str) -> PeerIdentity {
        PeerIdentity {
            peer_id: PeerId::new(format!("peer-{name}")),
            name: name.to_string(),
            peer_type: PeerType::User,
        }
    }

    pub fn storage_identity(name: &str) -> PeerIdentity {
        PeerIdentity {
            peer_id: PeerId::new(format!("storage-{name}")),
            name: name.to_string(),
            peer_type: PeerType::Storage,
        }
    }

    pub fn doc_id(id: &str) -> DocId {
        DocId::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn channel_ids_are_never_reused() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert!(b > a);
    }

    #[test]
    fn message_kinds_are_stable() {
        assert_eq!(ChannelMsg::DirectoryRequest.kind(), "directory-request");
        assert_eq!(ChannelMsg::Heartbeat.kind(), "heartbeat");
        assert_eq!(
            ChannelMsg::SyncResponse {
                doc_id: DocId::new("d"),
                transmission: Transmission::Unavailable,
                ephemeral: None,
            }
            .kind(),
            "sync-response"
        );
    }

    #[test]
    fn settled_load_states() {
        assert!(LoadState::Found.is_settled());
        assert!(LoadState::NotFound.is_settled());
        assert!(!LoadState::Loading.is_settled());
        assert!(!LoadState::Aware.is_settled());
    }
}
