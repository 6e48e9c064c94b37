// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One logical duplex link to one collaborator, however it is transported.

use crate::types::{AdapterId, ChannelId, ChannelKind, PeerId, PeerIdentity};
use anyhow::{Context, Result};
use tokio::sync::mpsc;

/// Who is on the other end. A channel starts out connecting; exactly one
/// establishment handshake per channel lifetime moves it to established.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelPeer {
    Connecting,
    Established(PeerIdentity),
}

/// The synchronizer's record of one channel.
#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub adapter_id: AdapterId,
    pub peer: ChannelPeer,
    /// Whether our side opened the link, and therefore speaks first.
    pub initiator: bool,
}

impl ChannelInfo {
    pub fn new(
        channel_id: ChannelId,
        kind: ChannelKind,
        adapter_id: AdapterId,
        initiator: bool,
    ) -> Self {
        Self {
            channel_id,
            kind,
            adapter_id,
            peer: ChannelPeer::Connecting,
            initiator,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.peer, ChannelPeer::Established(_))
    }

    pub fn identity(&self) -> Option<&PeerIdentity> {
        match &self.peer {
            ChannelPeer::Established(identity) => Some(identity),
            ChannelPeer::Connecting => None,
        }
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.identity().map(|identity| &identity.peer_id)
    }

    pub fn peer_name(&self) -> &str {
        self.identity().map_or("", |identity| identity.name.as_str())
    }
}

/// Outbound side of a channel: encoded frame payloads go in here, the
/// owning adapter writes them to its transport.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    frames_tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelSender {
    pub fn new(frames_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { frames_tx }
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.frames_tx
            .send(frame)
            .await
            .context("Channel transport is gone")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connecting_channels_expose_no_identity() {
        let info = ChannelInfo::new(
            ChannelId::next(),
            ChannelKind::Network,
            AdapterId::from("test"),
            true,
        );
        assert!(!info.is_established());
        assert_eq!(info.identity(), None);
        assert_eq!(info.peer_name(), "");
    }
}
