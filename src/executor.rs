// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Interprets the commands the synchronizer produces. This is where the
//! impure half lives: channel writes, CRDT imports, presence bookkeeping and
//! subscriber notifications.

use crate::channel::ChannelSender;
use crate::config::RepoConfig;
use crate::ephemeral::{EphemeralChange, EphemeralStore};
use crate::sync::{Command, Input};
use crate::types::{
    ChannelId, ChannelMsg, DocId, DocReadyState, EphemeralBlob, EphemeralMessage,
};
use crate::wire::{encode_batch, split_into_frames};
use loro::Subscription;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

struct Outbound {
    sender: ChannelSender,
    /// Messages queued for this channel within the current task turn.
    /// Batching them keeps small writes off fragmenting transports.
    batch: Vec<ChannelMsg>,
    next_fragment_id: u32,
}

/// Single-threaded command dispatcher. One per repo, owned by the
/// synchronizer actor; `execute` collects effects, `flush` performs the
/// channel writes once per mailbox turn.
pub struct CommandExecutor {
    config: RepoConfig,
    ephemeral: Arc<EphemeralStore>,
    input_tx: mpsc::UnboundedSender<Input>,
    outbound: HashMap<ChannelId, Outbound>,
    ready: HashMap<DocId, watch::Sender<DocReadyState>>,
    subscriptions: HashMap<DocId, Subscription>,
}

impl CommandExecutor {
    pub fn new(
        config: RepoConfig,
        ephemeral: Arc<EphemeralStore>,
        input_tx: mpsc::UnboundedSender<Input>,
    ) -> Self {
        Self {
            config,
            ephemeral,
            input_tx,
            outbound: HashMap::new(),
            ready: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn register_channel(&mut self, channel_id: ChannelId, sender: ChannelSender) {
        self.outbound.insert(
            channel_id,
            Outbound {
                sender,
                batch: vec![],
                next_fragment_id: 0,
            },
        );
    }

    pub fn remove_channel(&mut self, channel_id: ChannelId) {
        self.outbound.remove(&channel_id);
    }

    /// The watch channel a handle observes for ready-state updates.
    pub fn ready_receiver(&mut self, doc_id: &DocId) -> watch::Receiver<DocReadyState> {
        self.ready
            .entry(doc_id.clone())
            .or_insert_with(|| watch::channel(DocReadyState::default()).0)
            .subscribe()
    }

    fn post(&self, input: Input) {
        // The mailbox only closes on shutdown, when feedback is moot.
        let _ = self.input_tx.send(input);
    }

    fn enqueue(&mut self, channel_id: ChannelId, message: ChannelMsg) {
        if let Some(outbound) = self.outbound.get_mut(&channel_id) {
            outbound.batch.push(message);
        } else {
            debug!(%channel_id, "Dropping message for unregistered channel");
        }
    }

    fn enqueue_all(&mut self, channel_ids: &[ChannelId], message: &ChannelMsg) {
        for channel_id in channel_ids {
            self.enqueue(*channel_id, message.clone());
        }
    }

    /// Runs one command tree depth-first, batch children in order.
    pub fn execute(&mut self, command: Command) {
        let mut queue = VecDeque::from([command]);
        while let Some(command) = queue.pop_front() {
            match command {
                Command::Batch(children) => {
                    for child in children.into_iter().rev() {
                        queue.push_front(child);
                    }
                }
                Command::SendMessage(envelope)
                | Command::SendEstablishmentMessage(envelope) => {
                    self.enqueue_all(&envelope.to_channel_ids, &envelope.message);
                }
                Command::SendSyncRequest {
                    to,
                    docs,
                    bidirectional,
                    include_ephemeral,
                } => {
                    self.enqueue(
                        to,
                        ChannelMsg::SyncRequest {
                            docs,
                            bidirectional,
                            include_ephemeral,
                        },
                    );
                }
                Command::SendSyncResponse {
                    to,
                    doc_id,
                    transmission,
                    include_ephemeral,
                } => {
                    let ephemeral = if include_ephemeral {
                        self.collect_local_ephemeral(&doc_id)
                    } else {
                        None
                    };
                    self.enqueue(
                        to,
                        ChannelMsg::SyncResponse {
                            doc_id,
                            transmission,
                            ephemeral,
                        },
                    );
                }
                Command::StopChannel { channel_id } => {
                    self.remove_channel(channel_id);
                    self.post(Input::ChannelRemoved { channel_id });
                }
                Command::SubscribeDoc { doc_id, doc } => {
                    self.ready
                        .entry(doc_id.clone())
                        .or_insert_with(|| watch::channel(DocReadyState::default()).0);
                    let input_tx = self.input_tx.clone();
                    let subscription_doc_id = doc_id.clone();
                    let subscription = doc.on_local_update(move || {
                        let _ = input_tx.send(Input::LocalDocChange {
                            doc_id: subscription_doc_id.clone(),
                        });
                    });
                    self.subscriptions.insert(doc_id, subscription);
                }
                Command::ImportDocData {
                    channel_id,
                    peer_id,
                    doc_id,
                    doc,
                    data,
                } => {
                    let success = match doc.import_from(&data, peer_id.as_str()) {
                        Ok(()) => true,
                        Err(error) => {
                            warn!(%doc_id, %channel_id, ?error, "CRDT import failed");
                            false
                        }
                    };
                    self.post(Input::DocImported {
                        doc_id,
                        channel_id,
                        success,
                    });
                }
                Command::ApplyEphemeral {
                    from_channel_id,
                    doc_id,
                    namespace,
                    data,
                } => {
                    if let Err(error) = self.ephemeral.apply_remote(&doc_id, &namespace, &data) {
                        warn!(%doc_id, %from_channel_id, ?error, "Failed to apply presence data");
                    }
                }
                Command::BroadcastEphemeralState {
                    to_channel_ids,
                    doc_id,
                    namespace,
                } => {
                    let namespaces = namespace
                        .map_or_else(|| self.ephemeral.local_namespaces(&doc_id), |ns| vec![ns]);
                    for namespace in namespaces {
                        match self.ephemeral.encode_local(&doc_id, &namespace) {
                            Ok(Some(data)) => {
                                let message = ChannelMsg::Ephemeral(EphemeralMessage {
                                    doc_id: doc_id.clone(),
                                    namespace,
                                    data,
                                    hops_remaining: self.config.ephemeral_hop_limit,
                                });
                                self.enqueue_all(&to_channel_ids, &message);
                            }
                            Ok(None) => {}
                            Err(error) => {
                                warn!(%doc_id, ?error, "Failed to encode presence state");
                            }
                        }
                    }
                }
                Command::BroadcastEphemeralRelay {
                    to_channel_ids,
                    message,
                } => {
                    self.enqueue_all(&to_channel_ids, &ChannelMsg::Ephemeral(message));
                }
                Command::RemoveEphemeralPeer { doc_id, peer_id } => {
                    for namespace in self.ephemeral.remove_peer(&doc_id, &peer_id) {
                        self.ephemeral.notify(EphemeralChange {
                            doc_id: doc_id.clone(),
                            namespace,
                            peer_id: Some(peer_id.clone()),
                        });
                    }
                }
                Command::EmitReadyStateChanged { doc_id, state } => {
                    let removed = state.removed;
                    if let Some(ready) = self.ready.get(&doc_id) {
                        ready.send_replace(state);
                    }
                    if removed {
                        self.ready.remove(&doc_id);
                        self.subscriptions.remove(&doc_id);
                        self.ephemeral.remove_doc(&doc_id);
                    }
                }
                Command::EmitEphemeralChange {
                    doc_id,
                    namespace,
                    peer_id,
                } => {
                    self.ephemeral.notify(EphemeralChange {
                        doc_id,
                        namespace,
                        peer_id,
                    });
                }
                Command::Dispatch(input) => {
                    self.post(*input);
                }
            }
        }
    }

    fn collect_local_ephemeral(&self, doc_id: &DocId) -> Option<Vec<EphemeralBlob>> {
        let mut blobs = vec![];
        for namespace in self.ephemeral.local_namespaces(doc_id) {
            match self.ephemeral.encode_local(doc_id, &namespace) {
                Ok(Some(data)) => blobs.push(EphemeralBlob { namespace, data }),
                Ok(None) => {}
                Err(error) => {
                    warn!(%doc_id, ?error, "Failed to encode presence state");
                }
            }
        }
        if blobs.is_empty() {
            None
        } else {
            Some(blobs)
        }
    }

    /// Writes out every per-channel batch accumulated this turn. A channel
    /// whose transport fails gets one retry; after that it is reported
    /// removed.
    pub async fn flush(&mut self) {
        let mut failed = vec![];
        for (channel_id, outbound) in &mut self.outbound {
            if outbound.batch.is_empty() {
                continue;
            }
            let batch = std::mem::take(&mut outbound.batch);
            let payload = match encode_batch(&batch) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(%channel_id, ?error, "Failed to encode outbound batch");
                    continue;
                }
            };
            let fragment_id = outbound.next_fragment_id;
            let frames = split_into_frames(payload, self.config.fragment_threshold, fragment_id);
            if frames.len() > 1 {
                outbound.next_fragment_id = outbound.next_fragment_id.wrapping_add(1);
            }

            let mut broken = false;
            for frame in frames {
                let bytes = frame.encode();
                if outbound.sender.send(bytes.clone()).await.is_err() {
                    // One retry, then give up on the channel.
                    if outbound.sender.send(bytes).await.is_err() {
                        broken = true;
                        break;
                    }
                }
            }
            if broken {
                warn!(%channel_id, "Channel write failed twice, removing channel");
                failed.push(*channel_id);
            }
        }
        for channel_id in failed {
            self.remove_channel(channel_id);
            self.post(Input::ChannelRemoved { channel_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::types::{AddressedEnvelope, PeerId, Transmission};
    use crate::wire::{decode_batch, Frame, Reassembler};
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    fn executor() -> (CommandExecutor, mpsc::UnboundedReceiver<Input>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let ephemeral = Arc::new(EphemeralStore::new(PeerId::new("self")));
        (
            CommandExecutor::new(RepoConfig::default(), ephemeral, input_tx),
            input_rx,
        )
    }

    fn registered_channel(
        executor: &mut CommandExecutor,
    ) -> (ChannelId, mpsc::Receiver<Vec<u8>>) {
        let channel_id = ChannelId::next();
        let (frames_tx, frames_rx) = mpsc::channel(64);
        executor.register_channel(channel_id, ChannelSender::new(frames_tx));
        (channel_id, frames_rx)
    }

    async fn receive_batch(frames_rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<ChannelMsg> {
        let mut reassembler = Reassembler::default();
        loop {
            let bytes = frames_rx.recv().await.expect("channel closed");
            let frame = Frame::decode(&bytes).unwrap();
            if let Some(payload) = reassembler.accept(frame, Instant::now()).unwrap() {
                return decode_batch(&payload).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn messages_are_batched_per_turn() {
        let (mut executor, _input_rx) = executor();
        let (channel_id, mut frames_rx) = registered_channel(&mut executor);

        executor.execute(Command::SendMessage(AddressedEnvelope::to_one(
            channel_id,
            ChannelMsg::DirectoryRequest,
        )));
        executor.execute(Command::SendMessage(AddressedEnvelope::to_one(
            channel_id,
            ChannelMsg::Heartbeat,
        )));
        executor.flush().await;

        let batch = receive_batch(&mut frames_rx).await;
        assert_eq!(
            batch,
            vec![ChannelMsg::DirectoryRequest, ChannelMsg::Heartbeat]
        );
    }

    #[tokio::test]
    async fn large_batches_are_fragmented() {
        let (mut executor, _input_rx) = executor();
        let (channel_id, mut frames_rx) = registered_channel(&mut executor);

        let doc_id = DocId::new("doc");
        executor.execute(Command::SendSyncResponse {
            to: channel_id,
            doc_id: doc_id.clone(),
            transmission: Transmission::Update {
                data: vec![7; 200 * 1024],
            },
            include_ephemeral: false,
        });
        executor.flush().await;

        // First frame must be a fragment header, not a complete message.
        let first = frames_rx.recv().await.unwrap();
        assert_matches!(
            Frame::decode(&first).unwrap(),
            Frame::FragmentHeader { total_fragments, .. } if total_fragments >= 3
        );
    }

    #[tokio::test]
    async fn import_posts_result_back() {
        let (mut executor, mut input_rx) = executor();
        let doc = Arc::new(Document::new());
        let remote = Document::new();
        remote.inner().get_text("t").insert(0, "hi").unwrap();
        remote.commit();

        executor.execute(Command::ImportDocData {
            channel_id: ChannelId::next(),
            peer_id: PeerId::new("peer"),
            doc_id: DocId::new("doc"),
            doc: Arc::clone(&doc),
            data: remote.snapshot().unwrap(),
        });

        assert_matches!(
            input_rx.recv().await,
            Some(Input::DocImported { success: true, .. })
        );
        assert_eq!(doc.inner().get_text("t").to_string(), "hi");
    }

    #[tokio::test]
    async fn failed_import_reports_failure() {
        let (mut executor, mut input_rx) = executor();
        executor.execute(Command::ImportDocData {
            channel_id: ChannelId::next(),
            peer_id: PeerId::new("peer"),
            doc_id: DocId::new("doc"),
            doc: Arc::new(Document::new()),
            data: vec![0xde, 0xad, 0xbe, 0xef],
        });
        assert_matches!(
            input_rx.recv().await,
            Some(Input::DocImported { success: false, .. })
        );
    }

    #[tokio::test]
    async fn write_failure_removes_the_channel() {
        let (mut executor, mut input_rx) = executor();
        let channel_id = ChannelId::next();
        let (frames_tx, frames_rx) = mpsc::channel(1);
        drop(frames_rx);
        executor.register_channel(channel_id, ChannelSender::new(frames_tx));

        executor.execute(Command::SendMessage(AddressedEnvelope::to_one(
            channel_id,
            ChannelMsg::Heartbeat,
        )));
        executor.flush().await;

        assert_matches!(
            input_rx.recv().await,
            Some(Input::ChannelRemoved { channel_id: removed }) if removed == channel_id
        );
    }

    #[tokio::test]
    async fn ready_state_removal_cleans_up() {
        let (mut executor, _input_rx) = executor();
        let doc_id = DocId::new("doc");
        let mut ready_rx = executor.ready_receiver(&doc_id);

        executor.execute(Command::EmitReadyStateChanged {
            doc_id: doc_id.clone(),
            state: DocReadyState {
                channels: vec![],
                removed: true,
            },
        });
        assert!(ready_rx.changed().await.is_ok());
        assert!(ready_rx.borrow().removed);
    }
}
