// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable document storage, presented to the synchronizer as just another
//! peer.
//!
//! The storage adapter registers a storage-kind channel and runs a small
//! in-process service on the far end that speaks the ordinary channel
//! protocol: it answers sync-requests from stored blobs and persists every
//! update it receives. Blobs live in a key-range KV store; per document we
//! keep an optional compacted snapshot plus a run of incremental blobs that
//! are folded into a fresh snapshot once they pile up.

use crate::adapter::{Adapter, AdapterContext};
use crate::document::{decode_version, Document};
use crate::types::{
    AdapterId, ChannelKind, ChannelMsg, DocId, DocVersionRequest, PeerIdentity, PeerType,
    Transmission,
};
use crate::wire::{decode_batch, encode_batch, split_into_frames, Frame, Reassembler,
    DEFAULT_FRAGMENT_THRESHOLD};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A key-range KV store. Keys are component lists; ranges are prefix scans
/// in key order.
#[async_trait]
pub trait DocStorage: Send + Sync {
    async fn load(&self, key: &[String]) -> Result<Option<Vec<u8>>>;
    async fn load_range(&self, prefix: &[String]) -> Result<Vec<(Vec<String>, Vec<u8>)>>;
    async fn save(&self, key: &[String], value: &[u8]) -> Result<()>;
    async fn remove_range(&self, prefix: &[String]) -> Result<()>;
}

/// Keeps everything in a sorted map. The storage of choice for tests and
/// short-lived processes.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<Vec<String>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DocStorage for MemoryStorage {
    async fn load(&self, key: &[String]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().expect("storage lock poisoned").get(key).cloned())
    }

    async fn load_range(&self, prefix: &[String]) -> Result<Vec<(Vec<String>, Vec<u8>)>> {
        let entries = self.entries.lock().expect("storage lock poisoned");
        Ok(entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn save(&self, key: &[String], value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn remove_range(&self, prefix: &[String]) -> Result<()> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

const SNAPSHOT: &str = "snapshot";
const INCREMENTAL: &str = "incremental";

fn snapshot_key(doc_id: &DocId) -> Vec<String> {
    vec![doc_id.to_string(), SNAPSHOT.to_string()]
}

fn incremental_prefix(doc_id: &DocId) -> Vec<String> {
    vec![doc_id.to_string(), INCREMENTAL.to_string()]
}

fn incremental_key(doc_id: &DocId, seq: u64) -> Vec<String> {
    vec![
        doc_id.to_string(),
        INCREMENTAL.to_string(),
        format!("{seq:016}"),
    ]
}

struct StoredDoc {
    doc: Document,
    incremental_count: usize,
    next_seq: u64,
}

/// The far end of a storage channel. Speaks the channel protocol against
/// blobs in a [`DocStorage`].
pub(crate) struct StorageService {
    storage: Arc<dyn DocStorage>,
    identity: PeerIdentity,
    compaction_threshold: usize,
    docs: HashMap<DocId, Option<StoredDoc>>,
}

impl StorageService {
    pub(crate) fn new(
        storage: Arc<dyn DocStorage>,
        identity: PeerIdentity,
        compaction_threshold: usize,
    ) -> Self {
        Self {
            storage,
            identity,
            compaction_threshold,
            docs: HashMap::new(),
        }
    }

    async fn stored_doc_ids(&self) -> Result<Vec<DocId>> {
        let mut doc_ids: Vec<DocId> = self
            .storage
            .load_range(&[])
            .await?
            .into_iter()
            .filter_map(|(key, _)| key.first().map(|id| DocId::new(id.clone())))
            .collect();
        doc_ids.sort();
        doc_ids.dedup();
        Ok(doc_ids)
    }

    /// Loads a document from its blobs, caching the hydrated copy. `None`
    /// when nothing is stored.
    async fn hydrate(&mut self, doc_id: &DocId) -> Result<Option<&mut StoredDoc>> {
        if !self.docs.contains_key(doc_id) {
            let snapshot = self.storage.load(&snapshot_key(doc_id)).await?;
            let incrementals = self.storage.load_range(&incremental_prefix(doc_id)).await?;
            let entry = if snapshot.is_none() && incrementals.is_empty() {
                None
            } else {
                let doc = Document::new();
                if let Some(snapshot) = &snapshot {
                    doc.import(snapshot).context("Stored snapshot is corrupt")?;
                }
                let mut next_seq = 0;
                for (key, blob) in &incrementals {
                    doc.import(blob).context("Stored incremental is corrupt")?;
                    if let Some(seq) = key.get(2).and_then(|s| s.parse::<u64>().ok()) {
                        next_seq = next_seq.max(seq + 1);
                    }
                }
                Some(StoredDoc {
                    doc,
                    incremental_count: incrementals.len(),
                    next_seq,
                })
            };
            self.docs.insert(doc_id.clone(), entry);
        }
        Ok(self
            .docs
            .get_mut(doc_id)
            .expect("inserted above")
            .as_mut())
    }

    /// Persists one received blob and compacts when the incremental run
    /// gets long.
    async fn persist(&mut self, doc_id: &DocId, data: &[u8]) -> Result<()> {
        self.hydrate(doc_id).await?;
        let entry = self
            .docs
            .get_mut(doc_id)
            .expect("hydrate inserts an entry");
        let stored = entry.get_or_insert_with(|| StoredDoc {
            doc: Document::new(),
            incremental_count: 0,
            next_seq: 0,
        });
        stored.doc.import(data).context("Received blob is corrupt")?;
        self.storage
            .save(&incremental_key(doc_id, stored.next_seq), data)
            .await?;
        stored.next_seq += 1;
        stored.incremental_count += 1;

        if stored.incremental_count >= self.compaction_threshold {
            debug!(%doc_id, "Compacting stored document");
            let snapshot = stored.doc.snapshot()?;
            self.storage.save(&snapshot_key(doc_id), &snapshot).await?;
            self.storage.remove_range(&incremental_prefix(doc_id)).await?;
            stored.incremental_count = 0;
        }
        Ok(())
    }

    /// Handles one message from the repo side, returning the replies.
    pub(crate) async fn handle_message(&mut self, message: ChannelMsg) -> Vec<ChannelMsg> {
        match self.try_handle_message(message).await {
            Ok(replies) => replies,
            Err(error) => {
                // Storage failures must not take the channel down; the next
                // local change retries the write.
                warn!(?error, "Storage operation failed");
                vec![]
            }
        }
    }

    async fn try_handle_message(&mut self, message: ChannelMsg) -> Result<Vec<ChannelMsg>> {
        match message {
            ChannelMsg::EstablishRequest { .. } => {
                let mut replies = vec![ChannelMsg::EstablishResponse {
                    identity: self.identity.clone(),
                }];
                let doc_ids = self.stored_doc_ids().await?;
                if !doc_ids.is_empty() {
                    replies.push(ChannelMsg::DirectoryResponse { doc_ids });
                }
                Ok(replies)
            }
            ChannelMsg::DirectoryRequest => {
                let doc_ids = self.stored_doc_ids().await?;
                Ok(vec![ChannelMsg::DirectoryResponse { doc_ids }])
            }
            ChannelMsg::DirectoryResponse { doc_ids } => {
                // The repo announced documents; ask for whatever we miss.
                let mut docs = vec![];
                for doc_id in doc_ids {
                    let version = match self.hydrate(&doc_id).await? {
                        Some(stored) => stored.doc.encoded_version(),
                        None => vec![],
                    };
                    docs.push(DocVersionRequest {
                        doc_id,
                        requester_doc_version: version,
                    });
                }
                if docs.is_empty() {
                    Ok(vec![])
                } else {
                    Ok(vec![ChannelMsg::SyncRequest {
                        docs,
                        bidirectional: false,
                        include_ephemeral: false,
                    }])
                }
            }
            ChannelMsg::SyncRequest {
                docs,
                bidirectional,
                include_ephemeral: _,
            } => {
                let mut replies = vec![];
                let mut counter_requests = vec![];
                for DocVersionRequest {
                    doc_id,
                    requester_doc_version,
                } in docs
                {
                    let requester_version = decode_version(&requester_doc_version)
                        .context("Malformed version in sync-request")?;
                    let our_version = match self.hydrate(&doc_id).await? {
                        Some(stored) => Some(stored.doc.encoded_version()),
                        None => None,
                    };

                    let transmission = match self.hydrate(&doc_id).await? {
                        None => Transmission::Unavailable,
                        Some(stored) => match stored.doc.compare(&requester_version) {
                            Some(Ordering::Equal | Ordering::Less) => Transmission::UpToDate {
                                version: stored.doc.encoded_version(),
                            },
                            Some(Ordering::Greater) | None => {
                                if requester_version.is_empty() {
                                    Transmission::Snapshot {
                                        data: stored.doc.snapshot()?,
                                        version: stored.doc.encoded_version(),
                                    }
                                } else {
                                    Transmission::Update {
                                        data: stored.doc.updates_since(&requester_version)?,
                                    }
                                }
                            }
                        },
                    };
                    replies.push(ChannelMsg::SyncResponse {
                        doc_id: doc_id.clone(),
                        transmission,
                        ephemeral: None,
                    });

                    if bidirectional {
                        counter_requests.push(DocVersionRequest {
                            doc_id,
                            requester_doc_version: our_version.unwrap_or_default(),
                        });
                    }
                }
                if !counter_requests.is_empty() {
                    replies.push(ChannelMsg::SyncRequest {
                        docs: counter_requests,
                        bidirectional: false,
                        include_ephemeral: false,
                    });
                }
                Ok(replies)
            }
            ChannelMsg::SyncResponse {
                doc_id,
                transmission,
                ephemeral: _,
            } => {
                match transmission {
                    Transmission::Snapshot { data, .. } | Transmission::Update { data } => {
                        self.persist(&doc_id, &data).await?;
                    }
                    Transmission::UpToDate { .. } | Transmission::Unavailable => {}
                }
                Ok(vec![])
            }
            // Presence is never persisted.
            ChannelMsg::Ephemeral(_) | ChannelMsg::Heartbeat => Ok(vec![]),
            ChannelMsg::EstablishResponse { .. } => Ok(vec![]),
        }
    }
}

/// Adapter wiring a [`StorageService`] to the repo as a storage-kind
/// channel.
pub struct StorageAdapter {
    adapter_id: AdapterId,
    storage: Arc<dyn DocStorage>,
    compaction_threshold: usize,
    fragment_threshold: usize,
    shutdown: CancellationToken,
}

impl StorageAdapter {
    pub fn new(storage: Arc<dyn DocStorage>) -> Arc<Self> {
        Arc::new(Self {
            adapter_id: AdapterId::from("storage"),
            storage,
            compaction_threshold: 64,
            fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_compaction_threshold(storage: Arc<dyn DocStorage>, threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            adapter_id: AdapterId::from("storage"),
            storage,
            compaction_threshold: threshold,
            fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
            shutdown: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Adapter for StorageAdapter {
    fn adapter_id(&self) -> AdapterId {
        self.adapter_id.clone()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Storage
    }

    async fn start(&self, context: AdapterContext) -> Result<()> {
        let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(256);
        let handle = context.add_channel(frames_tx, true);
        handle.establish();

        let mut service = StorageService::new(
            Arc::clone(&self.storage),
            PeerIdentity::new("storage", PeerType::Storage),
            self.compaction_threshold,
        );
        let fragment_threshold = self.fragment_threshold;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut reassembler = Reassembler::default();
            let mut fragment_id = 0u32;
            loop {
                let bytes = tokio::select! {
                    () = shutdown.cancelled() => break,
                    bytes = frames_rx.recv() => match bytes {
                        Some(bytes) => bytes,
                        None => break,
                    },
                };
                let Ok(frame) = Frame::decode(&bytes) else {
                    warn!("Storage channel received a malformed frame");
                    continue;
                };
                let payload = match reassembler.accept(frame, Instant::now()) {
                    Ok(Some(payload)) => payload,
                    Ok(None) => continue,
                    Err(error) => {
                        warn!(?error, "Storage channel reassembly failed");
                        continue;
                    }
                };
                let Ok(batch) = decode_batch(&payload) else {
                    warn!("Storage channel received a malformed batch");
                    continue;
                };

                let mut replies = vec![];
                for message in batch {
                    replies.extend(service.handle_message(message).await);
                }
                if replies.is_empty() {
                    continue;
                }
                match encode_batch(&replies) {
                    Ok(payload) => {
                        let frames = split_into_frames(payload, fragment_threshold, fragment_id);
                        if frames.len() > 1 {
                            fragment_id = fragment_id.wrapping_add(1);
                        }
                        for frame in frames {
                            handle.receive(frame.encode());
                        }
                    }
                    Err(error) => warn!(?error, "Failed to encode storage replies"),
                }
            }
            handle.remove();
        });
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::storage_identity;
    use pretty_assertions::assert_eq;

    fn service(storage: &Arc<MemoryStorage>, compaction_threshold: usize) -> StorageService {
        StorageService::new(
            Arc::clone(storage) as Arc<dyn DocStorage>,
            storage_identity("test"),
            compaction_threshold,
        )
    }

    fn update_blob(text: &str) -> (Document, Vec<u8>) {
        let doc = Document::new();
        doc.inner().get_text("title").insert(0, text).unwrap();
        doc.commit();
        let blob = doc.snapshot().unwrap();
        (doc, blob)
    }

    #[tokio::test]
    async fn memory_storage_ranges_are_prefix_scans() {
        let storage = MemoryStorage::new();
        storage
            .save(&["a".into(), "snapshot".into()], b"1")
            .await
            .unwrap();
        storage
            .save(&["a".into(), "incremental".into(), "0".into()], b"2")
            .await
            .unwrap();
        storage
            .save(&["b".into(), "snapshot".into()], b"3")
            .await
            .unwrap();

        let a_entries = storage.load_range(&["a".into()]).await.unwrap();
        assert_eq!(a_entries.len(), 2);

        storage
            .remove_range(&["a".into(), "incremental".into()])
            .await
            .unwrap();
        let a_entries = storage.load_range(&["a".into()]).await.unwrap();
        assert_eq!(a_entries.len(), 1);
    }

    #[tokio::test]
    async fn establishment_answers_with_identity_and_directory() {
        let storage = MemoryStorage::new();
        storage
            .save(&["doc-1".into(), "snapshot".into()], b"blob")
            .await
            .unwrap();
        let mut service = service(&storage, 64);

        let replies = service
            .handle_message(ChannelMsg::EstablishRequest {
                identity: storage_identity("repo"),
            })
            .await;
        assert_matches!(replies[0], ChannelMsg::EstablishResponse { .. });
        assert_matches!(
            &replies[1],
            ChannelMsg::DirectoryResponse { doc_ids } if doc_ids == &vec![DocId::new("doc-1")]
        );
    }

    #[tokio::test]
    async fn stored_documents_survive_a_new_service() {
        let storage = MemoryStorage::new();
        let doc_id = DocId::new("doc");
        let (_, blob) = update_blob("persisted");

        let mut first = service(&storage, 64);
        first
            .handle_message(ChannelMsg::SyncResponse {
                doc_id: doc_id.clone(),
                transmission: Transmission::Update { data: blob },
                ephemeral: None,
            })
            .await;

        // A fresh service over the same storage serves the content back.
        let mut second = service(&storage, 64);
        let replies = second
            .handle_message(ChannelMsg::SyncRequest {
                docs: vec![DocVersionRequest {
                    doc_id: doc_id.clone(),
                    requester_doc_version: vec![],
                }],
                bidirectional: false,
                include_ephemeral: false,
            })
            .await;
        let ChannelMsg::SyncResponse {
            transmission: Transmission::Snapshot { data, .. },
            ..
        } = &replies[0]
        else {
            panic!("expected a snapshot, got {replies:?}");
        };
        let restored = Document::load(data).unwrap();
        assert_eq!(restored.inner().get_text("title").to_string(), "persisted");
    }

    #[tokio::test]
    async fn unknown_documents_are_unavailable() {
        let storage = MemoryStorage::new();
        let mut service = service(&storage, 64);
        let replies = service
            .handle_message(ChannelMsg::SyncRequest {
                docs: vec![DocVersionRequest {
                    doc_id: DocId::new("missing"),
                    requester_doc_version: vec![],
                }],
                bidirectional: false,
                include_ephemeral: false,
            })
            .await;
        assert_matches!(
            &replies[0],
            ChannelMsg::SyncResponse {
                transmission: Transmission::Unavailable,
                ..
            }
        );
    }

    #[tokio::test]
    async fn incrementals_compact_into_a_snapshot() {
        let storage = MemoryStorage::new();
        let doc_id = DocId::new("doc");
        let mut service = service(&storage, 2);

        let doc = Document::new();
        for text in ["a", "b"] {
            doc.inner().get_text("title").insert(0, text).unwrap();
            doc.commit();
            let blob = doc.snapshot().unwrap();
            service
                .handle_message(ChannelMsg::SyncResponse {
                    doc_id: doc_id.clone(),
                    transmission: Transmission::Update { data: blob },
                    ephemeral: None,
                })
                .await;
        }

        // Two blobs hit the threshold: one snapshot, no incrementals left.
        assert!(storage
            .load(&snapshot_key(&doc_id))
            .await
            .unwrap()
            .is_some());
        assert!(storage
            .load_range(&incremental_prefix(&doc_id))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn announcements_trigger_requests_for_missing_docs() {
        let storage = MemoryStorage::new();
        let mut service = service(&storage, 64);
        let replies = service
            .handle_message(ChannelMsg::DirectoryResponse {
                doc_ids: vec![DocId::new("announced")],
            })
            .await;
        assert_matches!(
            &replies[0],
            ChannelMsg::SyncRequest { docs, bidirectional: false, .. }
                if docs[0].requester_doc_version.is_empty()
        );
    }
}
