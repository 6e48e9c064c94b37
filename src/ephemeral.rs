// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Namespaced presence data: cursors, selections, and whatever else should
//! reach other peers quickly but must never be persisted.
//!
//! Each document can carry several namespaces. Within a namespace every peer
//! owns its own set of keys; merging is last-writer-wins per peer, so
//! applying remote state can never clobber what other peers said.

use crate::types::{DocId, PeerId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// What travels inside an ephemeral wire message: one peer's current
/// entries for one namespace. Values are JSON, encoded as strings because
/// the wire format is not self-describing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralUpdate {
    pub peer_id: PeerId,
    pub entries: Vec<(String, String)>,
}

impl EphemeralUpdate {
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).context("Failed to encode ephemeral update")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).context("Failed to decode ephemeral update")
    }
}

/// Emitted whenever presence data changes. `peer_id` is `None` for local
/// changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EphemeralChange {
    pub doc_id: DocId,
    pub namespace: String,
    pub peer_id: Option<PeerId>,
}

#[derive(Debug, Default)]
struct NamespaceState {
    local: HashMap<String, Value>,
    peers: HashMap<PeerId, HashMap<String, Value>>,
}

/// All presence data of one repo, keyed by `(document, namespace)`.
pub struct EphemeralStore {
    self_peer: PeerId,
    namespaces: Mutex<HashMap<(DocId, String), NamespaceState>>,
    change_tx: broadcast::Sender<EphemeralChange>,
}

impl EphemeralStore {
    pub fn new(self_peer: PeerId) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            self_peer,
            namespaces: Mutex::new(HashMap::new()),
            change_tx,
        }
    }

    pub fn changes(&self) -> broadcast::Receiver<EphemeralChange> {
        self.change_tx.subscribe()
    }

    /// Fans a change event out to subscribers. Mutations themselves stay
    /// silent; the synchronizer decides when observers hear about them, so
    /// events arrive in the same order as the state transitions.
    pub fn notify(&self, change: EphemeralChange) {
        let _ = self.change_tx.send(change);
    }

    fn with_namespace<T>(
        &self,
        doc_id: &DocId,
        namespace: &str,
        f: impl FnOnce(&mut NamespaceState) -> T,
    ) -> T {
        let mut namespaces = self.namespaces.lock().expect("ephemeral lock poisoned");
        let state = namespaces
            .entry((doc_id.clone(), namespace.to_string()))
            .or_default();
        f(state)
    }

    /// Sets one local key. Returns whether anything actually changed.
    pub fn set_local(&self, doc_id: &DocId, namespace: &str, key: &str, value: Value) -> bool {
        self.with_namespace(doc_id, namespace, |state| {
            if state.local.get(key) == Some(&value) {
                false
            } else {
                state.local.insert(key.to_string(), value);
                true
            }
        })
    }

    pub fn local_entry(&self, doc_id: &DocId, namespace: &str, key: &str) -> Option<Value> {
        self.with_namespace(doc_id, namespace, |state| state.local.get(key).cloned())
    }

    /// The local state as it would travel on the wire. `None` while we have
    /// nothing to say.
    pub fn encode_local(&self, doc_id: &DocId, namespace: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.with_namespace(doc_id, namespace, |state| {
            state
                .local
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect::<Vec<_>>()
        });
        if entries.is_empty() {
            return Ok(None);
        }
        let update = EphemeralUpdate {
            peer_id: self.self_peer.clone(),
            entries,
        };
        update.encode().map(Some)
    }

    /// Every namespace of a document that currently has local state.
    pub fn local_namespaces(&self, doc_id: &DocId) -> Vec<String> {
        let namespaces = self.namespaces.lock().expect("ephemeral lock poisoned");
        namespaces
            .iter()
            .filter(|((id, _), state)| id == doc_id && !state.local.is_empty())
            .map(|((_, namespace), _)| namespace.clone())
            .collect()
    }

    /// Applies a remote peer's state. Returns the peer the data belongs to,
    /// so the synchronizer can track its liveness.
    pub fn apply_remote(&self, doc_id: &DocId, namespace: &str, data: &[u8]) -> Result<PeerId> {
        let update = EphemeralUpdate::decode(data)?;
        let mut entries = HashMap::new();
        for (key, json) in update.entries {
            let value: Value = serde_json::from_str(&json)
                .with_context(|| format!("Malformed ephemeral value for key {key}"))?;
            entries.insert(key, value);
        }

        self.with_namespace(doc_id, namespace, |state| {
            state.peers.insert(update.peer_id.clone(), entries);
        });
        Ok(update.peer_id)
    }

    /// Drops everything a peer ever said about a document, across all of
    /// its namespaces. Returns the namespaces that actually held state.
    pub fn remove_peer(&self, doc_id: &DocId, peer_id: &PeerId) -> Vec<String> {
        let mut namespaces = self.namespaces.lock().expect("ephemeral lock poisoned");
        let mut touched = Vec::new();
        for ((id, namespace), state) in namespaces.iter_mut() {
            if id == doc_id && state.peers.remove(peer_id).is_some() {
                touched.push(namespace.clone());
            }
        }
        touched
    }

    pub fn remove_doc(&self, doc_id: &DocId) {
        let mut namespaces = self.namespaces.lock().expect("ephemeral lock poisoned");
        namespaces.retain(|(id, _), _| id != doc_id);
    }

    pub fn peer_entry(
        &self,
        doc_id: &DocId,
        namespace: &str,
        peer_id: &PeerId,
        key: &str,
    ) -> Option<Value> {
        self.with_namespace(doc_id, namespace, |state| {
            state.peers.get(peer_id)?.get(key).cloned()
        })
    }

    /// Merged view over all peers, our own entries included.
    pub fn all_entries(&self, doc_id: &DocId, namespace: &str) -> HashMap<PeerId, HashMap<String, Value>> {
        self.with_namespace(doc_id, namespace, |state| {
            let mut all = state.peers.clone();
            if !state.local.is_empty() {
                all.insert(self.self_peer.clone(), state.local.clone());
            }
            all
        })
    }

    pub fn peers(&self, doc_id: &DocId, namespace: &str) -> Vec<PeerId> {
        self.with_namespace(doc_id, namespace, |state| {
            state.peers.keys().cloned().collect()
        })
    }

    pub fn self_peer(&self) -> &PeerId {
        &self.self_peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> EphemeralStore {
        EphemeralStore::new(PeerId::new("self"))
    }

    #[test]
    fn local_state_round_trips_through_the_wire_encoding() {
        let sender = store();
        let doc = DocId::new("doc");
        sender.set_local(&doc, "cursors", "position", json!({ "x": 1, "y": 2 }));

        let encoded = sender.encode_local(&doc, "cursors").unwrap().unwrap();

        let receiver = EphemeralStore::new(PeerId::new("other"));
        let from = receiver.apply_remote(&doc, "cursors", &encoded).unwrap();
        assert_eq!(from, PeerId::new("self"));
        assert_eq!(
            receiver.peer_entry(&doc, "cursors", &from, "position"),
            Some(json!({ "x": 1, "y": 2 }))
        );
    }

    #[test]
    fn unchanged_values_do_not_report_a_change() {
        let s = store();
        let doc = DocId::new("doc");
        assert!(s.set_local(&doc, "cursors", "k", json!(1)));
        assert!(!s.set_local(&doc, "cursors", "k", json!(1)));
        assert!(s.set_local(&doc, "cursors", "k", json!(2)));
    }

    #[test]
    fn empty_local_state_encodes_to_nothing() {
        let s = store();
        let doc = DocId::new("doc");
        assert!(s.encode_local(&doc, "cursors").unwrap().is_none());
    }

    #[test]
    fn removing_a_peer_clears_all_namespaces() {
        let s = store();
        let doc = DocId::new("doc");
        let update = EphemeralUpdate {
            peer_id: PeerId::new("gone"),
            entries: vec![("k".to_string(), "1".to_string())],
        };
        let bytes = update.encode().unwrap();
        s.apply_remote(&doc, "cursors", &bytes).unwrap();
        s.apply_remote(&doc, "selections", &bytes).unwrap();
        assert_eq!(s.peers(&doc, "cursors").len(), 1);

        let mut touched = s.remove_peer(&doc, &PeerId::new("gone"));
        touched.sort();
        assert_eq!(touched, vec!["cursors", "selections"]);
        assert!(s.peers(&doc, "cursors").is_empty());
        assert!(s.peers(&doc, "selections").is_empty());
    }

    #[test]
    fn all_entries_includes_self() {
        let s = store();
        let doc = DocId::new("doc");
        s.set_local(&doc, "cursors", "k", json!("mine"));
        let all = s.all_entries(&doc, "cursors");
        assert_eq!(all.len(), 1);
        assert_eq!(all[&PeerId::new("self")]["k"], json!("mine"));
    }

    #[test]
    fn mutations_are_silent_until_notified() {
        let s = store();
        let mut changes = s.changes();
        let doc = DocId::new("doc");

        s.set_local(&doc, "cursors", "k", json!(1));
        assert!(changes.try_recv().is_err());

        s.notify(EphemeralChange {
            doc_id: doc.clone(),
            namespace: "cursors".to_string(),
            peer_id: None,
        });
        let change = changes.try_recv().unwrap();
        assert_eq!(change.peer_id, None);
        assert_eq!(change.doc_id, doc);
    }
}
