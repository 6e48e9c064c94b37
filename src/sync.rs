// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The synchronizer proper: a state machine that decides which documents
//! flow where.
//!
//! It is written as a reducer: every call to [`Synchronizer::handle`] takes
//! one input, updates the model, and returns the side effects as commands.
//! It performs no I/O, never suspends and never fails; everything impure
//! lives in the command executor. That keeps the protocol logic testable
//! with plain function calls.

use crate::channel::{ChannelInfo, ChannelPeer};
use crate::config::RepoConfig;
use crate::document::{decode_version, Document};
use crate::rules::{Awareness, DocChannelSnapshot, RuleContext, SyncRules};
use crate::types::{
    AdapterId, AddressedEnvelope, ChannelId, ChannelKind, ChannelMsg, ChannelReadyState, DocId,
    DocReadyState, DocVersionRequest, EphemeralMessage, LoadState, PeerId, PeerIdentity,
    ReturnEnvelope, Transmission,
};
use loro::VersionVector;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything that can happen to the synchronizer. Adapters, handles and
/// timers all funnel through this one type, posted onto a single mailbox.
#[derive(Debug)]
pub enum Input {
    ChannelAdded {
        channel_id: ChannelId,
        kind: ChannelKind,
        adapter_id: AdapterId,
        initiator: bool,
    },
    /// The adapter finished its transport-level handshake; the channel may
    /// now speak.
    EstablishChannel { channel_id: ChannelId },
    ChannelRemoved { channel_id: ChannelId },
    DocEnsure {
        doc_id: DocId,
        doc: Arc<Document>,
    },
    LocalDocChange { doc_id: DocId },
    DocDelete {
        doc_id: DocId,
        requested_by: Option<ChannelId>,
    },
    /// The executor finished importing remote data into a document.
    DocImported {
        doc_id: DocId,
        channel_id: ChannelId,
        success: bool,
    },
    ChannelReceiveMessage(ReturnEnvelope),
    Heartbeat { now_ms: u64 },
    EphemeralLocalChange { doc_id: DocId, namespace: String },
}

/// Side effects the reducer wants. The executor interprets these in order.
#[derive(Debug)]
pub enum Command {
    SendMessage(AddressedEnvelope),
    SendEstablishmentMessage(AddressedEnvelope),
    SendSyncRequest {
        to: ChannelId,
        docs: Vec<DocVersionRequest>,
        bidirectional: bool,
        include_ephemeral: bool,
    },
    SendSyncResponse {
        to: ChannelId,
        doc_id: DocId,
        transmission: Transmission,
        include_ephemeral: bool,
    },
    StopChannel { channel_id: ChannelId },
    SubscribeDoc { doc_id: DocId, doc: Arc<Document> },
    ImportDocData {
        channel_id: ChannelId,
        peer_id: PeerId,
        doc_id: DocId,
        doc: Arc<Document>,
        data: Vec<u8>,
    },
    ApplyEphemeral {
        from_channel_id: ChannelId,
        doc_id: DocId,
        namespace: String,
        data: Vec<u8>,
    },
    /// Flush our own presence state to these channels. `None` means every
    /// namespace that currently has local state.
    BroadcastEphemeralState {
        to_channel_ids: Vec<ChannelId>,
        doc_id: DocId,
        namespace: Option<String>,
    },
    /// Forward somebody else's presence message, hop count already
    /// decremented.
    BroadcastEphemeralRelay {
        to_channel_ids: Vec<ChannelId>,
        message: EphemeralMessage,
    },
    RemoveEphemeralPeer { doc_id: DocId, peer_id: PeerId },
    EmitReadyStateChanged {
        doc_id: DocId,
        state: DocReadyState,
    },
    EmitEphemeralChange {
        doc_id: DocId,
        namespace: String,
        peer_id: Option<PeerId>,
    },
    Dispatch(Box<Input>),
    Batch(Vec<Command>),
}

/// What we believe about one remote peer, shared across all channels that
/// resolve to it. Survives channel removal, so a reconnecting peer does not
/// get a redundant snapshot.
#[derive(Debug, Default)]
pub struct PeerState {
    /// Per document, the newest version we have evidence the peer holds.
    /// Monotone non-decreasing under the version vector partial order.
    last_known_version: HashMap<DocId, VersionVector>,
    /// Per document, when we last saw presence data from this peer
    /// (in heartbeat-tick milliseconds).
    ephemeral_seen: HashMap<DocId, u64>,
}

#[derive(Debug, Clone)]
enum DocLoad {
    Loading,
    Found(VersionVector),
    NotFound,
    Aware,
}

impl DocLoad {
    fn project(&self) -> LoadState {
        match self {
            Self::Loading => LoadState::Loading,
            Self::Found(_) => LoadState::Found,
            Self::NotFound => LoadState::NotFound,
            Self::Aware => LoadState::Aware,
        }
    }
}

#[derive(Debug)]
struct DocChannelState {
    awareness: Awareness,
    load: DocLoad,
    /// At most one sync-request per (doc, channel) is in flight; further
    /// wishes fold into `pending_request`.
    request_in_flight: bool,
    /// Heartbeats seen while the request was out. A request that survives
    /// two ticks is considered lost and expires.
    request_ticks: u8,
    pending_request: bool,
    /// A failed import poisons this pairing until the channel goes away.
    errored: bool,
}

impl Default for DocChannelState {
    fn default() -> Self {
        Self {
            awareness: Awareness::Unknown,
            load: DocLoad::Aware,
            request_in_flight: false,
            request_ticks: 0,
            pending_request: false,
            errored: false,
        }
    }
}

impl DocChannelState {
    fn clear_in_flight(&mut self) {
        self.request_in_flight = false;
        self.request_ticks = 0;
    }
}

#[derive(Debug)]
struct DocState {
    doc: Arc<Document>,
    channels: HashMap<ChannelId, DocChannelState>,
}

impl DocState {
    fn new(doc: Arc<Document>) -> Self {
        Self {
            doc,
            channels: HashMap::new(),
        }
    }
}

/// Componentwise maximum, so recorded peer versions only ever grow.
fn merge_version(old: &mut VersionVector, new: &VersionVector) {
    for (peer, counter) in new.iter() {
        let entry = old.entry(*peer).or_insert(0);
        if *entry < *counter {
            *entry = *counter;
        }
    }
}

pub struct Synchronizer {
    identity: PeerIdentity,
    config: RepoConfig,
    rules: Arc<dyn SyncRules>,
    channels: HashMap<ChannelId, ChannelInfo>,
    peers: HashMap<PeerId, PeerState>,
    docs: HashMap<DocId, DocState>,
    /// Wall clock as of the last heartbeat. The reducer never reads the
    /// clock itself; presence staleness is judged at heartbeat granularity.
    now_ms: u64,
}

impl Synchronizer {
    pub fn new(identity: PeerIdentity, config: RepoConfig, rules: Arc<dyn SyncRules>) -> Self {
        Self {
            identity,
            config,
            rules,
            channels: HashMap::new(),
            peers: HashMap::new(),
            docs: HashMap::new(),
            now_ms: 0,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn has_doc(&self, doc_id: &DocId) -> bool {
        self.docs.contains_key(doc_id)
    }

    pub fn doc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self.docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn doc(&self, doc_id: &DocId) -> Option<Arc<Document>> {
        self.docs.get(doc_id).map(|state| Arc::clone(&state.doc))
    }

    pub fn channel(&self, channel_id: ChannelId) -> Option<&ChannelInfo> {
        self.channels.get(&channel_id)
    }

    pub fn ready_state(&self, doc_id: &DocId) -> DocReadyState {
        self.docs
            .get(doc_id)
            .map_or_else(DocReadyState::default, |doc_state| {
                self.project_ready_state(doc_state)
            })
    }

    fn project_ready_state(&self, doc_state: &DocState) -> DocReadyState {
        let mut channels: Vec<ChannelReadyState> = doc_state
            .channels
            .iter()
            .filter_map(|(channel_id, state)| {
                let info = self.channels.get(channel_id)?;
                Some(ChannelReadyState {
                    channel_id: *channel_id,
                    kind: info.kind,
                    load: state.load.project(),
                })
            })
            .collect();
        channels.sort_by_key(|c| c.channel_id);
        DocReadyState {
            channels,
            removed: false,
        }
    }

    fn emit_ready(&self, doc_id: &DocId) -> Command {
        Command::EmitReadyStateChanged {
            doc_id: doc_id.clone(),
            state: self.ready_state(doc_id),
        }
    }

    /// Whether this channel passes a rule. Storage channels always do.
    fn passes(
        &self,
        rule: fn(&dyn SyncRules, &RuleContext) -> bool,
        info: &ChannelInfo,
        doc_id: &DocId,
        doc_state: &DocState,
    ) -> bool {
        if info.kind == ChannelKind::Storage {
            return true;
        }
        let snapshot = doc_state.channels.get(&info.channel_id).map_or(
            DocChannelSnapshot {
                awareness: Awareness::Unknown,
                load: LoadState::Aware,
            },
            |state| DocChannelSnapshot {
                awareness: state.awareness,
                load: state.load.project(),
            },
        );
        let ctx = RuleContext {
            peer_name: info.peer_name(),
            channel_id: info.channel_id,
            doc_id,
            doc: &doc_state.doc,
            doc_channel_state: snapshot,
        };
        rule(self.rules.as_ref(), &ctx)
    }

    fn can_reveal(&self, info: &ChannelInfo, doc_id: &DocId, doc_state: &DocState) -> bool {
        let rule: fn(&dyn SyncRules, &RuleContext) -> bool = |rules, ctx| rules.can_reveal(ctx);
        self.passes(rule, info, doc_id, doc_state)
    }

    fn can_update(&self, info: &ChannelInfo, doc_id: &DocId, doc_state: &DocState) -> bool {
        let rule: fn(&dyn SyncRules, &RuleContext) -> bool = |rules, ctx| rules.can_update(ctx);
        self.passes(rule, info, doc_id, doc_state)
    }

    fn can_delete(&self, info: &ChannelInfo, doc_id: &DocId, doc_state: &DocState) -> bool {
        let rule: fn(&dyn SyncRules, &RuleContext) -> bool = |rules, ctx| rules.can_delete(ctx);
        self.passes(rule, info, doc_id, doc_state)
    }

    /// One input in, zero or more commands out.
    pub fn handle(&mut self, input: Input) -> Vec<Command> {
        match input {
            Input::ChannelAdded {
                channel_id,
                kind,
                adapter_id,
                initiator,
            } => self.on_channel_added(channel_id, kind, adapter_id, initiator),
            Input::EstablishChannel { channel_id } => self.on_establish_channel(channel_id),
            Input::ChannelRemoved { channel_id } => self.on_channel_removed(channel_id),
            Input::DocEnsure { doc_id, doc } => self.on_doc_ensure(doc_id, doc),
            Input::LocalDocChange { doc_id } => self.on_local_doc_change(&doc_id),
            Input::DocDelete {
                doc_id,
                requested_by,
            } => self.on_doc_delete(&doc_id, requested_by),
            Input::DocImported {
                doc_id,
                channel_id,
                success,
            } => self.on_doc_imported(&doc_id, channel_id, success),
            Input::ChannelReceiveMessage(envelope) => self.on_receive(envelope),
            Input::Heartbeat { now_ms } => self.on_heartbeat(now_ms),
            Input::EphemeralLocalChange { doc_id, namespace } => {
                self.on_ephemeral_local_change(&doc_id, &namespace)
            }
        }
    }

    fn on_channel_added(
        &mut self,
        channel_id: ChannelId,
        kind: ChannelKind,
        adapter_id: AdapterId,
        initiator: bool,
    ) -> Vec<Command> {
        debug!(%channel_id, %kind, %adapter_id, "Channel added");
        self.channels
            .insert(channel_id, ChannelInfo::new(channel_id, kind, adapter_id, initiator));
        vec![]
    }

    fn on_establish_channel(&mut self, channel_id: ChannelId) -> Vec<Command> {
        let Some(info) = self.channels.get(&channel_id) else {
            warn!(%channel_id, "Establish requested for unknown channel");
            return vec![];
        };
        if !info.initiator {
            // The accepting side waits for the peer's establish-request.
            return vec![];
        }
        vec![Command::SendEstablishmentMessage(AddressedEnvelope::to_one(
            channel_id,
            ChannelMsg::EstablishRequest {
                identity: self.identity.clone(),
            },
        ))]
    }

    fn on_channel_removed(&mut self, channel_id: ChannelId) -> Vec<Command> {
        if self.channels.remove(&channel_id).is_none() {
            return vec![];
        }
        info!(%channel_id, "Channel removed");
        let mut commands = vec![];
        let affected: Vec<DocId> = self
            .docs
            .iter_mut()
            .filter_map(|(doc_id, doc_state)| {
                doc_state
                    .channels
                    .remove(&channel_id)
                    .map(|_| doc_id.clone())
            })
            .collect();
        for doc_id in affected {
            commands.push(self.emit_ready(&doc_id));
        }
        commands
    }

    fn on_doc_ensure(&mut self, doc_id: DocId, doc: Arc<Document>) -> Vec<Command> {
        if self.docs.contains_key(&doc_id) {
            return vec![];
        }
        debug!(%doc_id, "Tracking document");
        self.docs.insert(doc_id.clone(), DocState::new(Arc::clone(&doc)));

        let mut commands = vec![Command::SubscribeDoc {
            doc_id: doc_id.clone(),
            doc,
        }];
        commands.extend(self.offer_doc_to_established_channels(&doc_id));
        commands.push(self.emit_ready(&doc_id));
        commands
    }

    /// Announces a freshly tracked doc on every established channel that
    /// may see it, and asks each of them for their copy.
    fn offer_doc_to_established_channels(&mut self, doc_id: &DocId) -> Vec<Command> {
        let mut commands = vec![];
        let channel_ids: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|info| info.is_established())
            .map(|info| info.channel_id)
            .collect();
        for channel_id in channel_ids {
            let info = &self.channels[&channel_id];
            let doc_state = &self.docs[doc_id];
            if !self.can_reveal(info, doc_id, doc_state) {
                continue;
            }
            commands.push(Command::SendMessage(AddressedEnvelope::to_one(
                channel_id,
                ChannelMsg::DirectoryResponse {
                    doc_ids: vec![doc_id.clone()],
                },
            )));
            commands.extend(self.request_sync(channel_id, doc_id, true, true));
        }
        commands
    }

    /// Issues a sync-request for one doc on one channel, honoring the
    /// single-in-flight rule.
    fn request_sync(
        &mut self,
        channel_id: ChannelId,
        doc_id: &DocId,
        bidirectional: bool,
        include_ephemeral: bool,
    ) -> Vec<Command> {
        let Some(doc_state) = self.docs.get_mut(doc_id) else {
            return vec![];
        };
        let version = doc_state.doc.encoded_version();
        let channel_state = doc_state.channels.entry(channel_id).or_default();
        if channel_state.awareness == Awareness::Unknown {
            channel_state.awareness = Awareness::HasDoc;
        }
        if channel_state.request_in_flight {
            channel_state.pending_request = true;
            return vec![];
        }
        channel_state.request_in_flight = true;
        channel_state.request_ticks = 0;
        if !matches!(channel_state.load, DocLoad::Found(_)) {
            channel_state.load = DocLoad::Loading;
        }
        vec![Command::SendSyncRequest {
            to: channel_id,
            docs: vec![DocVersionRequest {
                doc_id: doc_id.clone(),
                requester_doc_version: version,
            }],
            bidirectional,
            include_ephemeral,
        }]
    }

    fn on_local_doc_change(&mut self, doc_id: &DocId) -> Vec<Command> {
        let Some(doc_state) = self.docs.get(doc_id) else {
            return vec![];
        };
        let current_version = doc_state.doc.version();

        // Decide per channel before touching any state.
        let mut reveals: Vec<ChannelId> = vec![];
        let mut updates: Vec<(ChannelId, PeerId)> = vec![];
        for info in self.channels.values() {
            if !info.is_established() {
                continue;
            }
            let Some(peer_id) = info.peer_id() else {
                continue;
            };
            let channel_state = doc_state.channels.get(&info.channel_id);
            let awareness = channel_state.map_or(Awareness::Unknown, |s| s.awareness);
            match awareness {
                Awareness::HasDoc => {
                    if self.can_update(info, doc_id, doc_state) {
                        updates.push((info.channel_id, peer_id.clone()));
                    }
                }
                Awareness::Unknown => {
                    // A change can flip canReveal; announce before sending.
                    if self.can_reveal(info, doc_id, doc_state)
                        && self.can_update(info, doc_id, doc_state)
                    {
                        reveals.push(info.channel_id);
                        updates.push((info.channel_id, peer_id.clone()));
                    }
                }
                Awareness::NoDoc => {}
            }
        }

        let mut commands = vec![];
        for channel_id in &reveals {
            let doc_state = self.docs.get_mut(doc_id).expect("checked above");
            doc_state.channels.entry(*channel_id).or_default().awareness = Awareness::HasDoc;
            commands.push(Command::SendMessage(AddressedEnvelope::to_one(
                *channel_id,
                ChannelMsg::DirectoryResponse {
                    doc_ids: vec![doc_id.clone()],
                },
            )));
        }

        for (channel_id, peer_id) in updates {
            let peer = self.peers.entry(peer_id).or_default();
            let last_known = peer
                .last_known_version
                .entry(doc_id.clone())
                .or_insert_with(VersionVector::new);
            let doc_state = &self.docs[doc_id];
            if !doc_state.doc.has_news_for(last_known) {
                continue;
            }
            let Ok(data) = doc_state.doc.updates_since(last_known) else {
                warn!(%doc_id, "Failed to export update, skipping channel");
                continue;
            };
            merge_version(last_known, &current_version);
            commands.push(Command::SendSyncResponse {
                to: channel_id,
                doc_id: doc_id.clone(),
                transmission: Transmission::Update { data },
                include_ephemeral: false,
            });
        }
        commands
    }

    fn on_doc_delete(&mut self, doc_id: &DocId, requested_by: Option<ChannelId>) -> Vec<Command> {
        let Some(doc_state) = self.docs.get(doc_id) else {
            return vec![];
        };
        if let Some(channel_id) = requested_by {
            let Some(info) = self.channels.get(&channel_id) else {
                return vec![];
            };
            if !self.can_delete(info, doc_id, doc_state) {
                warn!(%doc_id, %channel_id, "Remote deletion denied by rules");
                return vec![];
            }
        }
        info!(%doc_id, "Deleting document");
        self.docs.remove(doc_id);
        vec![Command::EmitReadyStateChanged {
            doc_id: doc_id.clone(),
            state: DocReadyState {
                channels: vec![],
                removed: true,
            },
        }]
    }

    fn on_doc_imported(
        &mut self,
        doc_id: &DocId,
        channel_id: ChannelId,
        success: bool,
    ) -> Vec<Command> {
        let Some(doc_state) = self.docs.get_mut(doc_id) else {
            return vec![];
        };
        let current_version = doc_state.doc.version();
        let channel_state = doc_state.channels.entry(channel_id).or_default();
        channel_state.clear_in_flight();

        if !success {
            warn!(%doc_id, %channel_id, "Import failed, marking doc-channel pairing errored");
            channel_state.errored = true;
            channel_state.load = DocLoad::NotFound;
            return vec![self.emit_ready(doc_id)];
        }

        channel_state.awareness = Awareness::HasDoc;
        channel_state.load = DocLoad::Found(current_version.clone());
        let retry = std::mem::take(&mut channel_state.pending_request);

        // Echo prevention: everything the peer sent is now part of our own
        // version, so record that they hold at least this much. Exporting
        // "since last known" will be empty until a genuinely new local op.
        if let Some(peer_id) = self
            .channels
            .get(&channel_id)
            .and_then(|info| info.peer_id().cloned())
        {
            let peer = self.peers.entry(peer_id).or_default();
            let last_known = peer
                .last_known_version
                .entry(doc_id.clone())
                .or_insert_with(VersionVector::new);
            merge_version(last_known, &current_version);
        }

        let mut commands = vec![self.emit_ready(doc_id)];
        if retry {
            commands.extend(self.request_sync(channel_id, doc_id, false, false));
        }
        // Imported ops must travel on to every other interested channel.
        // The change subscription only covers local commits, and echo
        // prevention keeps this from bouncing back to the origin.
        commands.extend(self.on_local_doc_change(doc_id));
        commands
    }

    fn on_heartbeat(&mut self, now_ms: u64) -> Vec<Command> {
        self.now_ms = now_ms;
        let stale_after = self.config.ephemeral_stale_window.as_millis() as u64;
        let mut commands = vec![];

        // Evict presence from peers we have not heard of in a while.
        for (peer_id, peer) in &mut self.peers {
            peer.ephemeral_seen.retain(|doc_id, seen| {
                let stale = now_ms.saturating_sub(*seen) >= stale_after;
                if stale {
                    debug!(%peer_id, %doc_id, "Evicting stale presence");
                    commands.push(Command::RemoveEphemeralPeer {
                        doc_id: doc_id.clone(),
                        peer_id: peer_id.clone(),
                    });
                }
                !stale
            });
        }

        // Wire-level keepalive for established network channels.
        let keepalive: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|info| info.is_established() && info.kind == ChannelKind::Network)
            .map(|info| info.channel_id)
            .collect();
        if !keepalive.is_empty() {
            commands.push(Command::SendMessage(AddressedEnvelope {
                to_channel_ids: keepalive,
                message: ChannelMsg::Heartbeat,
            }));
        }

        // Presence must be refreshed within the stale window, or peers
        // will rightfully evict us.
        let flushes: Vec<(DocId, Vec<ChannelId>)> = self
            .docs
            .iter()
            .map(|(doc_id, doc_state)| (doc_id.clone(), self.ephemeral_targets(doc_id, doc_state)))
            .filter(|(_, targets)| !targets.is_empty())
            .collect();
        for (doc_id, to_channel_ids) in flushes {
            commands.push(Command::BroadcastEphemeralState {
                to_channel_ids,
                doc_id,
                namespace: None,
            });
        }

        // Requests whose response never came (lost frame, middleware
        // rejection on the far side) expire after two ticks, so the
        // pairing does not stay wedged.
        for doc_state in self.docs.values_mut() {
            for state in doc_state.channels.values_mut() {
                if state.request_in_flight {
                    state.request_ticks = state.request_ticks.saturating_add(1);
                    if state.request_ticks >= 2 {
                        state.clear_in_flight();
                    }
                }
            }
        }

        // Anti-entropy: reconfirm versions on every active pairing, so a
        // hole torn by a dropped message heals on the next tick. In the
        // steady state this costs one up-to-date reply per doc.
        let pairs: Vec<(ChannelId, DocId)> = self
            .docs
            .iter()
            .flat_map(|(doc_id, doc_state)| {
                doc_state
                    .channels
                    .iter()
                    .filter(|(channel_id, state)| {
                        matches!(state.load, DocLoad::Found(_) | DocLoad::Loading)
                            && !state.request_in_flight
                            && !state.errored
                            && self
                                .channels
                                .get(channel_id)
                                .is_some_and(ChannelInfo::is_established)
                    })
                    .map(|(channel_id, _)| (*channel_id, doc_id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (channel_id, doc_id) in pairs {
            commands.extend(self.request_sync(channel_id, &doc_id, false, false));
        }
        commands
    }

    fn on_ephemeral_local_change(&mut self, doc_id: &DocId, namespace: &str) -> Vec<Command> {
        let Some(doc_state) = self.docs.get(doc_id) else {
            return vec![];
        };
        // Presence is never persisted, so storage channels are left out.
        let targets = self.ephemeral_targets(doc_id, doc_state);

        let mut commands = vec![Command::EmitEphemeralChange {
            doc_id: doc_id.clone(),
            namespace: namespace.to_string(),
            peer_id: None,
        }];
        if !targets.is_empty() {
            commands.push(Command::BroadcastEphemeralState {
                to_channel_ids: targets,
                doc_id: doc_id.clone(),
                namespace: Some(namespace.to_string()),
            });
        }
        commands
    }

    /// Channels our presence for a doc should reach right now.
    fn ephemeral_targets(&self, doc_id: &DocId, doc_state: &DocState) -> Vec<ChannelId> {
        self.channels
            .values()
            .filter(|info| {
                info.is_established()
                    && info.kind == ChannelKind::Network
                    && doc_state
                        .channels
                        .get(&info.channel_id)
                        .is_some_and(|s| s.awareness == Awareness::HasDoc)
                    && self.can_update(info, doc_id, doc_state)
            })
            .map(|info| info.channel_id)
            .collect()
    }

    fn on_receive(&mut self, envelope: ReturnEnvelope) -> Vec<Command> {
        let channel_id = envelope.from_channel_id;
        if !self.channels.contains_key(&channel_id) {
            warn!(%channel_id, "Message from unknown channel, dropping");
            return vec![];
        }

        match envelope.message {
            ChannelMsg::EstablishRequest { identity } => {
                self.on_establish_request(channel_id, identity)
            }
            ChannelMsg::EstablishResponse { identity } => {
                self.on_establish_response(channel_id, identity)
            }
            message => {
                if !self.channels[&channel_id].is_established() {
                    warn!(
                        %channel_id,
                        kind = message.kind(),
                        "Application message on unestablished channel, dropping"
                    );
                    return vec![];
                }
                match message {
                    ChannelMsg::DirectoryRequest => self.on_directory_request(channel_id),
                    ChannelMsg::DirectoryResponse { doc_ids } => {
                        self.on_directory_response(channel_id, doc_ids)
                    }
                    ChannelMsg::SyncRequest {
                        docs,
                        bidirectional,
                        include_ephemeral,
                    } => self.on_sync_request(channel_id, docs, bidirectional, include_ephemeral),
                    ChannelMsg::SyncResponse {
                        doc_id,
                        transmission,
                        ephemeral,
                    } => self.on_sync_response(channel_id, &doc_id, transmission, ephemeral),
                    ChannelMsg::Ephemeral(message) => self.on_ephemeral(channel_id, message),
                    ChannelMsg::Heartbeat => vec![],
                    ChannelMsg::EstablishRequest { .. } | ChannelMsg::EstablishResponse { .. } => {
                        unreachable!("handled above")
                    }
                }
            }
        }
    }

    fn on_establish_request(
        &mut self,
        channel_id: ChannelId,
        identity: PeerIdentity,
    ) -> Vec<Command> {
        let info = self.channels.get_mut(&channel_id).expect("checked by caller");
        match &info.peer {
            ChannelPeer::Established(existing) if *existing == identity => {
                // Duplicate handshake; answer again, change nothing.
                return vec![Command::SendEstablishmentMessage(
                    AddressedEnvelope::to_one(
                        channel_id,
                        ChannelMsg::EstablishResponse {
                            identity: self.identity.clone(),
                        },
                    ),
                )];
            }
            ChannelPeer::Established(existing) => {
                warn!(
                    %channel_id,
                    old = %existing.peer_id,
                    new = %identity.peer_id,
                    "Identity changed on established channel, closing"
                );
                return vec![Command::StopChannel { channel_id }];
            }
            ChannelPeer::Connecting => {}
        }
        info!(%channel_id, peer = %identity.peer_id, name = %identity.name, "Channel established");
        info.peer = ChannelPeer::Established(identity);

        let mut commands = vec![Command::SendEstablishmentMessage(
            AddressedEnvelope::to_one(
                channel_id,
                ChannelMsg::EstablishResponse {
                    identity: self.identity.clone(),
                },
            ),
        )];
        commands.extend(self.on_channel_established(channel_id));
        commands
    }

    fn on_establish_response(
        &mut self,
        channel_id: ChannelId,
        identity: PeerIdentity,
    ) -> Vec<Command> {
        let info = self.channels.get_mut(&channel_id).expect("checked by caller");
        match &info.peer {
            ChannelPeer::Established(existing) if *existing == identity => return vec![],
            ChannelPeer::Established(existing) => {
                warn!(
                    %channel_id,
                    old = %existing.peer_id,
                    new = %identity.peer_id,
                    "Identity changed on established channel, closing"
                );
                return vec![Command::StopChannel { channel_id }];
            }
            ChannelPeer::Connecting => {}
        }
        info!(%channel_id, peer = %identity.peer_id, name = %identity.name, "Channel established");
        info.peer = ChannelPeer::Established(identity);
        self.on_channel_established(channel_id)
    }

    /// After establishment both sides recompute discovery: announce every
    /// doc the rules reveal, and ask the peer for its copies.
    fn on_channel_established(&mut self, channel_id: ChannelId) -> Vec<Command> {
        let doc_ids: Vec<DocId> = self.docs.keys().cloned().collect();
        let mut revealed = vec![];
        for doc_id in doc_ids {
            let info = &self.channels[&channel_id];
            let doc_state = &self.docs[&doc_id];
            if self.can_reveal(info, &doc_id, doc_state) {
                revealed.push(doc_id);
            }
        }

        let mut commands = vec![];
        if !revealed.is_empty() {
            // One aggregated announcement per establishment.
            commands.push(Command::SendMessage(AddressedEnvelope::to_one(
                channel_id,
                ChannelMsg::DirectoryResponse {
                    doc_ids: revealed.clone(),
                },
            )));

            let mut requests = vec![];
            for doc_id in &revealed {
                let doc_state = self.docs.get_mut(doc_id).expect("revealed docs exist");
                let version = doc_state.doc.encoded_version();
                let channel_state = doc_state.channels.entry(channel_id).or_default();
                channel_state.awareness = Awareness::HasDoc;
                if channel_state.request_in_flight {
                    channel_state.pending_request = true;
                    continue;
                }
                channel_state.request_in_flight = true;
                channel_state.request_ticks = 0;
                if !matches!(channel_state.load, DocLoad::Found(_)) {
                    channel_state.load = DocLoad::Loading;
                }
                requests.push(DocVersionRequest {
                    doc_id: doc_id.clone(),
                    requester_doc_version: version,
                });
            }
            if !requests.is_empty() {
                commands.push(Command::SendSyncRequest {
                    to: channel_id,
                    docs: requests,
                    bidirectional: true,
                    include_ephemeral: true,
                });
            }
            for doc_id in &revealed {
                commands.push(self.emit_ready(doc_id));
            }
        }
        commands
    }

    fn on_directory_request(&mut self, channel_id: ChannelId) -> Vec<Command> {
        let mut doc_ids = vec![];
        for (doc_id, doc_state) in &self.docs {
            let info = &self.channels[&channel_id];
            if self.can_reveal(info, doc_id, doc_state) {
                doc_ids.push(doc_id.clone());
            }
        }
        doc_ids.sort();
        vec![Command::SendMessage(AddressedEnvelope::to_one(
            channel_id,
            ChannelMsg::DirectoryResponse { doc_ids },
        ))]
    }

    fn on_directory_response(
        &mut self,
        channel_id: ChannelId,
        doc_ids: Vec<DocId>,
    ) -> Vec<Command> {
        let mut commands = vec![];
        for doc_id in doc_ids {
            let created = if self.docs.contains_key(&doc_id) {
                false
            } else {
                let doc = Arc::new(Document::new());
                self.docs
                    .insert(doc_id.clone(), DocState::new(Arc::clone(&doc)));
                commands.push(Command::SubscribeDoc {
                    doc_id: doc_id.clone(),
                    doc,
                });
                true
            };

            let doc_state = self.docs.get_mut(&doc_id).expect("inserted above");
            let channel_state = doc_state.channels.entry(channel_id).or_default();
            channel_state.awareness = Awareness::HasDoc;

            // The peer has it; fetch what we are missing.
            commands.extend(self.request_sync(channel_id, &doc_id, true, true));
            if created {
                commands.push(self.emit_ready(&doc_id));
            }
        }
        commands
    }

    fn on_sync_request(
        &mut self,
        channel_id: ChannelId,
        docs: Vec<DocVersionRequest>,
        bidirectional: bool,
        include_ephemeral: bool,
    ) -> Vec<Command> {
        let peer_id = self.channels[&channel_id]
            .peer_id()
            .cloned()
            .expect("established channels carry an identity");

        let mut commands = vec![];
        let mut counter_requests = vec![];
        let mut first_response = true;

        for DocVersionRequest {
            doc_id,
            requester_doc_version,
        } in docs
        {
            let Ok(requester_version) = decode_version(&requester_doc_version) else {
                warn!(%channel_id, %doc_id, "Malformed version vector in sync-request, dropping entry");
                continue;
            };

            let Some(doc_state) = self.docs.get(&doc_id) else {
                commands.push(Command::SendSyncResponse {
                    to: channel_id,
                    doc_id,
                    transmission: Transmission::Unavailable,
                    include_ephemeral: false,
                });
                continue;
            };

            let info = &self.channels[&channel_id];
            if !self.can_update(info, &doc_id, doc_state) {
                // Rule rejection looks identical to a missing doc from the
                // outside, but we do not record no-doc: we have it.
                debug!(%channel_id, %doc_id, "Sync request denied by rules");
                commands.push(Command::SendSyncResponse {
                    to: channel_id,
                    doc_id,
                    transmission: Transmission::Unavailable,
                    include_ephemeral: false,
                });
                continue;
            }

            let transmission = match doc_state.doc.compare(&requester_version) {
                Some(Ordering::Equal) => Transmission::UpToDate {
                    version: doc_state.doc.encoded_version(),
                },
                Some(Ordering::Less) => {
                    // We are strictly behind. Tell them we have nothing for
                    // them, and fetch their delta unless they asked us to
                    // counter-request anyway.
                    if !bidirectional {
                        counter_requests.push(doc_id.clone());
                    }
                    Transmission::UpToDate {
                        version: doc_state.doc.encoded_version(),
                    }
                }
                Some(Ordering::Greater) | None => {
                    if requester_version.is_empty() {
                        match doc_state.doc.snapshot() {
                            Ok(data) => Transmission::Snapshot {
                                data,
                                version: doc_state.doc.encoded_version(),
                            },
                            Err(error) => {
                                warn!(%doc_id, ?error, "Snapshot export failed");
                                Transmission::Unavailable
                            }
                        }
                    } else {
                        match doc_state.doc.updates_since(&requester_version) {
                            Ok(data) => Transmission::Update { data },
                            Err(error) => {
                                warn!(%doc_id, ?error, "Update export failed");
                                Transmission::Unavailable
                            }
                        }
                    }
                }
            };

            // We now know the peer holds at least its stated version.
            let peer = self.peers.entry(peer_id.clone()).or_default();
            let last_known = peer
                .last_known_version
                .entry(doc_id.clone())
                .or_insert_with(VersionVector::new);
            merge_version(last_known, &requester_version);
            if matches!(
                transmission,
                Transmission::Update { .. } | Transmission::Snapshot { .. }
            ) {
                // Whatever we send now, they will hold.
                let current = self.docs[&doc_id].doc.version();
                let peer = self.peers.entry(peer_id.clone()).or_default();
                let last_known = peer
                    .last_known_version
                    .entry(doc_id.clone())
                    .or_insert_with(VersionVector::new);
                merge_version(last_known, &current);
            }

            let doc_state = self.docs.get_mut(&doc_id).expect("present above");
            doc_state.channels.entry(channel_id).or_default().awareness = Awareness::HasDoc;

            commands.push(Command::SendSyncResponse {
                to: channel_id,
                doc_id: doc_id.clone(),
                transmission,
                include_ephemeral: include_ephemeral && first_response,
            });
            first_response = false;

            if bidirectional {
                counter_requests.push(doc_id);
            }
        }

        for doc_id in counter_requests {
            commands.extend(self.request_sync(channel_id, &doc_id, false, false));
        }
        commands
    }

    fn on_sync_response(
        &mut self,
        channel_id: ChannelId,
        doc_id: &DocId,
        transmission: Transmission,
        ephemeral: Option<Vec<crate::types::EphemeralBlob>>,
    ) -> Vec<Command> {
        let Some(doc_state) = self.docs.get_mut(doc_id) else {
            warn!(%channel_id, %doc_id, "Sync response for unknown doc, dropping");
            return vec![];
        };
        let peer_id = self.channels[&channel_id]
            .peer_id()
            .cloned()
            .expect("established channels carry an identity");

        let mut commands = vec![];
        match transmission {
            Transmission::UpToDate { version } => {
                let channel_state = doc_state.channels.entry(channel_id).or_default();
                channel_state.clear_in_flight();
                channel_state.awareness = Awareness::HasDoc;
                channel_state.load = DocLoad::Found(doc_state.doc.version());
                let retry = std::mem::take(&mut channel_state.pending_request);

                if let Ok(their_version) = decode_version(&version) {
                    let peer = self.peers.entry(peer_id).or_default();
                    let last_known = peer
                        .last_known_version
                        .entry(doc_id.clone())
                        .or_insert_with(VersionVector::new);
                    merge_version(last_known, &their_version);
                }
                commands.push(self.emit_ready(doc_id));
                if retry {
                    commands.extend(self.request_sync(channel_id, doc_id, false, false));
                }
            }
            Transmission::Snapshot { data, version: _ } | Transmission::Update { data } => {
                let channel_state = doc_state.channels.entry(channel_id).or_default();
                if channel_state.errored {
                    debug!(%channel_id, %doc_id, "Ignoring data for errored doc-channel pairing");
                    return vec![];
                }
                channel_state.awareness = Awareness::HasDoc;
                commands.push(Command::ImportDocData {
                    channel_id,
                    peer_id,
                    doc_id: doc_id.clone(),
                    doc: Arc::clone(&doc_state.doc),
                    data,
                });
            }
            Transmission::Unavailable => {
                let channel_state = doc_state.channels.entry(channel_id).or_default();
                channel_state.clear_in_flight();
                channel_state.pending_request = false;
                channel_state.awareness = Awareness::NoDoc;
                channel_state.load = DocLoad::NotFound;
                commands.push(self.emit_ready(doc_id));
            }
        }

        if let Some(blobs) = ephemeral {
            for blob in blobs {
                commands.extend(self.accept_ephemeral_data(
                    channel_id,
                    doc_id,
                    &blob.namespace,
                    blob.data,
                ));
            }
        }
        commands
    }

    /// Decodes enough of a presence blob to track the origin peer's
    /// liveness, then hands it to the store.
    fn accept_ephemeral_data(
        &mut self,
        from_channel_id: ChannelId,
        doc_id: &DocId,
        namespace: &str,
        data: Vec<u8>,
    ) -> Vec<Command> {
        let origin = match crate::ephemeral::EphemeralUpdate::decode(&data) {
            Ok(update) => update.peer_id,
            Err(error) => {
                warn!(%doc_id, ?error, "Malformed ephemeral data, dropping");
                return vec![];
            }
        };
        let peer = self.peers.entry(origin.clone()).or_default();
        peer.ephemeral_seen.insert(doc_id.clone(), self.now_ms);

        vec![
            Command::ApplyEphemeral {
                from_channel_id,
                doc_id: doc_id.clone(),
                namespace: namespace.to_string(),
                data,
            },
            Command::EmitEphemeralChange {
                doc_id: doc_id.clone(),
                namespace: namespace.to_string(),
                peer_id: Some(origin),
            },
        ]
    }

    fn on_ephemeral(&mut self, channel_id: ChannelId, message: EphemeralMessage) -> Vec<Command> {
        let EphemeralMessage {
            doc_id,
            namespace,
            data,
            hops_remaining,
        } = message;
        if !self.docs.contains_key(&doc_id) {
            debug!(%doc_id, "Presence for untracked doc, dropping");
            return vec![];
        }

        let mut commands = self.accept_ephemeral_data(channel_id, &doc_id, &namespace, data.clone());

        // Relay onward while the hop budget lasts. This is what lets two
        // spokes of a hub see each other's cursors.
        let hops_remaining = hops_remaining.saturating_sub(1);
        if hops_remaining > 0 {
            let doc_state = &self.docs[&doc_id];
            let targets: Vec<ChannelId> = self
                .channels
                .values()
                .filter(|info| {
                    info.channel_id != channel_id
                        && info.is_established()
                        && info.kind == ChannelKind::Network
                        && doc_state
                            .channels
                            .get(&info.channel_id)
                            .is_some_and(|s| s.awareness == Awareness::HasDoc)
                        && self.can_update(info, &doc_id, doc_state)
                })
                .map(|info| info.channel_id)
                .collect();
            if !targets.is_empty() {
                commands.push(Command::BroadcastEphemeralRelay {
                    to_channel_ids: targets,
                    message: EphemeralMessage {
                        doc_id,
                        namespace,
                        data,
                        hops_remaining,
                    },
                });
            }
        }
        commands
    }
}
