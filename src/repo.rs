// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The application-facing facade: a [`Repo`] owns the synchronizer actor,
//! its command executor and the attached adapters; [`DocHandle`]s are how
//! applications read, mutate and await documents.

use crate::adapter::{Adapter, AdapterContext};
use crate::channel::ChannelSender;
use crate::config::RepoConfig;
use crate::document::Document;
use crate::ephemeral::{EphemeralChange, EphemeralStore};
use crate::executor::CommandExecutor;
use crate::middleware::{MiddlewareChain, MiddlewareContext};
use crate::rules::{AllowAll, SyncRules};
use crate::sync::{Input, Synchronizer};
use crate::types::{
    AdapterId, ChannelId, ChannelKind, ChannelMsg, DocId, DocReadyState, PeerId, PeerIdentity,
    ReturnEnvelope, SyncError,
};
use crate::wire::{decode_batch, Frame, Reassembler};
use anyhow::Result;
use loro::LoroDoc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct RepoOptions {
    pub identity: PeerIdentity,
    pub adapters: Vec<Arc<dyn Adapter>>,
    pub rules: Arc<dyn SyncRules>,
    pub middleware: MiddlewareChain,
    pub config: RepoConfig,
}

impl RepoOptions {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            adapters: vec![],
            rules: Arc::new(AllowAll),
            middleware: MiddlewareChain::default(),
            config: RepoConfig::default(),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_rules(mut self, rules: impl SyncRules + 'static) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_config(mut self, config: RepoConfig) -> Self {
        self.config = config;
        self
    }
}

/// Everything that can be posted to the synchronizer actor: reducer inputs,
/// raw transport frames, and request/response calls from handles.
enum RuntimeMessage {
    Input(Input),
    AddChannel {
        channel_id: ChannelId,
        kind: ChannelKind,
        adapter_id: AdapterId,
        initiator: bool,
        sender: ChannelSender,
    },
    Frame {
        channel_id: ChannelId,
        bytes: Vec<u8>,
    },
    GetDoc {
        doc_id: DocId,
        reply: oneshot::Sender<(Arc<Document>, watch::Receiver<DocReadyState>)>,
    },
    HasDoc {
        doc_id: DocId,
        reply: oneshot::Sender<bool>,
    },
    DocIds {
        reply: oneshot::Sender<Vec<DocId>>,
    },
}

/// Cheap, cloneable way to talk to the synchronizer actor. Adapters use it
/// through [`AdapterContext`]; handles use it directly.
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<RuntimeMessage>,
}

impl RuntimeHandle {
    fn post(&self, message: RuntimeMessage) {
        // Sends only fail after shutdown, when nobody cares anymore.
        let _ = self.tx.send(message);
    }

    pub(crate) fn post_input(&self, input: Input) {
        self.post(RuntimeMessage::Input(input));
    }

    pub(crate) fn add_channel(
        &self,
        kind: ChannelKind,
        adapter_id: AdapterId,
        frames_tx: mpsc::Sender<Vec<u8>>,
        initiator: bool,
    ) -> ChannelId {
        let channel_id = ChannelId::next();
        self.post(RuntimeMessage::AddChannel {
            channel_id,
            kind,
            adapter_id,
            initiator,
            sender: ChannelSender::new(frames_tx),
        });
        channel_id
    }

    pub(crate) fn establish(&self, channel_id: ChannelId) {
        self.post_input(Input::EstablishChannel { channel_id });
    }

    pub(crate) fn receive_frame(&self, channel_id: ChannelId, bytes: Vec<u8>) {
        self.post(RuntimeMessage::Frame { channel_id, bytes });
    }

    pub(crate) fn remove_channel(&self, channel_id: ChannelId) {
        self.post_input(Input::ChannelRemoved { channel_id });
    }
}

/// The actor owning all synchronizer state. Every transition runs here, one
/// at a time; that is what serializes concurrent inbound traffic (and makes
/// the reducer's single-threaded assumption true).
struct SynchronizerActor {
    model: Synchronizer,
    executor: CommandExecutor,
    middleware: Arc<MiddlewareChain>,
    reassemblers: HashMap<ChannelId, Reassembler>,
    reassembly_timeout: Duration,
    rx: mpsc::UnboundedReceiver<RuntimeMessage>,
    shutdown: CancellationToken,
}

impl SynchronizerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("Synchronizer actor shutting down");
                    break;
                }
                message = self.rx.recv() => {
                    match message {
                        Some(message) => self.handle_runtime_message(message).await,
                        None => break,
                    }
                }
            }
        }
    }

    fn reduce(&mut self, input: Input) {
        for command in self.model.handle(input) {
            self.executor.execute(command);
        }
    }

    async fn handle_runtime_message(&mut self, message: RuntimeMessage) {
        match message {
            RuntimeMessage::Input(input) => {
                match &input {
                    Input::ChannelRemoved { channel_id } => {
                        self.executor.remove_channel(*channel_id);
                        self.reassemblers.remove(channel_id);
                    }
                    Input::Heartbeat { .. } => {
                        let now = Instant::now();
                        for reassembler in self.reassemblers.values_mut() {
                            reassembler.purge_stale(now);
                        }
                    }
                    _ => {}
                }
                self.reduce(input);
            }
            RuntimeMessage::AddChannel {
                channel_id,
                kind,
                adapter_id,
                initiator,
                sender,
            } => {
                self.executor.register_channel(channel_id, sender);
                self.reassemblers
                    .insert(channel_id, Reassembler::new(self.reassembly_timeout));
                self.reduce(Input::ChannelAdded {
                    channel_id,
                    kind,
                    adapter_id,
                    initiator,
                });
            }
            RuntimeMessage::Frame { channel_id, bytes } => {
                self.handle_frame(channel_id, bytes);
            }
            RuntimeMessage::GetDoc { doc_id, reply } => {
                let doc = if let Some(doc) = self.model.doc(&doc_id) {
                    doc
                } else {
                    let doc = Arc::new(Document::new());
                    self.reduce(Input::DocEnsure {
                        doc_id: doc_id.clone(),
                        doc: Arc::clone(&doc),
                    });
                    doc
                };
                let ready_rx = self.executor.ready_receiver(&doc_id);
                let _ = reply.send((doc, ready_rx));
            }
            RuntimeMessage::HasDoc { doc_id, reply } => {
                let _ = reply.send(self.model.has_doc(&doc_id));
            }
            RuntimeMessage::DocIds { reply } => {
                let _ = reply.send(self.model.doc_ids());
            }
        }
        // One write per channel per turn, however many commands ran.
        self.executor.flush().await;
    }

    fn handle_frame(&mut self, channel_id: ChannelId, bytes: Vec<u8>) {
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%channel_id, ?error, "Malformed frame, dropping");
                return;
            }
        };
        let reassembler = self
            .reassemblers
            .entry(channel_id)
            .or_insert_with(|| Reassembler::new(self.reassembly_timeout));
        let payload = match reassembler.accept(frame, Instant::now()) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(error) => {
                warn!(%channel_id, ?error, "Fragment reassembly failed, dropping message");
                return;
            }
        };
        let batch = match decode_batch(&payload) {
            Ok(batch) => batch,
            Err(error) => {
                warn!(%channel_id, ?error, "Malformed message batch, dropping");
                return;
            }
        };

        for message in batch {
            if !self.admit(channel_id, &message) {
                continue;
            }
            self.reduce(Input::ChannelReceiveMessage(ReturnEnvelope {
                from_channel_id: channel_id,
                message,
            }));
        }
    }

    /// Runs the middleware chain over one inbound message.
    fn admit(&self, channel_id: ChannelId, message: &ChannelMsg) -> bool {
        if self.middleware.is_empty() {
            return true;
        }
        let facets = self.middleware.facets();
        let peer = if facets.peer {
            self.model
                .channel(channel_id)
                .and_then(|info| info.identity())
        } else {
            None
        };
        let doc_id = if facets.document {
            match message {
                ChannelMsg::SyncResponse { doc_id, .. } => Some(doc_id),
                ChannelMsg::Ephemeral(ephemeral) => Some(&ephemeral.doc_id),
                _ => None,
            }
        } else {
            None
        };
        let ctx = MiddlewareContext {
            peer,
            doc_id,
            message_type: message.kind(),
            payload_len: message.payload_len(),
        };
        self.middleware.check(&ctx).allow
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// A peer-to-peer document synchronization runtime. Construct one per
/// application process, attach adapters, and hand out [`DocHandle`]s.
pub struct Repo {
    runtime: RuntimeHandle,
    identity: PeerIdentity,
    adapters: Vec<Arc<dyn Adapter>>,
    kinds: Arc<HashSet<ChannelKind>>,
    ephemeral: Arc<EphemeralStore>,
    shutdown: CancellationToken,
}

impl Repo {
    pub async fn new(options: RepoOptions) -> Result<Self> {
        let RepoOptions {
            identity,
            adapters,
            rules,
            middleware,
            config,
        } = options;

        let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();
        let runtime = RuntimeHandle { tx: runtime_tx };
        let ephemeral = Arc::new(EphemeralStore::new(identity.peer_id.clone()));
        let shutdown = CancellationToken::new();

        // Reducer feedback (imports, dispatches) loops back through the
        // same mailbox as everything else.
        let (input_tx, mut input_rx) = mpsc::unbounded_channel();
        let feedback_runtime = runtime.clone();
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                feedback_runtime.post_input(input);
            }
        });

        let actor = SynchronizerActor {
            model: Synchronizer::new(identity.clone(), config.clone(), rules),
            executor: CommandExecutor::new(config.clone(), Arc::clone(&ephemeral), input_tx),
            middleware: Arc::new(middleware),
            reassemblers: HashMap::new(),
            reassembly_timeout: config.reassembly_timeout,
            rx: runtime_rx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(actor.run());

        // Heartbeat timer: presence eviction, reassembly purging,
        // wire keepalives.
        let heartbeat_runtime = runtime.clone();
        let heartbeat_shutdown = shutdown.clone();
        let heartbeat_interval = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = heartbeat_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        heartbeat_runtime.post_input(Input::Heartbeat { now_ms: now_ms() });
                    }
                }
            }
        });

        let kinds: HashSet<ChannelKind> =
            adapters.iter().map(|adapter| adapter.kind()).collect();

        let repo = Self {
            runtime,
            identity,
            adapters,
            kinds: Arc::new(kinds),
            ephemeral,
            shutdown,
        };

        for adapter in &repo.adapters {
            let context = AdapterContext::new(
                adapter.adapter_id(),
                adapter.kind(),
                repo.runtime.clone(),
            );
            adapter.start(context).await?;
        }
        Ok(repo)
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Returns a handle for the document, creating and announcing it if it
    /// is new. Idempotent.
    pub async fn get(&self, doc_id: impl Into<DocId>) -> Result<DocHandle, SyncError> {
        let doc_id = doc_id.into();
        let (reply, response) = oneshot::channel();
        self.runtime.post(RuntimeMessage::GetDoc {
            doc_id: doc_id.clone(),
            reply,
        });
        let (doc, ready_rx) = response.await.map_err(|_| SyncError::Stopped)?;
        Ok(DocHandle {
            doc_id,
            doc,
            runtime: self.runtime.clone(),
            ready_rx,
            ephemeral: Arc::clone(&self.ephemeral),
            kinds: Arc::clone(&self.kinds),
        })
    }

    /// Whether this repo currently tracks the document, locally or through
    /// a peer's announcement. Never triggers discovery by itself.
    pub async fn has(&self, doc_id: impl Into<DocId>) -> bool {
        let (reply, response) = oneshot::channel();
        self.runtime.post(RuntimeMessage::HasDoc {
            doc_id: doc_id.into(),
            reply,
        });
        response.await.unwrap_or(false)
    }

    pub async fn doc_ids(&self) -> Vec<DocId> {
        let (reply, response) = oneshot::channel();
        self.runtime.post(RuntimeMessage::DocIds { reply });
        response.await.unwrap_or_default()
    }

    /// Deletes the document locally. Nothing travels over the wire.
    pub fn delete(&self, doc_id: impl Into<DocId>) {
        self.runtime.post_input(Input::DocDelete {
            doc_id: doc_id.into(),
            requested_by: None,
        });
    }

    pub async fn stop(&self) {
        for adapter in &self.adapters {
            adapter.stop().await;
        }
        self.shutdown.cancel();
    }
}

impl Drop for Repo {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Options for [`DocHandle::wait_for_sync`]. A `timeout` of zero waits
/// forever; the optional `signal` aborts the wait early.
#[derive(Clone, Debug, Default)]
pub struct WaitForSync {
    pub kind: ChannelKind,
    pub timeout: Duration,
    pub signal: Option<CancellationToken>,
}

impl WaitForSync {
    pub fn network() -> Self {
        Self {
            kind: ChannelKind::Network,
            ..Self::default()
        }
    }

    pub fn storage() -> Self {
        Self {
            kind: ChannelKind::Storage,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Application-facing view of one document.
#[derive(Clone)]
pub struct DocHandle {
    doc_id: DocId,
    doc: Arc<Document>,
    runtime: RuntimeHandle,
    ready_rx: watch::Receiver<DocReadyState>,
    ephemeral: Arc<EphemeralStore>,
    kinds: Arc<HashSet<ChannelKind>>,
}

impl DocHandle {
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn doc(&self) -> &Arc<Document> {
        &self.doc
    }

    /// Applies a batch of operations to the document and commits them as
    /// one change. The synchronizer picks the commit up through its change
    /// subscription.
    pub fn change<T>(&self, mutator: impl FnOnce(&LoroDoc) -> T) -> T {
        let result = mutator(self.doc.inner());
        self.doc.commit();
        result
    }

    pub fn ready_state(&self) -> DocReadyState {
        self.ready_rx.borrow().clone()
    }

    /// Resolves once at least one channel of the requested kind has
    /// reported the document found or not found.
    pub async fn wait_for_sync(&self, options: WaitForSync) -> Result<(), SyncError> {
        if !self.kinds.contains(&options.kind) {
            return Err(SyncError::NoAdapters { kind: options.kind });
        }

        let mut ready_rx = self.ready_rx.clone();
        let wait = async {
            loop {
                {
                    let state = ready_rx.borrow();
                    if state.removed {
                        return Err(SyncError::Stopped);
                    }
                    if state.settled_for(options.kind) {
                        return Ok(());
                    }
                }
                if ready_rx.changed().await.is_err() {
                    return Err(SyncError::Stopped);
                }
            }
        };

        let aborted = async {
            match &options.signal {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = wait => result,
            () = aborted => Err(SyncError::Aborted),
            () = tokio::time::sleep(options.timeout), if !options.timeout.is_zero() => {
                Err(SyncError::SyncTimeout {
                    kind: options.kind,
                    timeout_ms: options.timeout.as_millis() as u64,
                    doc_id: self.doc_id.clone(),
                    last_seen: self.ready_rx.borrow().clone(),
                })
            }
        }
    }

    /// Calls `callback` with every ready-state transition until the guard
    /// is dropped.
    pub fn on_ready_state_change(
        &self,
        callback: impl Fn(DocReadyState) + Send + 'static,
    ) -> Subscription {
        let mut ready_rx = self.ready_rx.clone();
        let task = tokio::spawn(async move {
            while ready_rx.changed().await.is_ok() {
                callback(ready_rx.borrow().clone());
            }
        });
        Subscription { task }
    }

    /// Presence handle for one namespace of this document.
    pub fn ephemeral(&self, namespace: impl Into<String>) -> EphemeralHandle {
        EphemeralHandle {
            doc_id: self.doc_id.clone(),
            namespace: namespace.into(),
            store: Arc::clone(&self.ephemeral),
            runtime: self.runtime.clone(),
        }
    }
}

/// Dropping this unsubscribes.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Typed access to one presence namespace. Local mutations are flushed to
/// every permitted channel; remote peers' state is read-only.
#[derive(Clone)]
pub struct EphemeralHandle {
    doc_id: DocId,
    namespace: String,
    store: Arc<EphemeralStore>,
    runtime: RuntimeHandle,
}

impl EphemeralHandle {
    const SELF_KEY: &'static str = "self";

    fn changed(&self) {
        self.runtime.post_input(Input::EphemeralLocalChange {
            doc_id: self.doc_id.clone(),
            namespace: self.namespace.clone(),
        });
    }

    /// Sets this peer's own presence value.
    pub fn set_self(&self, value: Value) {
        self.set(Self::SELF_KEY, value);
    }

    pub fn self_state(&self) -> Option<Value> {
        self.store
            .local_entry(&self.doc_id, &self.namespace, Self::SELF_KEY)
    }

    /// A remote peer's own presence value.
    pub fn peer_state(&self, peer_id: &PeerId) -> Option<Value> {
        self.store
            .peer_entry(&self.doc_id, &self.namespace, peer_id, Self::SELF_KEY)
    }

    pub fn set(&self, key: &str, value: Value) {
        if self
            .store
            .set_local(&self.doc_id, &self.namespace, key, value)
        {
            self.changed();
        }
    }

    /// Local value if we set one, otherwise whichever peer holds the key.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.store.local_entry(&self.doc_id, &self.namespace, key) {
            return Some(value);
        }
        let all = self.store.all_entries(&self.doc_id, &self.namespace);
        all.values().find_map(|entries| entries.get(key).cloned())
    }

    pub fn get_all(&self) -> HashMap<PeerId, HashMap<String, Value>> {
        self.store.all_entries(&self.doc_id, &self.namespace)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.store.peers(&self.doc_id, &self.namespace)
    }

    /// Raw change events for this repo's whole presence store; filter on
    /// doc and namespace as needed.
    pub fn changes(&self) -> broadcast::Receiver<EphemeralChange> {
        self.store.changes()
    }

    /// Calls `callback` for every change within this namespace until the
    /// guard is dropped.
    pub fn subscribe(&self, callback: impl Fn(EphemeralChange) + Send + 'static) -> Subscription {
        let mut changes = self.store.changes();
        let doc_id = self.doc_id.clone();
        let namespace = self.namespace.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if change.doc_id == doc_id && change.namespace == namespace {
                            callback(change);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Presence updates are ephemeral; missing some is fine.
                        debug!("Ephemeral change subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}
