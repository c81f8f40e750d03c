//! Per-client sessions: the protocol state machine, the FIFO inbox worker,
//! the merge-box send path, heartbeating, and the method/write-fence
//! choreography.

mod heartbeat;
mod subscription;

pub use subscription::{PublishHandler, PublishResult, Subscription};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as SyncMutex, Weak},
};

use bson::{Bson, Document};
use tracing::{debug, error};

use crate::{
    bson_util,
    diff::FieldPatch,
    error::{ClientError, Error, Result},
    fence::WriteFence,
    mergebox::{self, SessionCollectionView, ViewChange},
    protocol::{parse_ddp, stringify_ddp, ClientMessage, ProtocolVersion, ServerMessage},
    runtime,
    server::{ConnectionHandle, PublicationStrategy, ServerInner},
    task_queue::TaskQueue,
    transport::{self, FrameSender},
};

use heartbeat::Heartbeat;

/// A connected client session. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// The server-assigned session id, as sent in `connected`.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.inner.version
    }

    /// Closes the session: drops the inbox, stops the heartbeat, closes the
    /// socket, and tears down subscriptions on a deferred task.
    pub fn close(&self) {
        self.inner.close();
    }
}

pub(crate) struct SessionInner {
    pub(crate) id: String,
    pub(crate) version: ProtocolVersion,
    server: Weak<ServerInner>,
    sender: Arc<dyn FrameSender>,
    remote_address: Option<String>,
    headers: HashMap<String, String>,
    in_queue: TaskQueue,
    heartbeat: SyncMutex<Option<Heartbeat>>,
    state: SyncMutex<SessionState>,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

struct SessionState {
    user_id: Option<String>,
    named_subs: HashMap<String, Arc<Subscription>>,
    universal_subs: Vec<Arc<Subscription>>,
    collection_views: HashMap<String, SessionCollectionView>,
    // While false (during a user-id rebind), merge-box deltas stay in the
    // views and ready messages buffer in pending_ready.
    is_sending: bool,
    pending_ready: Vec<String>,
    init_batch: Option<InitBatch>,
    active_init_bursts: usize,
    close_callbacks: Vec<Box<dyn FnOnce() + Send>>,
    dont_start_new_universal_subs: bool,
    closed: bool,
}

/// Buffered initial adds, per collection, awaiting a flush into `init`
/// messages (protocol `1a`).
#[derive(Default)]
struct InitBatch {
    order: Vec<String>,
    items: HashMap<String, Vec<Document>>,
}

impl Session {
    pub(crate) fn start(
        server: &Arc<ServerInner>,
        version: ProtocolVersion,
        sender: Arc<dyn FrameSender>,
        remote_address: Option<String>,
        headers: HashMap<String, String>,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            id: bson_util::random_id(),
            version,
            server: Arc::downgrade(server),
            sender,
            remote_address,
            headers,
            in_queue: TaskQueue::new(),
            heartbeat: SyncMutex::new(None),
            state: SyncMutex::new(SessionState {
                user_id: None,
                named_subs: HashMap::new(),
                universal_subs: Vec::new(),
                collection_views: HashMap::new(),
                is_sending: true,
                pending_ready: Vec::new(),
                init_batch: None,
                active_init_bursts: 0,
                close_callbacks: Vec::new(),
                dont_start_new_universal_subs: false,
                closed: false,
            }),
        });

        if version.supports_ping() {
            if let Some(interval) = server.options.heartbeat_interval {
                let ping_target = Arc::downgrade(&inner);
                let dead_target = Arc::downgrade(&inner);
                let heartbeat = Heartbeat::start(
                    interval,
                    server.options.heartbeat_timeout,
                    move || {
                        if let Some(session) = ping_target.upgrade() {
                            session.send(&ServerMessage::Ping { id: None });
                        }
                    },
                    move || {
                        if let Some(session) = dead_target.upgrade() {
                            debug!(session = session.id.as_str(), "heartbeat timed out");
                            session.close();
                        }
                    },
                );
                *inner.heartbeat.lock().unwrap() = Some(heartbeat);
            }
        }

        Session { inner }
    }

    /// Hands one raw inbound frame to the session's FIFO worker. Frames
    /// arriving after close are dropped.
    pub(crate) fn queue_message(&self, raw: String) {
        if self.inner.state.lock().unwrap().closed {
            return;
        }
        if let Some(heartbeat) = self.inner.heartbeat.lock().unwrap().as_ref() {
            heartbeat.message_received();
        }
        let inner = self.inner.clone();
        self.inner.in_queue.queue_task(move || async move {
            inner.process_message(raw).await;
        });
    }

    /// Starts a universal subscription on the session's worker.
    pub(crate) fn queue_universal_sub(&self, handler: PublishHandler) {
        let inner = self.inner.clone();
        self.inner.in_queue.queue_task(move || async move {
            inner.start_universal_sub(handler).await;
        });
    }
}

impl SessionInner {
    async fn process_message(self: Arc<Self>, raw: String) {
        let message = match parse_ddp(&raw) {
            Ok(message) => message,
            Err(err) => {
                debug!("discarding malformed frame: {}", err);
                self.send(&ServerMessage::Error {
                    reason: "Malformed message".to_string(),
                    offending_message: Some(raw),
                });
                return;
            }
        };
        match message {
            ClientMessage::Connect { .. } => {
                self.send(&ServerMessage::Error {
                    reason: "Already connected".to_string(),
                    offending_message: Some(raw),
                });
            }
            ClientMessage::Sub { id, name, params } => {
                self.process_sub(id, name, params.unwrap_or_default()).await;
            }
            ClientMessage::Unsub { id } => {
                self.stop_subscription(&id, None);
            }
            ClientMessage::Method {
                id,
                method,
                params,
                random_seed: _,
            } => {
                self.process_method(id, method, params.unwrap_or_default())
                    .await;
            }
            ClientMessage::Ping { id } => {
                let respond = self
                    .server
                    .upgrade()
                    .map(|server| server.options.respond_to_pings)
                    .unwrap_or(false);
                if respond && self.version.supports_ping() {
                    self.send(&ServerMessage::Pong { id });
                }
            }
            ClientMessage::Pong { .. } => {}
        }
    }

    async fn process_sub(self: &Arc<Self>, id: String, name: String, params: Vec<Bson>) {
        let handler = {
            let state = self.state.lock().unwrap();
            if state.closed || state.named_subs.contains_key(&id) {
                // Duplicate sub ids are a silent no-op.
                return;
            }
            self.server
                .upgrade()
                .and_then(|server| server.publish_handler(&name))
        };
        let Some(handler) = handler else {
            self.send(&ServerMessage::Nosub {
                id,
                error: Some(ClientError {
                    error: 404.into(),
                    reason: Some(format!("Subscription '{}' not found", name)),
                    details: None,
                }),
            });
            return;
        };
        let subscription = {
            let mut state = self.state.lock().unwrap();
            let subscription = Subscription::new(
                Arc::downgrade(self),
                handler,
                Some(id.clone()),
                Some(name),
                params,
                state.user_id.clone(),
            );
            state.named_subs.insert(id, subscription.clone());
            subscription
        };
        subscription.run().await;
    }

    async fn process_method(self: &Arc<Self>, id: String, method: String, params: Vec<Bson>) {
        let handler = self
            .server
            .upgrade()
            .and_then(|server| server.method_handler(&method));
        let Some(handler) = handler else {
            self.send(&ServerMessage::Result {
                id: id.clone(),
                result: None,
                error: Some(ClientError {
                    error: 404.into(),
                    reason: Some(format!("Method '{}' not found", method)),
                    details: None,
                }),
            });
            self.send(&ServerMessage::Updated { methods: vec![id] });
            return;
        };

        let fence = WriteFence::new();
        let invocation = MethodInvocation {
            session: Arc::downgrade(self),
            user_id: self.state.lock().unwrap().user_id.clone(),
            connection: Some(self.connection_handle()),
        };
        let output = fence.with_current(handler(invocation, params)).await;

        match output {
            Ok(value) => {
                let result = if value == Bson::Null { None } else { Some(value) };
                self.send(&ServerMessage::Result {
                    id: id.clone(),
                    result,
                    error: None,
                });
            }
            Err(err) => {
                if !err.is_client_safe() {
                    error!(method = method.as_str(), "method handler failed: {}", err);
                }
                self.send(&ServerMessage::Result {
                    id: id.clone(),
                    result: None,
                    error: Some(err.to_wire()),
                });
            }
        }

        let updated_target = self.clone();
        let retire_fence = fence.clone();
        let registered = fence.on_all_committed(move |_| {
            Box::pin(async move {
                updated_target.send(&ServerMessage::Updated {
                    methods: vec![id],
                });
                retire_fence.retire()
            })
        });
        if let Err(err) = registered {
            error!("method fence rejected completion callback: {}", err);
            return;
        }
        if let Err(err) = fence.arm().await {
            error!("method fence failed to arm: {}", err);
        }
    }

    /// Removes and tears down a named subscription, then acknowledges with
    /// `nosub`. Unknown ids still acknowledge; `unsub` is idempotent.
    pub(crate) fn stop_subscription(&self, sub_id: &str, error: Option<Error>) {
        let subscription = {
            let mut state = self.state.lock().unwrap();
            state.named_subs.remove(sub_id)
        };
        if let Some(subscription) = subscription {
            subscription.deactivate();
            if !self.version.client_cleans_up_on_nosub() {
                subscription.remove_all_documents();
            }
        }
        self.send(&ServerMessage::Nosub {
            id: sub_id.to_string(),
            error: error.map(|err| err.to_wire()),
        });
    }

    pub(crate) async fn start_universal_sub(self: &Arc<Self>, handler: PublishHandler) {
        let subscription = {
            let mut state = self.state.lock().unwrap();
            if state.closed || state.dont_start_new_universal_subs {
                return;
            }
            let subscription = Subscription::new(
                Arc::downgrade(self),
                handler,
                None,
                None,
                Vec::new(),
                state.user_id.clone(),
            );
            state.universal_subs.push(subscription.clone());
            subscription
        };
        subscription.run().await;
    }

    /// Rebinds the session's user id: snapshots the merge-box, deactivates
    /// and re-runs every subscription under the new user, then sends the
    /// client exactly the deltas between the old and new views.
    pub(crate) async fn set_user_id(self: &Arc<Self>, user_id: Option<String>) -> Result<()> {
        let (old_views, named, universal) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.dont_start_new_universal_subs = true;
            state.is_sending = false;
            state.user_id = user_id.clone();
            let named: Vec<Arc<Subscription>> =
                state.named_subs.drain().map(|(_, sub)| sub).collect();
            let universal = std::mem::take(&mut state.universal_subs);
            let old_views = std::mem::take(&mut state.collection_views);
            (old_views, named, universal)
        };
        for subscription in named.iter().chain(universal.iter()) {
            subscription.deactivate();
        }

        for subscription in named {
            let fresh = subscription.recreate(user_id.clone());
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Ok(());
                }
                if let Some(sub_id) = fresh.sub_id() {
                    state.named_subs.insert(sub_id.to_string(), fresh.clone());
                }
            }
            fresh.run().await;
        }
        for subscription in universal {
            let fresh = subscription.recreate(user_id.clone());
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Ok(());
                }
                state.universal_subs.push(fresh.clone());
            }
            fresh.run().await;
        }

        let mut state = self.state.lock().unwrap();
        state.dont_start_new_universal_subs = false;
        state.is_sending = true;
        let mut changes: Vec<(String, ViewChange)> = Vec::new();
        mergebox::diff_views(&old_views, &state.collection_views, |collection, change| {
            changes.push((collection.to_string(), change));
        });
        for (collection, change) in changes {
            self.emit_change(&mut state, &collection, change);
        }
        let pending_ready = std::mem::take(&mut state.pending_ready);
        if !pending_ready.is_empty() {
            self.flush_init_batch(&mut state);
            self.raw_send(&ServerMessage::Ready {
                subs: pending_ready,
            });
        }
        Ok(())
    }

    pub(crate) fn publication_strategy(&self, name: Option<&str>) -> PublicationStrategy {
        self.server
            .upgrade()
            .map(|server| server.publication_strategy(name))
            .unwrap_or(PublicationStrategy::ServerMerge)
    }

    pub(crate) fn connection_handle(self: &Arc<Self>) -> ConnectionHandle {
        let forwarded_count = self
            .server
            .upgrade()
            .and_then(|server| server.options.http_forwarded_count);
        ConnectionHandle::new(
            self.id.clone(),
            Arc::downgrade(self),
            transport::client_address(
                self.remote_address.as_deref(),
                &self.headers,
                forwarded_count,
            ),
            self.headers.clone(),
        )
    }

    pub(crate) fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                true
            } else {
                state.close_callbacks.push(Box::new(callback));
                return;
            }
        };
        if run_now {
            callback();
        }
    }

    pub(crate) fn close(self: &Arc<Self>) {
        let (named, universal, close_callbacks) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.is_sending = false;
            (
                state.named_subs.drain().map(|(_, sub)| sub).collect::<Vec<_>>(),
                std::mem::take(&mut state.universal_subs),
                std::mem::take(&mut state.close_callbacks),
            )
        };
        if let Some(heartbeat) = self.heartbeat.lock().unwrap().take() {
            heartbeat.stop();
        }
        self.sender.close();
        if let Some(server) = self.server.upgrade() {
            server.forget_session(&self.id);
        }
        // Teardown runs on a deferred task so close() never blocks its
        // caller (which may be a subscription callback).
        runtime::spawn(async move {
            for callback in close_callbacks {
                callback();
            }
            for subscription in named.iter().chain(universal.iter()) {
                subscription.deactivate();
            }
        });
    }

    // ---- send path -------------------------------------------------------

    fn send(&self, message: &ServerMessage) {
        let state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        drop(state);
        self.raw_send(message);
    }

    fn raw_send(&self, message: &ServerMessage) {
        match stringify_ddp(message) {
            Ok(frame) => {
                if let Err(err) = self.sender.send_frame(&frame) {
                    debug!(session = self.id.as_str(), "send failed: {}", err);
                }
            }
            Err(err) => error!("dropping unserializable message: {}", err),
        }
    }

    pub(crate) fn send_added(
        &self,
        sub_handle: &str,
        strategy: PublicationStrategy,
        collection: &str,
        id: &str,
        fields: Document,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if strategy.uses_collection_view() {
            let view = state
                .collection_views
                .entry(collection.to_string())
                .or_insert_with(|| SessionCollectionView::new(collection));
            let change = view.added(sub_handle, id, fields);
            if state.is_sending {
                self.emit_change(&mut state, collection, change);
            }
        } else {
            // Non-merging strategies bypass the views entirely; their adds
            // go out even during a user-id rebind, since no diff will
            // re-create them.
            self.emit_change(
                &mut state,
                collection,
                ViewChange::Added {
                    id: id.to_string(),
                    fields,
                },
            );
        }
    }

    pub(crate) fn send_changed(
        &self,
        sub_handle: &str,
        strategy: PublicationStrategy,
        collection: &str,
        id: &str,
        patch: FieldPatch,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if strategy.uses_collection_view() {
            let change = match state.collection_views.get_mut(collection) {
                Some(view) => view.changed(sub_handle, id, patch),
                None => Err(Error::internal(format!(
                    "changed for untracked collection {}",
                    collection
                ))),
            };
            match change {
                Ok(change) => {
                    if state.is_sending {
                        self.emit_change(&mut state, collection, change);
                    }
                }
                Err(err) => error!("merge box rejected change: {}", err),
            }
        } else {
            self.emit_change(
                &mut state,
                collection,
                ViewChange::Changed {
                    id: id.to_string(),
                    patch,
                },
            );
        }
    }

    pub(crate) fn send_removed(
        &self,
        sub_handle: &str,
        strategy: PublicationStrategy,
        collection: &str,
        id: &str,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if strategy.uses_collection_view() {
            let change = match state.collection_views.get_mut(collection) {
                Some(view) => view.removed(sub_handle, id),
                None => Err(Error::internal(format!(
                    "removed for untracked collection {}",
                    collection
                ))),
            };
            if change.is_ok()
                && state
                    .collection_views
                    .get(collection)
                    .map(SessionCollectionView::is_empty)
                    .unwrap_or(false)
            {
                state.collection_views.remove(collection);
            }
            match change {
                Ok(change) => {
                    if state.is_sending {
                        self.emit_change(&mut state, collection, change);
                    }
                }
                Err(err) => error!("merge box rejected removal: {}", err),
            }
        } else {
            self.emit_change(
                &mut state,
                collection,
                ViewChange::Removed { id: id.to_string() },
            );
        }
    }

    pub(crate) fn send_ready(&self, sub_ids: Vec<String>) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if !state.is_sending {
            state.pending_ready.extend(sub_ids);
            return;
        }
        self.flush_init_batch(&mut state);
        self.raw_send(&ServerMessage::Ready { subs: sub_ids });
    }

    /// Opens (or joins) an initial-add batching window; returns whether the
    /// protocol batches at all.
    pub(crate) fn begin_init_burst(&self) -> bool {
        if !self.version.batches_initial_adds() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.active_init_bursts += 1;
        if state.init_batch.is_none() {
            state.init_batch = Some(InitBatch::default());
        }
        true
    }

    pub(crate) fn end_init_burst(&self) {
        let mut state = self.state.lock().unwrap();
        state.active_init_bursts = state.active_init_bursts.saturating_sub(1);
        if state.active_init_bursts == 0 {
            self.flush_init_batch(&mut state);
        }
    }

    fn emit_change(&self, state: &mut SessionState, collection: &str, change: ViewChange) {
        match change {
            ViewChange::Added { id, fields } => {
                if let Some(batch) = state.init_batch.as_mut() {
                    let mut item = fields;
                    item.insert("_id", id);
                    if !batch.items.contains_key(collection) {
                        batch.order.push(collection.to_string());
                    }
                    batch.items.entry(collection.to_string()).or_default().push(item);
                    return;
                }
                self.raw_send(&ServerMessage::Added {
                    collection: collection.to_string(),
                    id,
                    fields: if fields.is_empty() { None } else { Some(fields) },
                });
            }
            ViewChange::Changed { id, patch } => {
                if patch.is_empty() {
                    return;
                }
                self.flush_init_batch(state);
                self.raw_send(&ServerMessage::Changed {
                    collection: collection.to_string(),
                    id,
                    fields: if patch.updated.is_empty() {
                        None
                    } else {
                        Some(patch.updated)
                    },
                    cleared: if patch.cleared.is_empty() {
                        None
                    } else {
                        Some(patch.cleared)
                    },
                });
            }
            ViewChange::Removed { id } => {
                self.flush_init_batch(state);
                self.raw_send(&ServerMessage::Removed {
                    collection: collection.to_string(),
                    id,
                });
            }
        }
    }

    /// Sends any buffered initial adds as one `init` message per collection,
    /// in first-seen order. Message-order preserving: callers flush before
    /// emitting anything a buffered add must precede.
    fn flush_init_batch(&self, state: &mut SessionState) {
        let Some(batch) = state.init_batch.take() else {
            return;
        };
        let mut items = batch.items;
        for collection in batch.order {
            if let Some(items) = items.remove(&collection) {
                self.raw_send(&ServerMessage::Init { collection, items });
            }
        }
        if state.active_init_bursts > 0 {
            state.init_batch = Some(InitBatch::default());
        }
    }

}

/// The context a method handler runs with: the calling session's user id
/// and connection, plus the ability to rebind the user.
#[derive(Debug)]
pub struct MethodInvocation {
    session: Weak<SessionInner>,
    user_id: Option<String>,
    connection: Option<ConnectionHandle>,
}

impl MethodInvocation {
    /// The logged-in user at the time the method started, as later modified
    /// by [`MethodInvocation::set_user_id`].
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The calling session's connection.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    /// Rebinds the session's user: every subscription is deactivated and
    /// re-run under the new user id, and the client receives the difference
    /// between its old and new data. Resolves once the rebind has fully
    /// propagated.
    pub async fn set_user_id(&mut self, user_id: impl Into<Option<String>>) -> Result<()> {
        let user_id = user_id.into();
        self.user_id = user_id.clone();
        match self.session.upgrade() {
            Some(session) => session.set_user_id(user_id).await,
            None => Ok(()),
        }
    }
}
