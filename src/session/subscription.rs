//! One subscription: the bridge between a publish handler and the session's
//! merge-box, owning the observe handles and document accounting the
//! handler's cursors produce.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex as SyncMutex, Weak},
};

use bson::{Bson, Document};
use tracing::{error, warn};

use crate::{
    bson_util,
    diff::FieldPatch,
    error::{Error, Result},
    live::PublishableCursor,
    observe::ObserveHandle,
    server::ConnectionHandle,
    session::SessionInner,
    BoxFuture,
};

/// What a publish handler hands back.
pub enum PublishResult {
    /// The handler drives the subscription itself through
    /// [`Subscription::added`] and friends, including its own
    /// [`Subscription::ready`].
    None,
    /// Publish this cursor, then mark the subscription ready.
    Cursor(Box<dyn PublishableCursor>),
    /// Publish all of these cursors (distinct collections), then mark the
    /// subscription ready.
    Cursors(Vec<Box<dyn PublishableCursor>>),
}

/// A publish handler: runs with the subscription as context and returns the
/// cursor(s) to publish, or [`PublishResult::None`] to drive the
/// subscription manually.
pub type PublishHandler =
    Arc<dyn Fn(Arc<Subscription>) -> BoxFuture<'static, Result<PublishResult>> + Send + Sync>;

struct SubscriptionState {
    deactivated: bool,
    ready: bool,
    // collection name → ids this subscription has contributed, kept only
    // when the publication strategy does accounting.
    documents: HashMap<String, HashSet<String>>,
    stop_callbacks: Vec<Box<dyn FnOnce() + Send>>,
    observe_handles: Vec<ObserveHandle>,
}

/// The per-(session, sub-id) context a publish handler runs against.
pub struct Subscription {
    session: Weak<SessionInner>,
    handler: PublishHandler,
    sub_id: Option<String>,
    name: Option<String>,
    params: Vec<Bson>,
    user_id: Option<String>,
    // The precedence key for this subscription's merge-box contributions.
    handle: String,
    state: SyncMutex<SubscriptionState>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.sub_id)
            .field("name", &self.name)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        session: Weak<SessionInner>,
        handler: PublishHandler,
        sub_id: Option<String>,
        name: Option<String>,
        params: Vec<Bson>,
        user_id: Option<String>,
    ) -> Arc<Self> {
        let handle = match &sub_id {
            Some(id) => format!("N{}", id),
            None => format!("U{}", bson_util::random_id()),
        };
        Arc::new(Self {
            session,
            handler,
            sub_id,
            name,
            params,
            user_id,
            handle,
            state: SyncMutex::new(SubscriptionState {
                deactivated: false,
                ready: false,
                documents: HashMap::new(),
                stop_callbacks: Vec::new(),
                observe_handles: Vec::new(),
            }),
        })
    }

    /// A fresh subscription with the same identity and parameters: used when
    /// subscriptions re-run after a user-id rebind.
    pub(crate) fn recreate(&self, user_id: Option<String>) -> Arc<Self> {
        Self::new(
            self.session.clone(),
            self.handler.clone(),
            self.sub_id.clone(),
            self.name.clone(),
            self.params.clone(),
            user_id,
        )
    }

    /// The client's subscription id; `None` for universal subscriptions.
    pub fn sub_id(&self) -> Option<&str> {
        self.sub_id.as_deref()
    }

    /// The publication name; `None` for universal subscriptions.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The arguments the client subscribed with.
    pub fn params(&self) -> &[Bson] {
        &self.params
    }

    /// The user id the session had when this subscription started.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The owning session's connection handle.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.session.upgrade().map(|s| s.connection_handle())
    }

    pub(crate) fn subscription_handle(&self) -> &str {
        &self.handle
    }

    /// Runs the publish handler and publishes whatever it returns.
    pub(crate) async fn run(self: &Arc<Self>) {
        let batches = self
            .session
            .upgrade()
            .map(|s| s.begin_init_burst())
            .unwrap_or(false);
        let outcome = self.run_handler().await;
        if batches {
            if let Some(session) = self.session.upgrade() {
                session.end_init_burst();
            }
        }
        if let Err(err) = outcome {
            self.error(err);
        }
    }

    async fn run_handler(self: &Arc<Self>) -> Result<()> {
        match (self.handler)(self.clone()).await? {
            PublishResult::None => Ok(()),
            PublishResult::Cursor(cursor) => {
                cursor.publish(self.clone()).await?;
                self.ready();
                Ok(())
            }
            PublishResult::Cursors(cursors) => {
                let mut collections = HashSet::new();
                for cursor in &cursors {
                    if !collections.insert(cursor.collection_name().to_string()) {
                        return Err(Error::invalid_argument(format!(
                            "publish returned multiple cursors for collection '{}'",
                            cursor.collection_name()
                        )));
                    }
                }
                for cursor in cursors {
                    cursor.publish(self.clone()).await?;
                }
                self.ready();
                Ok(())
            }
        }
    }

    /// Reports a document to the client.
    pub fn added(&self, collection: &str, id: &str, fields: Document) {
        let Some(session) = self.session.upgrade() else { return };
        let strategy = session.publication_strategy(self.name.as_deref());
        {
            let mut state = self.state.lock().unwrap();
            if state.deactivated {
                return;
            }
            if strategy.does_accounting() {
                state
                    .documents
                    .entry(collection.to_string())
                    .or_default()
                    .insert(id.to_string());
            }
        }
        session.send_added(&self.handle, strategy, collection, id, fields);
    }

    /// Reports field changes for a document previously `added`.
    pub fn changed(&self, collection: &str, id: &str, patch: FieldPatch) {
        let Some(session) = self.session.upgrade() else { return };
        let strategy = session.publication_strategy(self.name.as_deref());
        if self.state.lock().unwrap().deactivated {
            return;
        }
        session.send_changed(&self.handle, strategy, collection, id, patch);
    }

    /// Withdraws a document previously `added`.
    pub fn removed(&self, collection: &str, id: &str) {
        let Some(session) = self.session.upgrade() else { return };
        let strategy = session.publication_strategy(self.name.as_deref());
        {
            let mut state = self.state.lock().unwrap();
            if state.deactivated {
                return;
            }
            if let Some(ids) = state.documents.get_mut(collection) {
                ids.remove(id);
            }
        }
        session.send_removed(&self.handle, strategy, collection, id);
    }

    /// Marks the subscription ready: its initial documents have all been
    /// reported. Universal subscriptions have no `ready` on the wire.
    pub fn ready(&self) {
        let Some(session) = self.session.upgrade() else { return };
        {
            let mut state = self.state.lock().unwrap();
            if state.deactivated || state.ready {
                return;
            }
            state.ready = true;
        }
        if let Some(sub_id) = &self.sub_id {
            session.send_ready(vec![sub_id.clone()]);
        }
    }

    /// Registers a callback to run when the subscription is torn down. On an
    /// already-stopped subscription the callback runs immediately.
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.state.lock().unwrap();
            if state.deactivated {
                true
            } else {
                state.stop_callbacks.push(Box::new(callback));
                return;
            }
        };
        if run_now {
            callback();
        }
    }

    /// Stops the subscription without error: the client receives a plain
    /// `nosub`.
    pub fn stop(self: &Arc<Self>) {
        match (&self.sub_id, self.session.upgrade()) {
            (Some(sub_id), Some(session)) => session.stop_subscription(sub_id, None),
            _ => self.deactivate(),
        }
    }

    /// Stops the subscription with a client-visible error in the `nosub`.
    pub fn error(self: &Arc<Self>, err: Error) {
        if !err.is_client_safe() {
            error!("publish handler failed: {}", err);
        }
        match (&self.sub_id, self.session.upgrade()) {
            (Some(sub_id), Some(session)) => session.stop_subscription(sub_id, Some(err)),
            _ => {
                warn!("universal subscription failed: {}", err);
                self.deactivate();
            }
        }
    }

    /// Takes ownership of an observe handle so it stops with the
    /// subscription.
    pub(crate) fn adopt_observe_handle(&self, handle: ObserveHandle) {
        let mut state = self.state.lock().unwrap();
        if state.deactivated {
            handle.stop();
        } else {
            state.observe_handles.push(handle);
        }
    }

    /// Halts all updates from this subscription and runs its stop callbacks.
    /// Idempotent.
    pub(crate) fn deactivate(&self) {
        let (handles, callbacks) = {
            let mut state = self.state.lock().unwrap();
            if state.deactivated {
                return;
            }
            state.deactivated = true;
            (
                std::mem::take(&mut state.observe_handles),
                std::mem::take(&mut state.stop_callbacks),
            )
        };
        for handle in handles {
            handle.stop();
        }
        for callback in callbacks {
            callback();
        }
    }

    /// Sends `removed` for every document this subscription contributed.
    /// Used on unsubscribe when the negotiated protocol does not clean up
    /// client-side.
    pub(crate) fn remove_all_documents(&self) {
        let Some(session) = self.session.upgrade() else { return };
        let strategy = session.publication_strategy(self.name.as_deref());
        let documents = std::mem::take(&mut self.state.lock().unwrap().documents);
        for (collection, ids) in documents {
            for id in ids {
                session.send_removed(&self.handle, strategy, &collection, &id);
            }
        }
    }
}
