//! The live connection: the observe-multiplexer registry plus the write
//! helpers that pair store mutations with crossbar invalidations and the
//! current write fence.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as SyncMutex, Weak},
};

use bson::{doc, Document};
use tracing::debug;

use crate::{
    bson_util,
    crossbar::Crossbar,
    cursor::CursorDescription,
    error::{Error, ErrorKind, Result},
    fence::{WriteFence, WriteToken},
    observe::{polling::PollingObserveDriver, ObserveCallback, ObserveHandle, ObserveMultiplexer},
    options::CursorOptions,
    session::Subscription,
    store::{DocumentStore, OplogHandle},
    BoxFuture,
};

/// How often an observe attempt retries when it races a multiplexer that is
/// concurrently shutting down.
const OBSERVE_RETRIES: usize = 3;

struct LiveInner {
    store: Arc<dyn DocumentStore>,
    crossbar: Crossbar,
    oplog: Option<Arc<dyn OplogHandle>>,
    multiplexers: SyncMutex<HashMap<String, ObserveMultiplexer>>,
}

/// A connection to the document store with live-query support. Cheap to
/// clone; clones share the multiplexer registry, so equivalent queries
/// observe through one driver no matter who asks.
#[derive(Clone)]
pub struct LiveConnection {
    inner: Arc<LiveInner>,
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field(
                "multiplexers",
                &self.inner.multiplexers.lock().unwrap().len(),
            )
            .finish()
    }
}

impl LiveConnection {
    /// Creates a live connection over `store` with no oplog: every observe
    /// polls.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_oplog(store, None)
    }

    /// Creates a live connection with an optional oplog handle. Queries the
    /// oplog cannot serve (or any query, while no oplog driver ships with
    /// this crate) fall back to polling.
    pub fn with_oplog(store: Arc<dyn DocumentStore>, oplog: Option<Arc<dyn OplogHandle>>) -> Self {
        Self {
            inner: Arc::new(LiveInner {
                store,
                crossbar: Crossbar::new(),
                oplog,
                multiplexers: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Builds a publishable cursor over this connection.
    pub fn find(
        &self,
        collection: impl Into<String>,
        selector: impl Into<bson::Bson>,
        options: CursorOptions,
    ) -> Result<LiveCursor> {
        Ok(LiveCursor {
            live: self.clone(),
            description: CursorDescription::new(collection, selector, options)?,
        })
    }

    pub(crate) fn crossbar(&self) -> &Crossbar {
        &self.inner.crossbar
    }

    /// The underlying store, for direct reads.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Whether an oplog driver could serve this description. With no oplog
    /// driver in this crate the answer is used only to shape the polling
    /// fallback; it mirrors the prerequisites the decision would use.
    fn oplog_eligible(&self, description: &CursorDescription, ordered: bool) -> bool {
        self.inner.oplog.is_some()
            && !ordered
            && !description.options.disable_oplog
            && !description.options.tailable
    }

    /// Starts (or joins) an observation of `description`. Equivalent
    /// descriptions share a multiplexer and its single driver; the handle's
    /// callback receives the current result set as initial adds, then live
    /// changes. The caller owns the handle and must stop it.
    pub async fn observe_changes(
        &self,
        description: CursorDescription,
        ordered: bool,
        callback: ObserveCallback,
        non_mutating_callbacks: bool,
    ) -> Result<ObserveHandle> {
        if description.options.tailable && ordered {
            return Err(Error::invalid_argument(
                "tailable cursors only support unordered, added-only observation",
            ));
        }
        if self.oplog_eligible(&description, ordered) {
            // No oplog driver ships with this crate; eligible queries poll.
            debug!(
                collection = description.collection.as_str(),
                "oplog-eligible query observed via polling"
            );
        }

        let key = description.canonical_key(ordered)?;
        // The callback survives failed attempts behind a delegating box, so
        // a retry can hand it to a fresh multiplexer.
        let callback = Arc::new(SyncMutex::new(callback));
        for _ in 0..OBSERVE_RETRIES {
            let multiplexer = self.multiplexer_for(&key, &description, ordered);
            let delegate = callback.clone();
            let attempt: ObserveCallback = Box::new(move |event| {
                (*delegate.lock().unwrap())(event);
            });
            match multiplexer
                .add_handle_and_send_initial_adds(attempt, non_mutating_callbacks)
                .await
            {
                Ok(handle) => return Ok(handle),
                // Lost a race against the multiplexer's shutdown; a fresh
                // multiplexer will be created on retry.
                Err(err) if matches!(err.kind.as_ref(), ErrorKind::Stopped { .. }) => {
                    debug!("observe raced a stopping multiplexer, retrying");
                    let mut multiplexers = self.inner.multiplexers.lock().unwrap();
                    if multiplexers
                        .get(&key)
                        .is_some_and(|existing| existing.stopped())
                    {
                        multiplexers.remove(&key);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::internal("observe kept racing multiplexer shutdowns"))
    }

    fn multiplexer_for(
        &self,
        key: &str,
        description: &CursorDescription,
        ordered: bool,
    ) -> ObserveMultiplexer {
        // Register the multiplexer before starting its driver, and without
        // holding the registry lock across the driver start: a query that
        // dies instantly runs the on_stop callback inline, and that callback
        // takes this same lock.
        let multiplexer = {
            let mut multiplexers = self.inner.multiplexers.lock().unwrap();
            if let Some(existing) = multiplexers.get(key) {
                return existing.clone();
            }
            let multiplexer = ObserveMultiplexer::new(ordered);
            multiplexers.insert(key.to_string(), multiplexer.clone());
            multiplexer
        };
        let driver = PollingObserveDriver::start(
            description.clone(),
            self.inner.store.clone(),
            &self.inner.crossbar,
            multiplexer.clone(),
            description.options.tailable,
        );
        let registry = Arc::downgrade(&self.inner);
        let registry_key = key.to_string();
        multiplexer.set_on_stop(move || {
            remove_from_registry(&registry, &registry_key);
            driver.stop();
        });
        multiplexer
    }

    /// Inserts a document (generating a random string `_id` when absent),
    /// then invalidates observers of its collection.
    pub async fn insert(&self, collection: &str, mut document: Document) -> Result<String> {
        if !document.contains_key("_id") {
            document.insert("_id", bson_util::random_id());
        }
        let id = bson_util::document_id(&document)?.to_string();
        let token = self.maybe_begin_write();
        self.inner.store.insert_one(collection, document).await?;
        self.invalidate(collection, std::iter::once(id.clone()));
        drop(token);
        Ok(id)
    }

    /// Applies an update to the first document matching `selector`, then
    /// invalidates observers of every document the selector could have
    /// touched.
    pub async fn update(
        &self,
        collection: &str,
        selector: Document,
        update: Document,
    ) -> Result<u64> {
        let token = self.maybe_begin_write();
        let ids = self.affected_ids(collection, &selector).await?;
        let modified = self
            .inner
            .store
            .update_one(collection, selector, update)
            .await?;
        self.invalidate(collection, ids.into_iter());
        drop(token);
        Ok(modified)
    }

    /// Deletes the first document matching `selector`, then invalidates
    /// observers of every document the selector could have touched.
    pub async fn remove(&self, collection: &str, selector: Document) -> Result<u64> {
        let token = self.maybe_begin_write();
        let ids = self.affected_ids(collection, &selector).await?;
        let deleted = self.inner.store.delete_one(collection, selector).await?;
        self.invalidate(collection, ids.into_iter());
        drop(token);
        Ok(deleted)
    }

    /// The write itself holds a slot on the current fence, so a method's
    /// fence cannot fire between the store write and the invalidations it
    /// triggers.
    fn maybe_begin_write(&self) -> Option<WriteToken> {
        WriteFence::current().and_then(|fence| match fence.begin_write() {
            Ok(token) => Some(token),
            Err(err) => {
                debug!("write on a fired fence: {}", err);
                None
            }
        })
    }

    /// The ids a selector-addressed write may touch: straight from the
    /// selector when it pins ids, otherwise looked up so that id-scoped
    /// observers still hear about the write.
    async fn affected_ids(&self, collection: &str, selector: &Document) -> Result<Vec<String>> {
        if let Some(ids) = bson_util::selector_id_filter(selector) {
            return Ok(ids);
        }
        let description = CursorDescription::new(
            collection,
            selector.clone(),
            CursorOptions::builder()
                .projection(Some(doc! { "_id": 1 }))
                .build(),
        )?;
        let docs = self.inner.store.find(&description).await?;
        Ok(docs
            .iter()
            .filter_map(|doc| bson_util::document_id(doc).ok().map(str::to_string))
            .collect())
    }

    fn invalidate(&self, collection: &str, ids: impl Iterator<Item = String>) {
        let mut any = false;
        for id in ids {
            any = true;
            self.inner
                .crossbar
                .fire(doc! { "collection": collection, "id": id });
        }
        if !any {
            self.inner.crossbar.fire(doc! { "collection": collection });
        }
    }

    #[cfg(test)]
    pub(crate) fn multiplexer_count(&self) -> usize {
        self.inner.multiplexers.lock().unwrap().len()
    }
}

fn remove_from_registry(registry: &Weak<LiveInner>, key: &str) {
    if let Some(inner) = registry.upgrade() {
        let mut multiplexers = inner.multiplexers.lock().unwrap();
        if multiplexers
            .get(key)
            .is_some_and(|existing| existing.stopped())
        {
            multiplexers.remove(key);
        }
    }
}

/// A query that a publish handler can return: publishing it observes the
/// query and forwards its changes into the subscription.
pub trait PublishableCursor: Send + Sync {
    /// The collection the cursor's documents belong to.
    fn collection_name(&self) -> &str;

    /// Observes the cursor on behalf of `subscription`, forwarding changes
    /// until the subscription stops.
    fn publish(self: Box<Self>, subscription: Arc<Subscription>) -> BoxFuture<'static, Result<()>>;
}

/// A concrete cursor over a [`LiveConnection`].
#[derive(Clone, Debug)]
pub struct LiveCursor {
    live: LiveConnection,
    description: CursorDescription,
}

impl LiveCursor {
    /// The cursor's immutable description.
    pub fn description(&self) -> &CursorDescription {
        &self.description
    }

    /// Runs the query once, without observing it.
    pub async fn fetch(&self) -> Result<Vec<Document>> {
        self.live.inner.store.find(&self.description).await
    }
}

impl PublishableCursor for LiveCursor {
    fn collection_name(&self) -> &str {
        &self.description.collection
    }

    fn publish(self: Box<Self>, subscription: Arc<Subscription>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let collection = self.description.collection.clone();
            let sub = subscription.clone();
            let handle = self
                .live
                .observe_changes(
                    self.description.clone(),
                    false,
                    Box::new(move |event| {
                        use crate::observe::ObserveEvent::*;
                        match &*event {
                            Added { id, fields }
                            | AddedBefore { id, fields, before: _ } => {
                                sub.added(&collection, id, fields.clone());
                            }
                            Changed { id, patch } => {
                                sub.changed(&collection, id, patch.clone());
                            }
                            Removed { id } => {
                                sub.removed(&collection, id);
                            }
                            MovedBefore { .. } => {}
                        }
                    }),
                    false,
                )
                .await?;
            subscription.adopt_observe_handle(handle);
            Ok(())
        })
    }
}
