//! The observe multiplexer: a consistent fan-out from one driver to any
//! number of observe handles over the same query. Handles added later
//! catch up from the authoritative document cache; the readiness barrier
//! separates the initial query population from live changes.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as SyncMutex,
    },
};

use tokio::sync::watch;
use tracing::error;

use crate::{
    error::{Error, Result},
    observe::{cache::DocCache, ObserveCallback, ObserveEvent, ObserveHandle},
    task_queue::TaskQueue,
};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
enum ReadyState {
    Pending,
    Ready,
    Failed(Error),
}

struct HandleEntry {
    callback: Arc<SyncMutex<ObserveCallback>>,
    stopped: Arc<AtomicBool>,
    non_mutating: bool,
}

struct MuxState {
    cache: DocCache,
    handles: BTreeMap<u64, HandleEntry>,
    // addHandle tasks accepted but whose initial adds have not drained yet;
    // the multiplexer must not stop while any remain.
    pending_add_tasks: usize,
    stopped: bool,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

struct MuxInner {
    ordered: bool,
    queue: TaskQueue,
    state: SyncMutex<MuxState>,
    ready_tx: watch::Sender<ReadyState>,
    ready_rx: watch::Receiver<ReadyState>,
}

/// Fan-out point between one observe driver and N handles. Cheap to clone.
#[derive(Clone)]
pub struct ObserveMultiplexer {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for ObserveMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ObserveMultiplexer")
            .field("ordered", &self.inner.ordered)
            .field("handles", &state.handles.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl ObserveMultiplexer {
    /// Creates a multiplexer with an empty cache and no handles. The
    /// `on_stop` callback (set separately, after the driver exists) runs
    /// exactly once, when the last handle detaches or the query fails.
    pub(crate) fn new(ordered: bool) -> Self {
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        Self {
            inner: Arc::new(MuxInner {
                ordered,
                queue: TaskQueue::new(),
                state: SyncMutex::new(MuxState {
                    cache: DocCache::new(ordered),
                    handles: BTreeMap::new(),
                    pending_add_tasks: 0,
                    stopped: false,
                    on_stop: None,
                }),
                ready_tx,
                ready_rx,
            }),
        }
    }

    pub(crate) fn set_on_stop(&self, on_stop: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopped {
                // The driver failed before the callback was registered (e.g.
                // an immediate query error); notify straight away.
                true
            } else {
                state.on_stop = Some(Box::new(on_stop));
                return;
            }
        };
        if run_now {
            on_stop();
        }
    }

    pub(crate) fn ordered(&self) -> bool {
        self.inner.ordered
    }

    /// The queue all of this multiplexer's work is serialized on. The
    /// driver schedules its poll cycles here.
    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    /// Attaches a new handle: its callback first receives an add event per
    /// cached document, then live changes in order. The future resolves once
    /// the multiplexer is ready, or fails with the query error that killed
    /// it.
    pub(crate) async fn add_handle_and_send_initial_adds(
        &self,
        callback: ObserveCallback,
        non_mutating: bool,
    ) -> Result<ObserveHandle> {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        let stopped = Arc::new(AtomicBool::new(false));
        let entry = HandleEntry {
            callback: Arc::new(SyncMutex::new(callback)),
            stopped: stopped.clone(),
            non_mutating,
        };
        self.inner.state.lock().unwrap().pending_add_tasks += 1;

        let mux = self.clone();
        let ordered = self.inner.ordered;
        self.inner
            .queue
            .run_task(move || async move {
                let initial = {
                    let mut state = mux.inner.state.lock().unwrap();
                    if state.stopped {
                        state.pending_add_tasks -= 1;
                        None
                    } else {
                        let docs = state.cache.docs();
                        state.handles.insert(id, entry);
                        Some(docs)
                    }
                };
                let Some(docs) = initial else {
                    // Propagate the query error that stopped the multiplexer
                    // when there is one; a plain stop is retryable by the
                    // registry.
                    let failure = match &*mux.inner.ready_rx.borrow() {
                        ReadyState::Failed(err) => err.clone(),
                        _ => Error::stopped("multiplexer already stopped"),
                    };
                    return Err(failure);
                };
                // Deliver the current cache as this handle's initial adds;
                // later events flow through the regular fan-out.
                let callback = {
                    let state = mux.inner.state.lock().unwrap();
                    state.handles.get(&id).map(|entry| entry.callback.clone())
                };
                if let Some(callback) = callback {
                    let mut callback = callback.lock().unwrap();
                    for (doc_id, fields) in docs {
                        if stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        let event = if ordered {
                            ObserveEvent::AddedBefore {
                                id: doc_id,
                                fields,
                                before: None,
                            }
                        } else {
                            ObserveEvent::Added { id: doc_id, fields }
                        };
                        (*callback)(Arc::new(event));
                    }
                }
                mux.inner.state.lock().unwrap().pending_add_tasks -= 1;
                Ok(())
            })
            .await?;

        self.await_ready().await?;
        Ok(ObserveHandle {
            id,
            multiplexer: self.clone(),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn await_ready(&self) -> Result<()> {
        let mut rx = self.inner.ready_rx.clone();
        loop {
            let snapshot = rx.borrow_and_update().clone();
            match snapshot {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(err) => return Err(err),
                ReadyState::Pending => {
                    if rx.changed().await.is_err() {
                        return Err(Error::stopped("multiplexer dropped before becoming ready"));
                    }
                }
            }
        }
    }

    /// Detaches a handle. Synchronous: as soon as this returns, the handle's
    /// callback sees nothing further. When the last handle goes away (and no
    /// add is in flight) the multiplexer stops and runs its `on_stop`.
    pub(crate) fn remove_handle(&self, id: u64) {
        let became_empty = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(entry) = state.handles.remove(&id) {
                entry.stopped.store(true, Ordering::SeqCst);
            }
            !state.stopped && state.handles.is_empty() && state.pending_add_tasks == 0
        };
        if became_empty {
            self.stop_and_notify();
        }
    }

    /// Applies one driver event: cache first, then fan-out to every live
    /// handle. Must be called from within this multiplexer's queue. Before
    /// the readiness barrier only add events are legal; anything else is a
    /// driver bug.
    pub(crate) fn apply(&self, event: ObserveEvent) -> Result<()> {
        let fanout: Vec<(Arc<SyncMutex<ObserveCallback>>, Arc<AtomicBool>, bool)> = {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopped {
                return Ok(());
            }
            if !self.is_ready() && !event.is_add() {
                return Err(Error::internal(format!(
                    "non-add event before multiplexer ready: {:?}",
                    event
                )));
            }
            state.cache.apply(&event)?;
            state
                .handles
                .values()
                .map(|entry| {
                    (
                        entry.callback.clone(),
                        entry.stopped.clone(),
                        entry.non_mutating,
                    )
                })
                .collect()
        };
        let shared = Arc::new(event);
        for (callback, stopped, non_mutating) in fanout {
            if stopped.load(Ordering::SeqCst) {
                continue;
            }
            // Non-mutating subscribers may alias one event; the rest get
            // their own deep copy.
            let event = if non_mutating {
                shared.clone()
            } else {
                Arc::new((*shared).clone())
            };
            (*callback.lock().unwrap())(event);
        }
        Ok(())
    }

    /// Resolves the readiness barrier. Must be called from within this
    /// multiplexer's queue, exactly once.
    pub(crate) fn mark_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Err(Error::internal("multiplexer marked ready twice"));
        }
        let _ = self.inner.ready_tx.send(ReadyState::Ready);
        Ok(())
    }

    /// Aborts an unready multiplexer: every pending `add_handle` call fails
    /// with `err` and the multiplexer stops. Calling this after ready is a
    /// driver bug.
    pub(crate) fn query_error(&self, err: Error) -> Result<()> {
        if self.is_ready() {
            return Err(Error::internal(
                "query error reported after multiplexer became ready",
            ));
        }
        let _ = self.inner.ready_tx.send(ReadyState::Failed(err));
        self.stop_and_notify();
        Ok(())
    }

    /// Enqueues `callback` behind everything already enqueued: by the time
    /// it runs, every prior event has been fanned out to every handle.
    pub(crate) fn on_flush(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.queue.queue_task(move || async move {
            callback();
        });
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(*self.inner.ready_rx.borrow(), ReadyState::Ready)
    }

    fn stop_and_notify(&self) {
        let on_stop = {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopped {
                return;
            }
            state.stopped = true;
            for entry in state.handles.values() {
                entry.stopped.store(true, Ordering::SeqCst);
            }
            state.handles.clear();
            state.on_stop.take()
        };
        match on_stop {
            Some(on_stop) => on_stop(),
            // set_on_stop observes the stopped flag and self-notifies.
            None => error!("multiplexer stopped before its owner registered on_stop"),
        }
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        self.inner.state.lock().unwrap().handles.len()
    }

    pub(crate) fn stopped(&self) -> bool {
        self.inner.state.lock().unwrap().stopped
    }
}
