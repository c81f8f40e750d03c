//! The polling observe driver: re-executes its query on every invalidation
//! signal (throttled) and on a periodic timer, diffs the results against
//! the previous snapshot, and feeds the changes to its multiplexer.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as SyncMutex, Weak},
};

use bson::{doc, Document};
use tracing::{debug, error, warn};

use crate::{
    bson_util,
    crossbar::{Crossbar, ListenerHandle},
    cursor::CursorDescription,
    diff::{self, DiffObserver, FieldPatch},
    fence::{WriteFence, WriteToken},
    observe::{ObserveEvent, ObserveMultiplexer},
    runtime::{self, AsyncJoinHandle},
    observe::throttle::Throttle,
    store::DocumentStore,
};

/// The previous poll's result set, in the shape the diff wants.
enum PollResults {
    Ordered(Vec<Document>),
    Unordered(HashMap<String, Document>),
}

struct PollingState {
    results: Option<PollResults>,
    polled_once: bool,
    // Commit tokens captured from fences current at invalidation time,
    // released once the poll cycle that covers them has flushed.
    pending_writes: Vec<WriteToken>,
    polls_scheduled_but_not_started: u8,
    stopped: bool,
    // Ids already reported by an added-only (tailable) driver.
    seen_ids: HashSet<String>,
    timer: Option<AsyncJoinHandle<()>>,
    listeners: Vec<ListenerHandle>,
}

struct PollingInner {
    description: CursorDescription,
    store: Arc<dyn DocumentStore>,
    multiplexer: ObserveMultiplexer,
    ordered: bool,
    added_only: bool,
    throttle: Throttle,
    state: SyncMutex<PollingState>,
}

/// Owns one query's poll loop and feeds one multiplexer.
#[derive(Clone)]
pub(crate) struct PollingObserveDriver {
    inner: Arc<PollingInner>,
}

impl std::fmt::Debug for PollingObserveDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingObserveDriver")
            .field("collection", &self.inner.description.collection)
            .field("ordered", &self.inner.ordered)
            .finish()
    }
}

impl PollingObserveDriver {
    /// Creates the driver, subscribes it to the crossbar, starts its
    /// forced-poll timer, and schedules the initial poll.
    pub(crate) fn start(
        description: CursorDescription,
        store: Arc<dyn DocumentStore>,
        crossbar: &Crossbar,
        multiplexer: ObserveMultiplexer,
        added_only: bool,
    ) -> Self {
        let ordered = multiplexer.ordered();
        let throttle_window = description.options.resolved_polling_throttle();
        let polling_interval = description.options.resolved_polling_interval();

        let inner = Arc::new_cyclic(|weak: &Weak<PollingInner>| {
            let scheduler = weak.clone();
            PollingInner {
                description,
                store,
                multiplexer,
                ordered,
                added_only,
                throttle: Throttle::new(throttle_window, move || {
                    if let Some(inner) = scheduler.upgrade() {
                        Self::schedule_poll(&inner);
                    }
                }),
                state: SyncMutex::new(PollingState {
                    results: None,
                    polled_once: false,
                    pending_writes: Vec::new(),
                    polls_scheduled_but_not_started: 0,
                    stopped: false,
                    seen_ids: HashSet::new(),
                    timer: None,
                    listeners: Vec::new(),
                }),
            }
        });

        let listeners = Self::listen_all(&inner, crossbar);
        let timer = Self::start_timer(Arc::downgrade(&inner), polling_interval);
        {
            let mut state = inner.state.lock().unwrap();
            state.listeners = listeners;
            state.timer = Some(timer);
        }

        let driver = Self { inner };
        driver.ensure_poll_scheduled();
        driver
    }

    /// Registers crossbar triggers covering this query: per-id triggers when
    /// the selector pins specific ids, otherwise one whole-collection
    /// trigger.
    fn listen_all(inner: &Arc<PollingInner>, crossbar: &Crossbar) -> Vec<ListenerHandle> {
        let collection = inner.description.collection.clone();
        let triggers: Vec<Document> =
            match bson_util::selector_id_filter(&inner.description.selector) {
                Some(ids) => ids
                    .into_iter()
                    .map(|id| doc! { "collection": collection.clone(), "id": id })
                    .collect(),
                None => vec![doc! { "collection": collection }],
            };
        triggers
            .into_iter()
            .map(|trigger| {
                let weak = Arc::downgrade(inner);
                crossbar.listen(trigger, move |_notification| {
                    if let Some(inner) = weak.upgrade() {
                        Self::on_invalidation(&inner);
                    }
                })
            })
            .collect()
    }

    fn start_timer(
        inner: Weak<PollingInner>,
        interval: std::time::Duration,
    ) -> AsyncJoinHandle<()> {
        runtime::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match inner.upgrade() {
                    Some(inner) => inner.throttle.call(),
                    None => return,
                }
            }
        })
    }

    fn on_invalidation(inner: &Arc<PollingInner>) {
        let schedule = {
            let mut state = inner.state.lock().unwrap();
            if state.stopped {
                return;
            }
            if let Some(fence) = WriteFence::current() {
                match fence.begin_write() {
                    Ok(token) => state.pending_writes.push(token),
                    Err(err) => debug!("fence refused write registration: {}", err),
                }
            }
            state.polls_scheduled_but_not_started == 0
        };
        if schedule {
            inner.throttle.call();
        }
    }

    fn ensure_poll_scheduled(&self) {
        let schedule = {
            let state = self.inner.state.lock().unwrap();
            !state.stopped && state.polls_scheduled_but_not_started == 0
        };
        if schedule {
            self.inner.throttle.call();
        }
    }

    fn schedule_poll(inner: &Arc<PollingInner>) {
        {
            let mut state = inner.state.lock().unwrap();
            if state.stopped || state.polls_scheduled_but_not_started >= 2 {
                return;
            }
            state.polls_scheduled_but_not_started += 1;
        }
        let task_inner = inner.clone();
        inner.multiplexer.queue().queue_task(move || async move {
            Self::poll_cycle(task_inner).await;
        });
    }

    /// One poll: query, diff, fan out, flush fences. Runs on the
    /// multiplexer's queue, so cycles are strictly serialized.
    async fn poll_cycle(inner: Arc<PollingInner>) {
        let (writes_for_cycle, first) = {
            let mut state = inner.state.lock().unwrap();
            state.polls_scheduled_but_not_started -= 1;
            if state.stopped {
                return;
            }
            (std::mem::take(&mut state.pending_writes), !state.polled_once)
        };

        let docs = match inner.store.find(&inner.description).await {
            Ok(docs) => docs,
            Err(err) => {
                if first && err.store_code().is_some() {
                    // A coded error on the very first poll is permanent:
                    // the query itself is bad.
                    for token in writes_for_cycle {
                        token.committed();
                    }
                    if let Err(report) = inner.multiplexer.query_error(err) {
                        error!("failed to report query error: {}", report);
                    }
                } else {
                    warn!(
                        collection = inner.description.collection.as_str(),
                        "poll failed, retrying on next cycle: {}", err
                    );
                    let mut state = inner.state.lock().unwrap();
                    let mut restored = writes_for_cycle;
                    restored.append(&mut state.pending_writes);
                    state.pending_writes = restored;
                }
                return;
            }
        };

        {
            let state = inner.state.lock().unwrap();
            if state.stopped {
                // The driver stopped while the query was in flight; its
                // results are abandoned and the captured fences released.
                drop(state);
                for token in writes_for_cycle {
                    token.committed();
                }
                return;
            }
        }

        let (events, new_results, newly_seen) = Self::compute_changes(&inner, docs);
        for event in events {
            if let Err(err) = inner.multiplexer.apply(event) {
                error!("observe driver emitted an inconsistent event: {}", err);
            }
        }
        if first {
            if let Err(err) = inner.multiplexer.mark_ready() {
                error!("readiness barrier failure: {}", err);
            }
        }
        {
            let mut state = inner.state.lock().unwrap();
            state.polled_once = true;
            state.results = new_results;
            state.seen_ids.extend(newly_seen);
        }
        inner.multiplexer.on_flush(move || {
            for token in writes_for_cycle {
                token.committed();
            }
        });
    }

    fn compute_changes(
        inner: &Arc<PollingInner>,
        docs: Vec<Document>,
    ) -> (Vec<ObserveEvent>, Option<PollResults>, Vec<String>) {
        if inner.added_only {
            let state = inner.state.lock().unwrap();
            let mut events = Vec::new();
            let mut newly_seen = Vec::new();
            for doc in &docs {
                if let Ok(id) = bson_util::document_id(doc) {
                    if !state.seen_ids.contains(id) && !newly_seen.iter().any(|s| s == id) {
                        events.push(ObserveEvent::Added {
                            id: id.to_string(),
                            fields: bson_util::fields_without_id(doc),
                        });
                        newly_seen.push(id.to_string());
                    }
                }
            }
            return (events, None, newly_seen);
        }

        let mut collector = EventCollector::default();
        let state = inner.state.lock().unwrap();
        if inner.ordered {
            let empty = Vec::new();
            let old = match &state.results {
                Some(PollResults::Ordered(old)) => old,
                _ => &empty,
            };
            diff::diff_ordered(old, &docs, &mut collector);
            drop(state);
            (
                collector.events,
                Some(PollResults::Ordered(docs)),
                Vec::new(),
            )
        } else {
            let empty = HashMap::new();
            let old = match &state.results {
                Some(PollResults::Unordered(old)) => old,
                _ => &empty,
            };
            let new: HashMap<String, Document> = docs
                .into_iter()
                .filter_map(|doc| match bson_util::document_id(&doc) {
                    Ok(id) => Some((id.to_string(), doc)),
                    Err(err) => {
                        warn!("dropping document without string _id: {}", err);
                        None
                    }
                })
                .collect();
            diff::diff_unordered(old, &new, &mut collector);
            drop(state);
            (
                collector.events,
                Some(PollResults::Unordered(new)),
                Vec::new(),
            )
        }
    }

    /// Stops polling: cancels the timer and crossbar listeners, releases
    /// every captured fence token, and abandons any in-flight poll.
    pub(crate) fn stop(&self) {
        let (writes, timer, listeners) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopped {
                return;
            }
            state.stopped = true;
            (
                std::mem::take(&mut state.pending_writes),
                state.timer.take(),
                std::mem::take(&mut state.listeners),
            )
        };
        self.inner.throttle.stop();
        if let Some(timer) = timer {
            timer.abort();
        }
        for listener in listeners {
            listener.stop();
        }
        for token in writes {
            token.committed();
        }
    }
}

/// Bridges the diff contract onto observe events.
#[derive(Default)]
struct EventCollector {
    events: Vec<ObserveEvent>,
}

impl DiffObserver for EventCollector {
    fn added(&mut self, id: &str, doc: &Document) {
        self.events.push(ObserveEvent::Added {
            id: id.to_string(),
            fields: bson_util::fields_without_id(doc),
        });
    }

    fn added_before(&mut self, id: &str, doc: &Document, before: Option<&str>) {
        self.events.push(ObserveEvent::AddedBefore {
            id: id.to_string(),
            fields: bson_util::fields_without_id(doc),
            before: before.map(str::to_string),
        });
    }

    fn changed(&mut self, id: &str, patch: FieldPatch) {
        self.events.push(ObserveEvent::Changed {
            id: id.to_string(),
            patch,
        });
    }

    fn moved_before(&mut self, id: &str, before: Option<&str>) {
        self.events.push(ObserveEvent::MovedBefore {
            id: id.to_string(),
            before: before.map(str::to_string),
        });
    }

    fn removed(&mut self, id: &str) {
        self.events.push(ObserveEvent::Removed { id: id.to_string() });
    }
}
