//! The invalidation crossbar: a pattern-matched notification bus between
//! write sites and the observe drivers interested in them. Writers `fire`
//! notifications; drivers `listen` with a trigger pattern and get called
//! for every notification the trigger subset-matches.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as SyncMutex, Weak},
};

use bson::{Bson, Document};

/// The notification bus. Cheap to clone; all clones share the listener
/// table.
#[derive(Clone, Debug, Default)]
pub(crate) struct Crossbar {
    inner: Arc<CrossbarInner>,
}

#[derive(Debug, Default)]
struct CrossbarInner {
    state: SyncMutex<CrossbarState>,
}

#[derive(Default)]
struct CrossbarState {
    next_id: u64,
    // Listeners bucketed by the `collection` key of their trigger; the
    // empty-string bucket holds triggers with no collection restriction.
    listeners_by_collection: HashMap<String, HashMap<u64, Listener>>,
}

impl std::fmt::Debug for CrossbarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossbarState")
            .field("next_id", &self.next_id)
            .field(
                "buckets",
                &self
                    .listeners_by_collection
                    .iter()
                    .map(|(k, v)| (k.clone(), v.len()))
                    .collect::<HashMap<_, _>>(),
            )
            .finish()
    }
}

struct Listener {
    trigger: Document,
    callback: Arc<dyn Fn(&Document) + Send + Sync>,
}

impl Crossbar {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Safe to call from inside a callback on this
    /// same bar.
    pub(crate) fn listen(
        &self,
        trigger: Document,
        callback: impl Fn(&Document) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let collection = trigger_collection(&trigger);
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state
            .listeners_by_collection
            .entry(collection.clone())
            .or_default()
            .insert(
                id,
                Listener {
                    trigger,
                    callback: Arc::new(callback),
                },
            );
        ListenerHandle {
            bar: Arc::downgrade(&self.inner),
            collection,
            id,
        }
    }

    /// Delivers `notification` to every listener whose trigger matches it.
    /// The matching set is snapshotted before any callback runs, so
    /// listeners may stop themselves or register new listeners from inside
    /// their callbacks. Listeners that want to block the current write fence
    /// must `begin_write` on it before returning; the fire loop does not
    /// wait for them.
    pub(crate) fn fire(&self, notification: Document) {
        let matched: Vec<Arc<dyn Fn(&Document) + Send + Sync>> = {
            let state = self.inner.state.lock().unwrap();
            let mut matched = Vec::new();
            let mut collect = |bucket: &str| {
                if let Some(listeners) = state.listeners_by_collection.get(bucket) {
                    for listener in listeners.values() {
                        if matches(&listener.trigger, &notification) {
                            matched.push(listener.callback.clone());
                        }
                    }
                }
            };
            let collection = trigger_collection(&notification);
            collect(&collection);
            if !collection.is_empty() {
                collect("");
            }
            matched
        };
        for callback in matched {
            callback(&notification);
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .listeners_by_collection
            .values()
            .map(|bucket| bucket.len())
            .sum()
    }
}

fn trigger_collection(doc: &Document) -> String {
    match doc.get("collection") {
        Some(Bson::String(name)) => name.clone(),
        _ => String::new(),
    }
}

/// A notification matches a trigger iff every key present in the trigger
/// exists in the notification with an equal value. String `id` keys take a
/// direct comparison; everything else compares by deep value equality.
fn matches(trigger: &Document, notification: &Document) -> bool {
    trigger.iter().all(|(key, trigger_value)| {
        match (trigger_value, notification.get(key)) {
            (Bson::String(a), Some(Bson::String(b))) if key == "id" => a == b,
            (expected, Some(actual)) => expected == actual,
            (_, None) => false,
        }
    })
}

/// Stop handle for one crossbar listener. Idempotent; safe to call from
/// inside a callback on the same bar.
#[derive(Debug)]
pub(crate) struct ListenerHandle {
    bar: Weak<CrossbarInner>,
    collection: String,
    id: u64,
}

impl ListenerHandle {
    pub(crate) fn stop(&self) {
        if let Some(bar) = self.bar.upgrade() {
            let mut state = bar.state.lock().unwrap();
            if let Some(bucket) = state.listeners_by_collection.get_mut(&self.collection) {
                bucket.remove(&self.id);
                if bucket.is_empty() {
                    state.listeners_by_collection.remove(&self.collection);
                }
            }
        }
    }
}
