//! Live query observation: the caching change observer, the deduplicating
//! multiplexer, and the polling driver that feeds it.

pub(crate) mod cache;
pub(crate) mod multiplexer;
pub(crate) mod ordered_dict;
pub(crate) mod polling;
pub(crate) mod throttle;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bson::Document;

use crate::diff::FieldPatch;

pub use multiplexer::ObserveMultiplexer;

/// One change observed on a query's result set. Ordered observers see the
/// `*Before` variants; unordered observers see `Added`.
#[derive(Clone, Debug, PartialEq)]
pub enum ObserveEvent {
    /// A document entered an unordered result set.
    Added {
        /// The document id.
        id: String,
        /// The document's fields, without `_id`.
        fields: Document,
    },
    /// A document entered an ordered result set before `before` (`None`
    /// means at the end).
    AddedBefore {
        /// The document id.
        id: String,
        /// The document's fields, without `_id`.
        fields: Document,
        /// The id of the document this one precedes.
        before: Option<String>,
    },
    /// A document's fields changed.
    Changed {
        /// The document id.
        id: String,
        /// The minimal field patch.
        patch: FieldPatch,
    },
    /// A document moved within an ordered result set.
    MovedBefore {
        /// The document id.
        id: String,
        /// The id of the document this one now precedes.
        before: Option<String>,
    },
    /// A document left the result set.
    Removed {
        /// The document id.
        id: String,
    },
}

impl ObserveEvent {
    /// The id of the document this event concerns.
    pub fn id(&self) -> &str {
        match self {
            ObserveEvent::Added { id, .. }
            | ObserveEvent::AddedBefore { id, .. }
            | ObserveEvent::Changed { id, .. }
            | ObserveEvent::MovedBefore { id, .. }
            | ObserveEvent::Removed { id } => id,
        }
    }

    /// Whether this is an add. Only adds may reach a multiplexer before its
    /// readiness barrier.
    pub(crate) fn is_add(&self) -> bool {
        matches!(
            self,
            ObserveEvent::Added { .. } | ObserveEvent::AddedBefore { .. }
        )
    }
}

/// The callback a subscriber attaches to an observe handle. Events arrive
/// serialized in multiplexer order; the initial contents of the query are
/// delivered as a leading burst of add events.
///
/// The `Arc` is shared between handles whose callbacks declared themselves
/// non-mutating and freshly cloned for everyone else, so a subscriber that
/// wants to mutate the event may `Arc::make_mut` only if it registered with
/// `non_mutating_callbacks: false`.
pub type ObserveCallback = Box<dyn FnMut(Arc<ObserveEvent>) + Send>;

/// A single subscriber's attachment to a multiplexer. Dropping the handle
/// stops it.
#[derive(Debug)]
pub struct ObserveHandle {
    pub(crate) id: u64,
    pub(crate) multiplexer: ObserveMultiplexer,
    pub(crate) stopped: Arc<AtomicBool>,
}

impl ObserveHandle {
    /// Detaches from the multiplexer. No further events are delivered, even
    /// ones already in flight. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.multiplexer.remove_handle(self.id);
        }
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
