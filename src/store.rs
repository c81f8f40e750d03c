//! Interfaces to the external collaborators around the live-data engine:
//! the document store, the selector matcher, the sorter, and the oplog
//! tailer. The engine only ever talks to these traits; concrete drivers
//! live outside this crate.

use async_trait::async_trait;
use bson::Document;

use crate::{
    cursor::CursorDescription,
    error::{Error, ErrorKind, Result},
};

/// A MongoDB-compatible document store. `find` executes a cursor
/// description and returns the matching documents with selector, sort,
/// projection, skip, limit and `max_time` already applied.
///
/// Errors carrying a numeric code are permanent query errors (for example a
/// malformed selector); the polling driver gives up on the query when it
/// sees one on the first poll. Codeless errors are transient and retried.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Executes a query and returns all matching documents, in sort order
    /// when the description carries one.
    async fn find(&self, description: &CursorDescription) -> Result<Vec<Document>>;

    /// Fetches a single document by id.
    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Inserts a document.
    async fn insert_one(&self, collection: &str, document: Document) -> Result<()>;

    /// Applies an update document to the first document matching `selector`.
    /// Returns the number of documents modified.
    async fn update_one(
        &self,
        collection: &str,
        selector: Document,
        update: Document,
    ) -> Result<u64>;

    /// Deletes the first document matching `selector`. Returns the number of
    /// documents deleted.
    async fn delete_one(&self, collection: &str, selector: Document) -> Result<u64>;
}

impl dyn DocumentStore {
    /// Builds a permanent (coded) store error.
    pub fn permanent_error(code: i32, message: impl Into<String>) -> Error {
        ErrorKind::Store {
            message: message.into(),
            code: Some(code),
        }
        .into()
    }

    /// Builds a transient (codeless) store error.
    pub fn transient_error(message: impl Into<String>) -> Error {
        ErrorKind::Store {
            message: message.into(),
            code: None,
        }
        .into()
    }
}

/// The outcome of matching one document against a selector.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct MatchResult {
    /// Whether the document matched.
    pub result: bool,
    /// For array selectors, the indices that satisfied the match.
    pub array_indices: Option<Vec<usize>>,
    /// For `$near` selectors, the distance of the match; `None` when the
    /// selector has no distance semantics or nothing matched.
    pub distance: Option<f64>,
}

/// A compiled selector: a black-box predicate over documents. Compilation
/// happens outside this crate; the engine only asks whether documents match
/// and what shape the selector has.
pub trait Matcher: Send + Sync {
    /// Matches a single document.
    fn document_matches(&self, doc: &Document) -> MatchResult;

    /// Whether the selector is a simple equality match over fields.
    fn is_simple(&self) -> bool;

    /// Whether the selector contains a geospatial clause.
    fn has_geo_query(&self) -> bool;

    /// Whether applying `modifier` to a non-matching document could make it
    /// match.
    fn can_become_true_by_modifier(&self, modifier: &Document) -> bool;

    /// Whether applying `modifier` could change this selector's verdict on
    /// any document.
    fn affected_by_modifier(&self, modifier: &Document) -> bool;

    /// Folds the fields this selector reads into `projection`, so a driver
    /// can fetch just enough of each document to re-run the match.
    fn combine_into_projection(&self, projection: Document) -> Document;
}

/// A compiled sort specification: a black-box comparator over documents.
pub trait Sorter: Send + Sync {
    /// Compares two documents per the sort specification.
    fn cmp(&self, a: &Document, b: &Document) -> std::cmp::Ordering;
}

/// A single mutation observed on the oplog.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct OplogEntry {
    /// The collection the mutation applies to.
    pub collection: String,
    /// The id of the mutated document.
    pub id: String,
    /// The operation kind.
    pub op: OplogOp,
}

/// The kind of an oplog mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplogOp {
    /// A document was inserted.
    Insert,
    /// A document was updated.
    Update,
    /// A document was removed.
    Remove,
}

/// A tailer of the store's oplog for the current database: a callback per
/// mutation and a stop handle. Only queries the oplog driver supports
/// observe through it; everything else polls.
pub trait OplogHandle: Send + Sync {
    /// Registers a callback invoked once per observed mutation. Returns a
    /// token to pass to [`OplogHandle::stop`].
    fn on_entry(&self, callback: Box<dyn Fn(&OplogEntry) + Send + Sync>) -> u64;

    /// Deregisters a callback; idempotent.
    fn stop(&self, token: u64);
}
