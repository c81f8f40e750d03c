//! Cursor descriptions: the immutable (collection, selector, options)
//! triples that identify queries and key multiplexer deduplication.

use bson::{doc, Bson, Document};

use crate::{
    bson_util,
    error::{Error, Result},
    options::CursorOptions,
};

/// An immutable description of a query against the document store. Two
/// descriptions are equivalent iff their canonical serializations are
/// byte-equal; equivalence is what lets concurrent observers share a single
/// driver.
#[derive(Clone, Debug, PartialEq)]
pub struct CursorDescription {
    /// The collection the query runs against.
    pub collection: String,

    /// The selector, after rewrite (see [`CursorDescription::new`]).
    pub selector: Document,

    /// The query options.
    pub options: CursorOptions,
}

impl CursorDescription {
    /// Creates a cursor description, applying the selector rewrite rules:
    ///
    /// - an array selector is an error;
    /// - a missing, null or empty selector, or one whose `_id` key holds a
    ///   falsy value, is rewritten to `{_id: <fresh random id>}`, a selector
    ///   guaranteed to match nothing;
    /// - a bare string selector is shorthand for `{_id: <string>}`.
    pub fn new(
        collection: impl Into<String>,
        selector: impl Into<Bson>,
        options: CursorOptions,
    ) -> Result<Self> {
        let selector = match selector.into() {
            Bson::Array(_) => {
                return Err(Error::invalid_argument("selector may not be an array"));
            }
            Bson::String(id) => doc! { "_id": id },
            Bson::Null => unmatchable_selector(),
            Bson::Document(doc) => {
                if doc.is_empty() || has_falsy_id(&doc) {
                    unmatchable_selector()
                } else {
                    doc
                }
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported selector type: {:?}",
                    other
                )));
            }
        };
        Ok(Self {
            collection: collection.into(),
            selector,
            options,
        })
    }

    /// The canonical serialization of this description plus the observe
    /// ordering flag: the multiplexer dedup key.
    pub(crate) fn canonical_key(&self, ordered: bool) -> Result<String> {
        let mut key = doc! {
            "collection": self.collection.clone(),
            "ordered": ordered,
            "selector": self.selector.clone(),
        };
        let mut options = Document::new();
        if let Some(sort) = &self.options.sort {
            options.insert("sort", sort.clone());
        }
        if let Some(projection) = &self.options.projection {
            options.insert("projection", projection.clone());
        }
        if let Some(limit) = self.options.limit {
            options.insert("limit", limit as i64);
        }
        if let Some(skip) = self.options.skip {
            options.insert("skip", skip as i64);
        }
        if self.options.tailable {
            options.insert("tailable", true);
        }
        if self.options.disable_oplog {
            options.insert("disableOplog", true);
        }
        if let Some(throttle) = self.options.polling_throttle {
            options.insert("pollingThrottleMs", throttle.as_millis() as i64);
        }
        if let Some(interval) = self.options.polling_interval {
            options.insert("pollingIntervalMs", interval.as_millis() as i64);
        }
        if let Some(max_time) = self.options.max_time {
            options.insert("maxTimeMs", max_time.as_millis() as i64);
        }
        key.insert("options", options);
        bson_util::canonical_stringify(&Bson::Document(key))
    }
}

fn unmatchable_selector() -> Document {
    doc! { "_id": bson_util::random_id() }
}

fn has_falsy_id(selector: &Document) -> bool {
    match selector.get("_id") {
        None => false,
        Some(Bson::Null) => true,
        Some(Bson::Boolean(b)) => !b,
        Some(Bson::String(s)) => s.is_empty(),
        Some(Bson::Int32(n)) => *n == 0,
        Some(Bson::Int64(n)) => *n == 0,
        Some(Bson::Double(n)) => *n == 0.0,
        Some(_) => false,
    }
}
