//! The caching change observer: the authoritative snapshot of a query's
//! current documents, maintained by replaying the driver's change events.

use std::collections::HashMap;

use bson::Document;

use crate::{
    error::{Error, Result},
    observe::{ordered_dict::OrderedDict, ObserveEvent},
};

/// The multiplexer's document cache. The ordered flavor preserves
/// insertion/move order; the unordered flavor is a plain id → document map.
#[derive(Clone, Debug)]
pub(crate) enum DocCache {
    Unordered(HashMap<String, Document>),
    Ordered(OrderedDict),
}

impl DocCache {
    pub(crate) fn new(ordered: bool) -> Self {
        if ordered {
            DocCache::Ordered(OrderedDict::new())
        } else {
            DocCache::Unordered(HashMap::new())
        }
    }

    /// Applies one change event. The cache is updated atomically: an error
    /// leaves it untouched.
    pub(crate) fn apply(&mut self, event: &ObserveEvent) -> Result<()> {
        match (self, event) {
            (DocCache::Unordered(docs), ObserveEvent::Added { id, fields }) => {
                if docs.contains_key(id) {
                    return Err(Error::internal(format!("added existing document {}", id)));
                }
                docs.insert(id.clone(), with_id(id, fields.clone()));
                Ok(())
            }
            (DocCache::Ordered(docs), ObserveEvent::AddedBefore { id, fields, before }) => {
                docs.insert_before(id.clone(), with_id(id, fields.clone()), before.as_deref())
            }
            (DocCache::Unordered(docs), ObserveEvent::Changed { id, patch }) => {
                let doc = docs
                    .get_mut(id)
                    .ok_or_else(|| Error::internal(format!("changed unknown document {}", id)))?;
                apply_patch(doc, patch);
                Ok(())
            }
            (DocCache::Ordered(docs), ObserveEvent::Changed { id, patch }) => {
                let doc = docs
                    .get_mut(id)
                    .ok_or_else(|| Error::internal(format!("changed unknown document {}", id)))?;
                apply_patch(doc, patch);
                Ok(())
            }
            (DocCache::Ordered(docs), ObserveEvent::MovedBefore { id, before }) => {
                docs.move_before(id, before.as_deref())
            }
            (DocCache::Unordered(docs), ObserveEvent::Removed { id }) => {
                docs.remove(id)
                    .map(drop)
                    .ok_or_else(|| Error::internal(format!("removed unknown document {}", id)))
            }
            (DocCache::Ordered(docs), ObserveEvent::Removed { id }) => {
                docs.remove(id).map(drop)
            }
            (DocCache::Unordered(_), event) => Err(Error::internal(format!(
                "ordered event on unordered cache: {:?}",
                event
            ))),
            (DocCache::Ordered(_), event) => Err(Error::internal(format!(
                "unordered event on ordered cache: {:?}",
                event
            ))),
        }
    }

    /// Snapshots the cache as a sequence of `(id, fields-without-id)`
    /// pairs, in order for ordered caches.
    pub(crate) fn docs(&self) -> Vec<(String, Document)> {
        match self {
            DocCache::Unordered(docs) => docs
                .iter()
                .map(|(id, doc)| (id.clone(), without_id(doc)))
                .collect(),
            DocCache::Ordered(docs) => docs
                .iter()
                .map(|(id, doc)| (id.to_string(), without_id(doc)))
                .collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        match self {
            DocCache::Unordered(docs) => docs.len(),
            DocCache::Ordered(docs) => docs.len(),
        }
    }
}

fn with_id(id: &str, mut fields: Document) -> Document {
    fields.insert("_id", id);
    fields
}

fn without_id(doc: &Document) -> Document {
    let mut fields = doc.clone();
    fields.remove("_id");
    fields
}

fn apply_patch(doc: &mut Document, patch: &crate::diff::FieldPatch) {
    for (key, value) in patch.updated.iter() {
        doc.insert(key.clone(), value.clone());
    }
    for key in &patch.cleared {
        doc.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use crate::diff::FieldPatch;

    use super::*;

    fn added(id: &str, fields: Document) -> ObserveEvent {
        ObserveEvent::Added {
            id: id.to_string(),
            fields,
        }
    }

    fn added_before(id: &str, fields: Document, before: Option<&str>) -> ObserveEvent {
        ObserveEvent::AddedBefore {
            id: id.to_string(),
            fields,
            before: before.map(str::to_string),
        }
    }

    #[test]
    fn unordered_cache_applies_field_patches() {
        let mut cache = DocCache::new(false);
        cache.apply(&added("a", doc! { "x": 1, "y": 2 })).unwrap();
        cache
            .apply(&ObserveEvent::Changed {
                id: "a".to_string(),
                patch: FieldPatch {
                    updated: doc! { "x": 10 },
                    cleared: vec!["y".to_string()],
                },
            })
            .unwrap();
        let docs = cache.docs();
        assert_eq!(docs, vec![("a".to_string(), doc! { "x": 10 })]);
    }

    #[test]
    fn changed_on_missing_document_is_an_error() {
        let mut cache = DocCache::new(false);
        let err = cache
            .apply(&ObserveEvent::Changed {
                id: "ghost".to_string(),
                patch: FieldPatch::default(),
            })
            .unwrap_err();
        assert!(err.to_string().contains("unknown document"));
    }

    #[test]
    fn ordered_cache_respects_anchors_and_moves() {
        let mut cache = DocCache::new(true);
        cache.apply(&added_before("a", doc! {}, None)).unwrap();
        cache.apply(&added_before("c", doc! {}, None)).unwrap();
        cache.apply(&added_before("b", doc! {}, Some("c"))).unwrap();
        cache
            .apply(&ObserveEvent::MovedBefore {
                id: "c".to_string(),
                before: Some("a".to_string()),
            })
            .unwrap();
        let order: Vec<String> = cache.docs().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn mode_mismatch_is_an_error() {
        let mut unordered = DocCache::new(false);
        assert!(unordered
            .apply(&added_before("a", doc! {}, None))
            .is_err());
        let mut ordered = DocCache::new(true);
        assert!(ordered.apply(&added("a", doc! {})).is_err());
    }

    #[test]
    fn removal_empties_the_cache() {
        let mut cache = DocCache::new(true);
        cache.apply(&added_before("a", doc! {}, None)).unwrap();
        cache
            .apply(&ObserveEvent::Removed {
                id: "a".to_string(),
            })
            .unwrap();
        assert_eq!(cache.len(), 0);
        assert!(cache
            .apply(&ObserveEvent::Removed {
                id: "a".to_string(),
            })
            .is_err());
    }
}
