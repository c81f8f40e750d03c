//! The merge-box: the per-session, per-collection materialized view of
//! everything the client is subscribed to. Each field keeps a precedence
//! list of the subscriptions contributing a value for it; the head of the
//! list is what the client sees.

use std::collections::{HashMap, HashSet};

use bson::{Bson, Document};

use crate::{
    diff::{self, FieldPatch},
    error::{Error, Result},
};

#[derive(Clone, Debug)]
struct PrecedenceEntry {
    subscription_handle: String,
    value: Bson,
}

/// One document as seen by one session, merged across subscriptions.
#[derive(Clone, Debug, Default)]
pub(crate) struct DocumentView {
    exists_in: HashSet<String>,
    data_by_key: HashMap<String, Vec<PrecedenceEntry>>,
}

impl DocumentView {
    /// The client-visible image: every field's head value, keys sorted.
    pub(crate) fn client_fields(&self) -> Document {
        let mut keys: Vec<&String> = self.data_by_key.keys().collect();
        keys.sort();
        let mut fields = Document::new();
        for key in keys {
            if let Some(head) = self.data_by_key.get(key).and_then(|p| p.first()) {
                fields.insert(key.clone(), head.value.clone());
            }
        }
        fields
    }

    /// Records `subscription_handle`'s value for `key`, noting the
    /// client-visible consequence (if any) in `collector`. `is_add` marks
    /// the call as part of an `added`, where the subscription is known not
    /// to have contributed the field yet.
    fn change_field(
        &mut self,
        subscription_handle: &str,
        key: &str,
        value: Bson,
        collector: &mut FieldPatch,
        is_add: bool,
    ) {
        if key == "_id" {
            return;
        }
        if !self.data_by_key.contains_key(key) {
            self.data_by_key.insert(
                key.to_string(),
                vec![PrecedenceEntry {
                    subscription_handle: subscription_handle.to_string(),
                    value: value.clone(),
                }],
            );
            collector.updated.insert(key, value);
            return;
        }
        let Some(precedence) = self.data_by_key.get_mut(key) else {
            return;
        };
        let existing = if is_add {
            None
        } else {
            precedence
                .iter_mut()
                .enumerate()
                .find(|(_, entry)| entry.subscription_handle == subscription_handle)
        };
        match existing {
            Some((index, entry)) => {
                if index == 0 && entry.value != value {
                    collector.updated.insert(key, value.clone());
                }
                entry.value = value;
            }
            None => {
                // A later contributor never changes what the client sees.
                precedence.push(PrecedenceEntry {
                    subscription_handle: subscription_handle.to_string(),
                    value,
                });
            }
        }
    }

    /// Withdraws `subscription_handle`'s value for `key`. The collector
    /// records a clear when the field disappears entirely, or the new head
    /// value when a lower-precedence contributor takes over with a
    /// different value.
    fn clear_field(&mut self, subscription_handle: &str, key: &str, collector: &mut FieldPatch) {
        if key == "_id" {
            return;
        }
        let Some(precedence) = self.data_by_key.get_mut(key) else {
            return;
        };
        let Some(index) = precedence
            .iter()
            .position(|entry| entry.subscription_handle == subscription_handle)
        else {
            return;
        };
        let removed_head = (index == 0).then(|| precedence[0].value.clone());
        precedence.remove(index);
        if precedence.is_empty() {
            self.data_by_key.remove(key);
            collector.cleared.push(key.to_string());
        } else if let Some(old_value) = removed_head {
            let new_head = &precedence[0].value;
            if *new_head != old_value {
                collector.updated.insert(key, new_head.clone());
            }
        }
    }
}

/// The client-visible consequence of one merge-box operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ViewChange {
    Added { id: String, fields: Document },
    Changed { id: String, patch: FieldPatch },
    Removed { id: String },
}

/// All of one collection's documents for one session.
#[derive(Clone, Debug)]
pub(crate) struct SessionCollectionView {
    collection: String,
    documents: HashMap<String, DocumentView>,
}

impl SessionCollectionView {
    pub(crate) fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            documents: HashMap::new(),
        }
    }

    pub(crate) fn collection(&self) -> &str {
        &self.collection
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// The client-visible image of one document.
    pub(crate) fn client_fields(&self, id: &str) -> Option<Document> {
        self.documents.get(id).map(DocumentView::client_fields)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// A subscription reports a document. The first reporter produces an
    /// `Added`; overlapping reporters produce a (possibly empty) `Changed`
    /// reflecting only fields whose client-visible value moved.
    pub(crate) fn added(
        &mut self,
        subscription_handle: &str,
        id: &str,
        fields: Document,
    ) -> ViewChange {
        let is_new = !self.documents.contains_key(id);
        let view = self.documents.entry(id.to_string()).or_default();
        view.exists_in.insert(subscription_handle.to_string());
        let mut collector = FieldPatch::default();
        for (key, value) in fields {
            view.change_field(subscription_handle, &key, value, &mut collector, true);
        }
        if is_new {
            ViewChange::Added {
                id: id.to_string(),
                fields: collector.updated,
            }
        } else {
            ViewChange::Changed {
                id: id.to_string(),
                patch: collector,
            }
        }
    }

    /// A subscription reports field changes for a document it contributed.
    pub(crate) fn changed(
        &mut self,
        subscription_handle: &str,
        id: &str,
        patch: FieldPatch,
    ) -> Result<ViewChange> {
        let view = self.documents.get_mut(id).ok_or_else(|| {
            Error::internal(format!(
                "changed for unknown document {}/{}",
                self.collection, id
            ))
        })?;
        let mut collector = FieldPatch::default();
        for (key, value) in patch.updated {
            view.change_field(subscription_handle, &key, value, &mut collector, false);
        }
        for key in patch.cleared {
            view.clear_field(subscription_handle, &key, &mut collector);
        }
        Ok(ViewChange::Changed {
            id: id.to_string(),
            patch: collector,
        })
    }

    /// A subscription stops reporting a document. The last reporter's
    /// departure removes it; earlier departures surface whatever values the
    /// remaining subscriptions contribute.
    pub(crate) fn removed(&mut self, subscription_handle: &str, id: &str) -> Result<ViewChange> {
        let view = self.documents.get_mut(id).ok_or_else(|| {
            Error::internal(format!(
                "removed for unknown document {}/{}",
                self.collection, id
            ))
        })?;
        view.exists_in.remove(subscription_handle);
        if view.exists_in.is_empty() {
            self.documents.remove(id);
            return Ok(ViewChange::Removed { id: id.to_string() });
        }
        let mut collector = FieldPatch::default();
        let keys: Vec<String> = view.data_by_key.keys().cloned().collect();
        for key in keys {
            view.clear_field(subscription_handle, &key, &mut collector);
        }
        Ok(ViewChange::Changed {
            id: id.to_string(),
            patch: collector,
        })
    }
}

/// Diffs two whole merge-box snapshots (collection name → view), emitting
/// the client-visible deltas that turn `old` into `new`. Used after a
/// user-id rebind replaces every subscription.
pub(crate) fn diff_views(
    old: &HashMap<String, SessionCollectionView>,
    new: &HashMap<String, SessionCollectionView>,
    mut emit: impl FnMut(&str, ViewChange),
) {
    let mut collections: Vec<&str> = old
        .keys()
        .chain(new.keys())
        .map(String::as_str)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    collections.sort_unstable();

    for collection in collections {
        let old_view = old.get(collection);
        let new_view = new.get(collection);
        let old_docs: HashMap<String, Document> = old_view
            .map(|view| {
                view.ids()
                    .filter_map(|id| view.client_fields(id).map(|f| (id.to_string(), f)))
                    .collect()
            })
            .unwrap_or_default();
        let new_docs: HashMap<String, Document> = new_view
            .map(|view| {
                view.ids()
                    .filter_map(|id| view.client_fields(id).map(|f| (id.to_string(), f)))
                    .collect()
            })
            .unwrap_or_default();

        let mut emitter = ViewDiffEmitter {
            collection,
            emit: &mut emit,
        };
        diff::diff_unordered(&old_docs, &new_docs, &mut emitter);
    }
}

struct ViewDiffEmitter<'a, F: FnMut(&str, ViewChange)> {
    collection: &'a str,
    emit: &'a mut F,
}

impl<F: FnMut(&str, ViewChange)> diff::DiffObserver for ViewDiffEmitter<'_, F> {
    fn added(&mut self, id: &str, doc: &Document) {
        (self.emit)(
            self.collection,
            ViewChange::Added {
                id: id.to_string(),
                fields: doc.clone(),
            },
        );
    }

    fn changed(&mut self, id: &str, patch: FieldPatch) {
        (self.emit)(
            self.collection,
            ViewChange::Changed {
                id: id.to_string(),
                patch,
            },
        );
    }

    fn removed(&mut self, id: &str) {
        (self.emit)(
            self.collection,
            ViewChange::Removed { id: id.to_string() },
        );
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn patch(updated: Document, cleared: &[&str]) -> FieldPatch {
        FieldPatch {
            updated,
            cleared: cleared.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn first_contributor_wins_the_field() {
        let mut view = SessionCollectionView::new("fruit");
        let change = view.added("Na", "x", doc! { "q": 5, "r": 6 });
        assert_eq!(
            change,
            ViewChange::Added {
                id: "x".to_string(),
                fields: doc! { "q": 5, "r": 6 },
            }
        );

        // A second subscription reporting the same doc with the same values
        // produces an empty changed.
        let change = view.added("Nb", "x", doc! { "r": 6 });
        assert_eq!(
            change,
            ViewChange::Changed {
                id: "x".to_string(),
                patch: FieldPatch::default(),
            }
        );
        assert_eq!(view.client_fields("x"), Some(doc! { "q": 5, "r": 6 }));
    }

    #[test]
    fn precedence_switches_when_the_head_withdraws() {
        let mut view = SessionCollectionView::new("fruit");
        view.added("Na", "x", doc! { "v": "from-a" });
        view.added("Nb", "x", doc! { "v": "from-b" });
        assert_eq!(view.client_fields("x"), Some(doc! { "v": "from-a" }));

        // A withdraws; B's value surfaces.
        let change = view.removed("Na", "x").unwrap();
        assert_eq!(
            change,
            ViewChange::Changed {
                id: "x".to_string(),
                patch: patch(doc! { "v": "from-b" }, &[]),
            }
        );

        // B withdraws too; the document goes away.
        let change = view.removed("Nb", "x").unwrap();
        assert_eq!(
            change,
            ViewChange::Removed {
                id: "x".to_string()
            }
        );
        assert_eq!(view.client_fields("x"), None);
    }

    #[test]
    fn non_head_changes_are_invisible() {
        let mut view = SessionCollectionView::new("fruit");
        view.added("Na", "x", doc! { "v": 1 });
        view.added("Nb", "x", doc! { "v": 2 });

        let change = view
            .changed("Nb", "x", patch(doc! { "v": 3 }, &[]))
            .unwrap();
        assert_eq!(
            change,
            ViewChange::Changed {
                id: "x".to_string(),
                patch: FieldPatch::default(),
            }
        );

        // The head's change is visible.
        let change = view
            .changed("Na", "x", patch(doc! { "v": 10 }, &[]))
            .unwrap();
        assert_eq!(
            change,
            ViewChange::Changed {
                id: "x".to_string(),
                patch: patch(doc! { "v": 10 }, &[]),
            }
        );
    }

    #[test]
    fn clearing_the_last_contributor_clears_the_field() {
        let mut view = SessionCollectionView::new("fruit");
        view.added("Na", "x", doc! { "v": 1, "w": 2 });
        let change = view
            .changed("Na", "x", patch(doc! {}, &["w"]))
            .unwrap();
        assert_eq!(
            change,
            ViewChange::Changed {
                id: "x".to_string(),
                patch: patch(doc! {}, &["w"]),
            }
        );
        assert_eq!(view.client_fields("x"), Some(doc! { "v": 1 }));
    }

    #[test]
    fn id_field_is_never_tracked() {
        let mut view = SessionCollectionView::new("fruit");
        let change = view.added("Na", "x", doc! { "_id": "x", "v": 1 });
        assert_eq!(
            change,
            ViewChange::Added {
                id: "x".to_string(),
                fields: doc! { "v": 1 },
            }
        );
    }

    #[test]
    fn removed_of_unknown_document_is_an_error() {
        let mut view = SessionCollectionView::new("fruit");
        assert!(view.removed("Na", "ghost").is_err());
        assert!(view
            .changed("Na", "ghost", FieldPatch::default())
            .is_err());
    }

    #[test]
    fn view_diff_emits_adds_removes_and_field_changes() {
        let mut old = HashMap::new();
        let mut old_fruit = SessionCollectionView::new("fruit");
        old_fruit.added("Na", "a", doc! { "v": 1 });
        old_fruit.added("Na", "b", doc! { "v": 2 });
        old.insert("fruit".to_string(), old_fruit);

        let mut new = HashMap::new();
        let mut new_fruit = SessionCollectionView::new("fruit");
        new_fruit.added("Nb", "b", doc! { "v": 20 });
        new_fruit.added("Nb", "c", doc! { "v": 3 });
        new.insert("fruit".to_string(), new_fruit);

        let mut changes = Vec::new();
        diff_views(&old, &new, |collection, change| {
            changes.push((collection.to_string(), change));
        });

        assert!(changes.contains(&(
            "fruit".to_string(),
            ViewChange::Removed {
                id: "a".to_string()
            }
        )));
        assert!(changes.contains(&(
            "fruit".to_string(),
            ViewChange::Added {
                id: "c".to_string(),
                fields: doc! { "v": 3 },
            }
        )));
        assert!(changes.contains(&(
            "fruit".to_string(),
            ViewChange::Changed {
                id: "b".to_string(),
                patch: patch(doc! { "v": 20 }, &[]),
            }
        )));
    }
}
