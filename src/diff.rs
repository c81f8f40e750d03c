//! The two-sequence diff used by the polling driver and the merge-box:
//! id-based identity, per-field minimal patches, and LIS-based move
//! detection for ordered results.

use std::collections::HashMap;

use bson::Document;

use crate::bson_util;

/// A per-field minimal patch: `updated` holds fields whose values are new or
/// changed, `cleared` names fields that no longer exist. On the wire this is
/// exactly the `fields` / `cleared` pair of a `changed` message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldPatch {
    /// Fields to set, with their new values.
    pub updated: Document,
    /// Fields to remove.
    pub cleared: Vec<String>,
}

impl FieldPatch {
    /// Whether this patch changes anything.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.cleared.is_empty()
    }
}

/// Computes the minimal field patch turning `old` into `new`. The `_id`
/// field is never part of a patch; identity is immutable.
pub(crate) fn diff_fields(old: &Document, new: &Document) -> FieldPatch {
    let mut patch = FieldPatch::default();
    for (key, new_value) in new.iter() {
        if key == "_id" {
            continue;
        }
        match old.get(key) {
            Some(old_value) if old_value == new_value => {}
            _ => {
                patch.updated.insert(key.clone(), new_value.clone());
            }
        }
    }
    for key in old.keys() {
        if key != "_id" && !new.contains_key(key) {
            patch.cleared.push(key.clone());
        }
    }
    patch
}

/// Receiver for diff output. Emission order is part of the contract:
/// removals first, then adds/moves/changes walking the new result set in
/// order, with `before` anchors that are correct at the time each callback
/// is delivered.
pub(crate) trait DiffObserver {
    fn added(&mut self, id: &str, doc: &Document) {
        let _ = (id, doc);
    }
    fn added_before(&mut self, id: &str, doc: &Document, before: Option<&str>) {
        let _ = (id, doc, before);
    }
    fn changed(&mut self, id: &str, patch: FieldPatch) {
        let _ = (id, patch);
    }
    fn moved_before(&mut self, id: &str, before: Option<&str>) {
        let _ = (id, before);
    }
    fn removed(&mut self, id: &str) {
        let _ = id;
    }
}

/// Diffs two unordered result sets (id → document maps): `removed` for ids
/// gone from `new`, `added` for ids absent from `old`, `changed` with a
/// field patch for ids in both whose documents differ.
pub(crate) fn diff_unordered(
    old: &HashMap<String, Document>,
    new: &HashMap<String, Document>,
    observer: &mut impl DiffObserver,
) {
    for id in old.keys() {
        if !new.contains_key(id) {
            observer.removed(id);
        }
    }
    for (id, new_doc) in new.iter() {
        match old.get(id) {
            None => observer.added(id, new_doc),
            Some(old_doc) => {
                let patch = diff_fields(old_doc, new_doc);
                if !patch.is_empty() {
                    observer.changed(id, patch);
                }
            }
        }
    }
}

/// Diffs two ordered result sequences. Documents present in both sequences
/// that form a longest increasing subsequence of old positions are left in
/// place; everything else is emitted as `removed`, `moved_before` or
/// `added_before` against the next in-place document, so that applying the
/// callbacks in order transforms `old` into `new`.
pub(crate) fn diff_ordered(old: &[Document], new: &[Document], observer: &mut impl DiffObserver) {
    // Documents without a string _id cannot participate in id-based identity
    // and are skipped on both sides.
    let old: Vec<(&str, &Document)> = old
        .iter()
        .filter_map(|doc| bson_util::document_id(doc).ok().map(|id| (id, doc)))
        .collect();
    let new: Vec<(&str, &Document)> = new
        .iter()
        .filter_map(|doc| bson_util::document_id(doc).ok().map(|id| (id, doc)))
        .collect();
    let old_index: HashMap<&str, usize> = old.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();
    let new_index: HashMap<&str, usize> = new.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();

    for (id, _) in &old {
        if !new_index.contains_key(id) {
            observer.removed(id);
        }
    }

    // Positions (in `new`) of documents that also exist in `old`, paired
    // with their old positions; the LIS over old positions is the set of
    // documents that keep their relative order and need not move.
    let common: Vec<(usize, usize)> = new
        .iter()
        .enumerate()
        .filter_map(|(new_pos, (id, _))| old_index.get(id).map(|old_pos| (new_pos, *old_pos)))
        .collect();
    let unmoved = longest_increasing_subsequence(&common);

    // For every position in `new`, the id of the next unmoved document at or
    // after it; documents are added/moved before that anchor.
    let mut anchors: Vec<Option<&str>> = vec![None; new.len()];
    let mut next_anchor: Option<&str> = None;
    for pos in (0..new.len()).rev() {
        if unmoved.contains(&pos) {
            next_anchor = Some(new[pos].0);
        }
        anchors[pos] = next_anchor;
    }

    for (pos, (id, doc)) in new.iter().enumerate() {
        match old_index.get(id) {
            None => {
                observer.added_before(id, doc, anchors[pos]);
            }
            Some(old_pos) => {
                if !unmoved.contains(&pos) {
                    observer.moved_before(id, anchors[pos].filter(|a| a != id));
                }
                let patch = diff_fields(old[*old_pos].1, doc);
                if !patch.is_empty() {
                    observer.changed(id, patch);
                }
            }
        }
    }
}

/// Returns the set of `new` positions forming a longest strictly increasing
/// subsequence of old positions. Patience-sorting variant, O(n log n).
fn longest_increasing_subsequence(pairs: &[(usize, usize)]) -> std::collections::HashSet<usize> {
    let mut tails: Vec<usize> = Vec::new(); // indices into `pairs`
    let mut prev: Vec<Option<usize>> = vec![None; pairs.len()];
    for (i, (_, old_pos)) in pairs.iter().enumerate() {
        let probe = tails
            .binary_search_by(|t| pairs[*t].1.cmp(old_pos))
            .unwrap_or_else(|e| e);
        if probe > 0 {
            prev[i] = Some(tails[probe - 1]);
        }
        if probe == tails.len() {
            tails.push(i);
        } else {
            tails[probe] = i;
        }
    }
    let mut result = std::collections::HashSet::new();
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        result.insert(pairs[i].0);
        cursor = prev[i];
    }
    result
}
