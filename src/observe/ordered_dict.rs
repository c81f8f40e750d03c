//! An ordered document container with by-id access: a doubly-linked list
//! over a slab of nodes, indexed by a map from document id to slot. Powers
//! the ordered flavor of the caching change observer.

use std::collections::HashMap;

use bson::Document;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
struct Node {
    id: String,
    doc: Document,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A sequence of documents that supports `O(1)` lookup, removal and
/// relinking by id. Freed slots are recycled.
#[derive(Clone, Debug, Default)]
pub(crate) struct OrderedDict {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl OrderedDict {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Document> {
        let slot = *self.index.get(id)?;
        self.nodes[slot].as_ref().map(|node| &node.doc)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Document> {
        let slot = *self.index.get(id)?;
        self.nodes[slot].as_mut().map(|node| &mut node.doc)
    }

    /// Inserts `doc` immediately before the document with id `before`, or at
    /// the end when `before` is `None`. The id must be new and the anchor
    /// must exist.
    pub(crate) fn insert_before(
        &mut self,
        id: impl Into<String>,
        doc: Document,
        before: Option<&str>,
    ) -> Result<()> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(Error::internal(format!(
                "duplicate insert of document {}",
                id
            )));
        }
        if let Some(anchor_id) = before {
            if !self.index.contains_key(anchor_id) {
                return Err(Error::internal(format!(
                    "unknown anchor document {}",
                    anchor_id
                )));
            }
        }
        let slot = self.alloc(Node {
            id: id.clone(),
            doc,
            prev: None,
            next: None,
        });
        self.index.insert(id, slot);
        self.link_before(slot, before)
    }

    /// Relinks an existing document immediately before `before` (or to the
    /// end when `None`).
    pub(crate) fn move_before(&mut self, id: &str, before: Option<&str>) -> Result<()> {
        let slot = *self
            .index
            .get(id)
            .ok_or_else(|| Error::internal(format!("move of unknown document {}", id)))?;
        if before == Some(id) {
            return Ok(());
        }
        if let Some(anchor_id) = before {
            if !self.index.contains_key(anchor_id) {
                return Err(Error::internal(format!(
                    "unknown anchor document {}",
                    anchor_id
                )));
            }
        }
        self.unlink(slot);
        self.link_before(slot, before)
    }

    /// Removes a document, returning it.
    pub(crate) fn remove(&mut self, id: &str) -> Result<Document> {
        let slot = self
            .index
            .remove(id)
            .ok_or_else(|| Error::internal(format!("removal of unknown document {}", id)))?;
        self.unlink(slot);
        self.free.push(slot);
        match self.nodes[slot].take() {
            Some(node) => Ok(node.doc),
            None => Err(Error::internal("ordered dict slot already vacated")),
        }
    }

    /// Iterates documents in sequence order.
    pub(crate) fn iter(&self) -> OrderedIter<'_> {
        OrderedIter {
            dict: self,
            cursor: self.head,
        }
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn link_before(&mut self, slot: usize, before: Option<&str>) -> Result<()> {
        match before {
            None => {
                // Append.
                let old_tail = self.tail;
                if let Some(node) = self.nodes[slot].as_mut() {
                    node.prev = old_tail;
                    node.next = None;
                }
                if let Some(tail_slot) = old_tail {
                    if let Some(tail) = self.nodes[tail_slot].as_mut() {
                        tail.next = Some(slot);
                    }
                }
                self.tail = Some(slot);
                if self.head.is_none() {
                    self.head = Some(slot);
                }
                Ok(())
            }
            Some(anchor_id) => {
                let anchor = *self.index.get(anchor_id).ok_or_else(|| {
                    Error::internal(format!("unknown anchor document {}", anchor_id))
                })?;
                let anchor_prev = self.nodes[anchor].as_ref().and_then(|n| n.prev);
                if let Some(node) = self.nodes[slot].as_mut() {
                    node.prev = anchor_prev;
                    node.next = Some(anchor);
                }
                if let Some(node) = self.nodes[anchor].as_mut() {
                    node.prev = Some(slot);
                }
                match anchor_prev {
                    Some(prev_slot) => {
                        if let Some(prev) = self.nodes[prev_slot].as_mut() {
                            prev.next = Some(slot);
                        }
                    }
                    None => self.head = Some(slot),
                }
                Ok(())
            }
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.nodes[slot].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        match prev {
            Some(prev_slot) => {
                if let Some(node) = self.nodes[prev_slot].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next_slot) => {
                if let Some(node) = self.nodes[next_slot].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.nodes[slot].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }
}

pub(crate) struct OrderedIter<'a> {
    dict: &'a OrderedDict,
    cursor: Option<usize>,
}

impl<'a> Iterator for OrderedIter<'a> {
    type Item = (&'a str, &'a Document);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let node = self.dict.nodes[slot].as_ref()?;
        self.cursor = node.next;
        Some((node.id.as_str(), &node.doc))
    }
}
