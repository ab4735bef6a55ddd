//! The Document Engine: causal tree of character nodes plus an id index.
//!
//! ```text
//!            ROOT
//!           /    \
//!        A_1      B_1          children sorted by NodeId ordering
//!         |        |           (counter, then replica id)
//!        A_2      B_2
//!         |
//!        A_3
//!
//!  linearize(): depth-first pre-order → A_1 A_2 A_3 B_1 B_2
//! ```
//!
//! Nodes live in an append-only arena addressed by integer handles; parent
//! and child links are handles, never references. Nothing is ever removed,
//! so handles stay valid for the lifetime of the document.
//!
//! Every mutation is idempotent and commutative: a node's identity is fixed
//! at insert, and its visibility only ever moves up the
//! `(incarnation, visible)` lattice (higher incarnation wins, equal
//! incarnations resolve to hidden).
//!
//! Reference: Roh et al., "Replicated abstract data types" (RGA, 2011)

use std::cell::OnceCell;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::node::{CharacterNode, NodeId};
use crate::op::EditOp;

type Handle = usize;

/// Default cap on buffered deletes for ids not yet inserted.
pub const MAX_ORPHAN_DELETES: usize = 65_536;

#[derive(Debug, Clone)]
struct Slot {
    node: CharacterNode,
    children: Vec<Handle>,
}

/// A replica of one shared plain-text document.
#[derive(Debug, Clone)]
pub struct Document {
    slots: Vec<Slot>,
    index: HashMap<NodeId, Handle>,
    root_children: Vec<Handle>,
    /// Deletes that arrived before their insert: target id to the highest
    /// incarnation deleted.
    orphan_deletes: HashMap<NodeId, u32>,
    orphan_limit: usize,
    /// Linear order of handles. Tombstones are included and visibility is
    /// read through the handle, so only structural changes invalidate it.
    linear_cache: OnceCell<Vec<Handle>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::with_orphan_limit(MAX_ORPHAN_DELETES)
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty document buffering at most `limit` deletes for unknown ids.
    pub fn with_orphan_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            root_children: Vec::new(),
            orphan_deletes: HashMap::new(),
            orphan_limit: limit,
            linear_cache: OnceCell::new(),
        }
    }

    /// Apply any operation. Returns `true` if the document changed.
    ///
    /// This is the single entry point for local edits, live remote ops and
    /// bootstrap replay alike.
    pub fn apply(&mut self, op: &EditOp) -> bool {
        match op {
            EditOp::Insert(node) => self.insert(node.clone()),
            EditOp::Delete { id, incarnation } => self.delete_incarnation(id, *incarnation),
            EditOp::Restore(node) => self.restore(node.clone()),
            EditOp::Batch(ops) => ops
                .iter()
                .fold(false, |changed, op| self.apply(op) || changed),
        }
    }

    /// Insert a node under its parent in comparator order.
    ///
    /// For an id already present only the visibility state is merged, so a
    /// re-delivered insert is a no-op and a snapshot carrying a newer
    /// tombstone still hides the local copy. An unknown parent is resolved
    /// to `ROOT`. A buffered delete for this id is folded in before placing.
    pub fn insert(&mut self, mut node: CharacterNode) -> bool {
        if node.id.is_root() {
            log::warn!("Ignoring insert that reuses the ROOT id");
            return false;
        }
        if let Some(&handle) = self.index.get(&node.id) {
            let changed = self.merge_visibility(handle, node.incarnation, node.visible);
            if !changed {
                log::trace!("Duplicate insert {} ignored", node.id);
            }
            return changed;
        }

        let parent = if node.parent_id.is_root() {
            None
        } else {
            match self.index.get(&node.parent_id) {
                Some(&handle) => Some(handle),
                None => {
                    log::debug!(
                        "Insert {} references unknown parent {}, anchoring at ROOT",
                        node.id,
                        node.parent_id
                    );
                    node.parent_id = NodeId::root();
                    None
                }
            }
        };

        if let Some(deleted) = self.orphan_deletes.remove(&node.id) {
            if deleted >= node.incarnation {
                log::debug!("Applying buffered delete to late insert {}", node.id);
                node.incarnation = deleted;
                node.visible = false;
            }
        }

        let position = self.sibling_position(parent, &node.id);
        let handle = self.slots.len();
        self.index.insert(node.id.clone(), handle);
        self.slots.push(Slot {
            node,
            children: Vec::new(),
        });
        self.siblings_mut(parent).insert(position, handle);
        self.linear_cache.take();
        true
    }

    /// Tombstone the incarnation of `id` this replica currently holds.
    ///
    /// Unknown ids are buffered until their insert arrives.
    pub fn delete(&mut self, id: &NodeId) -> bool {
        let incarnation = self.incarnation_of(id).unwrap_or(0);
        self.delete_incarnation(id, incarnation)
    }

    /// Tombstone incarnation `incarnation` of `id`.
    ///
    /// A delete of an older incarnation than the one held is stale and
    /// ignored. Deletes for unknown ids are buffered up to the orphan
    /// limit; beyond it new ones are dropped.
    pub fn delete_incarnation(&mut self, id: &NodeId, incarnation: u32) -> bool {
        match self.index.get(id) {
            Some(&handle) => self.merge_visibility(handle, incarnation, false),
            None if id.is_root() => false,
            None if !self.orphan_deletes.contains_key(id)
                && self.orphan_deletes.len() >= self.orphan_limit =>
            {
                log::warn!("Orphan delete buffer full ({}), dropping delete for {id}", self.orphan_limit);
                false
            }
            None => {
                log::debug!("Delete for unknown node {id} buffered");
                let pending = self.orphan_deletes.entry(id.clone()).or_insert(incarnation);
                *pending = (*pending).max(incarnation);
                false
            }
        }
    }

    /// Make `node.incarnation` of a node visible, inserting it if unknown.
    pub fn restore(&mut self, node: CharacterNode) -> bool {
        match self.index.get(&node.id) {
            Some(&handle) => self.merge_visibility(handle, node.incarnation, true),
            None => self.insert(CharacterNode {
                visible: true,
                ..node
            }),
        }
    }

    /// Visibility incarnation held for `id`.
    pub fn incarnation_of(&self, id: &NodeId) -> Option<u32> {
        self.get(id).map(|node| node.incarnation)
    }

    fn merge_visibility(&mut self, handle: Handle, incarnation: u32, visible: bool) -> bool {
        let node = &mut self.slots[handle].node;
        match incarnation.cmp(&node.incarnation) {
            Ordering::Less => false,
            Ordering::Greater => {
                node.incarnation = incarnation;
                node.visible = visible;
                true
            }
            Ordering::Equal if node.visible && !visible => {
                node.visible = false;
                true
            }
            Ordering::Equal => false,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&CharacterNode> {
        self.index.get(id).map(|&handle| &self.slots[handle].node)
    }

    /// Total nodes held, tombstones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of characters in [`visible_text`](Self::visible_text).
    pub fn visible_len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.renders()).count()
    }

    /// Deletes still waiting for their target insert.
    pub fn pending_deletes(&self) -> usize {
        self.orphan_deletes.len()
    }

    /// Child ids of `parent` in stored sibling order.
    pub fn children(&self, parent: &NodeId) -> Vec<&NodeId> {
        let handles = if parent.is_root() {
            &self.root_children
        } else {
            match self.index.get(parent) {
                Some(&handle) => &self.slots[handle].children,
                None => return Vec::new(),
            }
        };
        handles.iter().map(|&h| &self.slots[h].node.id).collect()
    }

    /// Canonical document order: depth-first pre-order from `ROOT`,
    /// tombstones included.
    pub fn linearize(&self) -> Vec<&CharacterNode> {
        self.linear_handles()
            .iter()
            .map(|&h| &self.slots[h].node)
            .collect()
    }

    /// Owned copy of [`linearize`](Self::linearize), for sync responses.
    pub fn snapshot(&self) -> Vec<CharacterNode> {
        self.linearize().into_iter().cloned().collect()
    }

    pub fn visible_text(&self) -> String {
        self.visible_nodes()
            .filter_map(|node| node.value)
            .collect()
    }

    /// Id of the `n`-th visible character (0-based).
    pub fn id_at_visible_position(&self, n: usize) -> Option<&NodeId> {
        self.visible_nodes().nth(n).map(|node| &node.id)
    }

    /// Visible index of `id`, or `None` if unknown or tombstoned.
    pub fn visible_position_of(&self, id: &NodeId) -> Option<usize> {
        self.visible_nodes().position(|node| &node.id == id)
    }

    /// Id of the last visible character.
    pub fn last_visible_id(&self) -> Option<&NodeId> {
        self.visible_nodes().last().map(|node| &node.id)
    }

    fn visible_nodes(&self) -> impl Iterator<Item = &CharacterNode> + '_ {
        self.linear_handles()
            .iter()
            .map(|&h| &self.slots[h].node)
            .filter(|node| node.renders())
    }

    fn linear_handles(&self) -> &[Handle] {
        self.linear_cache.get_or_init(|| {
            let mut order = Vec::with_capacity(self.slots.len());
            // Explicit stack: a long typed run is a chain as deep as the text.
            let mut stack: Vec<Handle> = self.root_children.iter().rev().copied().collect();
            while let Some(handle) = stack.pop() {
                order.push(handle);
                stack.extend(self.slots[handle].children.iter().rev().copied());
            }
            order
        })
    }

    fn sibling_position(&self, parent: Option<Handle>, id: &NodeId) -> usize {
        let siblings = match parent {
            Some(handle) => &self.slots[handle].children,
            None => &self.root_children,
        };
        siblings.partition_point(|&h| self.slots[h].node.id < *id)
    }

    fn siblings_mut(&mut self, parent: Option<Handle>) -> &mut Vec<Handle> {
        match parent {
            Some(handle) => &mut self.slots[handle].children,
            None => &mut self.root_children,
        }
    }
}
