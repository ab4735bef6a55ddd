//! Local, linear undo/redo over the Document Engine.
//!
//! The stacks hold the *forward* operations this replica originated. Undo
//! computes and applies inverses; redo re-applies the forward op. Remote ops
//! never enter the stacks.
//!
//! Inverse rules, evaluated against the document at undo time:
//! - `Insert(n)`  → `Delete` of the incarnation currently held
//! - `Delete(id)` → `Restore` of the next incarnation
//! - `Restore(n)` → `Delete` of the incarnation currently held
//! - `Batch(ops)` → inverses of `ops` in reverse order
//!
//! Redoing an insert whose node is still present (as a tombstone) emits a
//! `Restore`, since a second `Insert` of a known id can never revive it.

use crate::document::Document;
use crate::node::CharacterNode;
use crate::op::EditOp;

/// Undo/redo stacks with a re-entrancy guard.
#[derive(Debug, Default)]
pub struct UndoManager {
    undo_stack: Vec<EditOp>,
    redo_stack: Vec<EditOp>,
    replaying: bool,
}

impl UndoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new local edit. Clears the redo stack.
    ///
    /// Ignored while a replay is in progress, so ops produced by undo/redo
    /// are never captured as user edits.
    pub fn record(&mut self, op: EditOp) -> bool {
        if self.replaying {
            log::trace!("Edit recorded during undo/redo replay ignored");
            return false;
        }
        self.undo_stack.push(op);
        self.redo_stack.clear();
        true
    }

    /// Whether an undo/redo replay is running.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Undo the most recent local entry against `doc`.
    ///
    /// Returns the plain ops that were applied, in application order, for
    /// transmission. Empty if there was nothing to undo.
    pub fn undo(&mut self, doc: &mut Document) -> Vec<EditOp> {
        let Some(entry) = self.undo_stack.pop() else {
            return Vec::new();
        };

        self.replaying = true;
        let applied = match inverse(&entry, doc) {
            Some(inverse) => apply_all(inverse, doc),
            None => {
                log::debug!("Nothing to invert for {:?}", entry.target());
                Vec::new()
            }
        };
        self.redo_stack.push(entry);
        self.replaying = false;

        applied
    }

    /// Re-apply the most recently undone entry.
    pub fn redo(&mut self, doc: &mut Document) -> Vec<EditOp> {
        let Some(entry) = self.redo_stack.pop() else {
            return Vec::new();
        };

        self.replaying = true;
        let applied = apply_all(forward(&entry, doc), doc);
        self.undo_stack.push(entry);
        self.replaying = false;

        applied
    }
}

/// Flatten `op`, apply each plain op in order, return them.
fn apply_all(op: EditOp, doc: &mut Document) -> Vec<EditOp> {
    let ops = op.flatten();
    for op in &ops {
        doc.apply(op);
    }
    ops
}

fn inverse(op: &EditOp, doc: &Document) -> Option<EditOp> {
    match op {
        EditOp::Insert(node) | EditOp::Restore(node) => doc.get(&node.id).map(hide),
        EditOp::Delete { id, .. } => doc.get(id).map(|node| EditOp::Restore(node.restored())),
        EditOp::Batch(ops) => {
            let inverses: Vec<EditOp> = ops.iter().rev().filter_map(|op| inverse(op, doc)).collect();
            Some(EditOp::Batch(inverses))
        }
    }
}

/// The op that re-establishes `op`'s effect on the current document.
fn forward(op: &EditOp, doc: &Document) -> EditOp {
    match op {
        EditOp::Insert(node) | EditOp::Restore(node) => match doc.get(&node.id) {
            Some(current) => EditOp::Restore(current.restored()),
            None => op.clone(),
        },
        EditOp::Delete { id, .. } => doc.get(id).map_or_else(|| op.clone(), hide),
        EditOp::Batch(ops) => EditOp::Batch(ops.iter().map(|op| forward(op, doc)).collect()),
    }
}

fn hide(node: &CharacterNode) -> EditOp {
    EditOp::Delete {
        id: node.id.clone(),
        incarnation: node.incarnation,
    }
}
