//! Command-dispatch facade over one replica.
//!
//! A UI (or any other driver) calls plain methods here and renders
//! [`Editor::text`] afterwards. Every locally originated op is also queued
//! for transmission; the sync layer drains the queue with
//! [`Editor::take_outgoing`]. Nothing in this module does I/O.
//!
//! ```text
//!  keystroke ──► insert_at / delete_at / paste ──┐
//!                                               ├─► Document ─► text()
//!  undo / redo ─────────────────────────────────┤
//!                                               └─► outgoing ─► sync layer
//!  sync layer ──► apply_remote / bootstrap ─────► Document
//! ```

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::generator::EditGenerator;
use crate::id::IdGenerator;
use crate::node::{CharacterNode, NodeId};
use crate::op::EditOp;
use crate::undo::UndoManager;

/// Client-side capability gate selected by the join code suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    Editor,
    Viewer,
}

impl AccessMode {
    pub fn can_edit(self) -> bool {
        self == AccessMode::Editor
    }
}

/// One replica: document, local edit generator, undo history, outbox.
#[derive(Debug)]
pub struct Editor {
    document: Document,
    generator: EditGenerator,
    history: UndoManager,
    outgoing: Vec<EditOp>,
    mode: AccessMode,
}

impl Editor {
    /// Editor for `replica_id` with wall-clock ids.
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self::with_ids(IdGenerator::new(replica_id))
    }

    pub fn with_ids(ids: IdGenerator) -> Self {
        Self {
            document: Document::new(),
            generator: EditGenerator::new(ids),
            history: UndoManager::new(),
            outgoing: Vec::new(),
            mode: AccessMode::Editor,
        }
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn replica_id(&self) -> &str {
        self.generator.replica_id()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Current visible text.
    pub fn text(&self) -> String {
        self.document.visible_text()
    }

    /// Caret position just after `id`, for keeping the caret on a character.
    pub fn caret_after(&self, id: &NodeId) -> Option<usize> {
        self.document.visible_position_of(id).map(|pos| pos + 1)
    }

    fn accepts_local_edits(&self) -> bool {
        self.mode.can_edit() && !self.history.is_replaying()
    }

    /// Type one character at `caret`.
    pub fn insert_at(&mut self, caret: usize, value: char) -> Option<CharacterNode> {
        if !self.accepts_local_edits() {
            return None;
        }
        let node = self.generator.insert_at(&mut self.document, caret, value);
        let op = EditOp::Insert(node.clone());
        self.history.record(op.clone());
        self.outgoing.push(op);
        Some(node)
    }

    /// Backspace at `caret`.
    pub fn delete_at(&mut self, caret: usize) -> Option<NodeId> {
        if !self.accepts_local_edits() {
            return None;
        }
        let op = self.generator.delete_at(&mut self.document, caret)?;
        let id = op.target().cloned();
        self.history.record(op.clone());
        self.outgoing.push(op);
        id
    }

    /// Paste or import text at `caret`.
    ///
    /// Control characters other than newline and tab are dropped. Each
    /// character is queued for transmission on its own; the whole run is one
    /// undo step. Returns how many characters were inserted.
    pub fn paste<I>(&mut self, caret: usize, text: I) -> usize
    where
        I: IntoIterator<Item = char>,
    {
        if !self.accepts_local_edits() {
            return 0;
        }
        let accepted = text
            .into_iter()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t');
        let inserted = self.generator.insert_text(&mut self.document, caret, accepted);
        if inserted.is_empty() {
            return 0;
        }

        let ops: Vec<EditOp> = inserted.into_iter().map(EditOp::Insert).collect();
        let count = ops.len();
        self.outgoing.extend(ops.iter().cloned());
        self.history.record(EditOp::Batch(ops));
        count
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Undo the last local edit. Returns `false` if there was none.
    pub fn undo(&mut self) -> bool {
        if !self.history.can_undo() {
            return false;
        }
        let applied = self.history.undo(&mut self.document);
        self.outgoing.extend(applied);
        true
    }

    /// Redo the last undone edit. Returns `false` if there was none.
    pub fn redo(&mut self) -> bool {
        if !self.history.can_redo() {
            return false;
        }
        let applied = self.history.redo(&mut self.document);
        self.outgoing.extend(applied);
        true
    }

    /// Apply an op received from the channel. Never recorded for undo.
    pub fn apply_remote(&mut self, op: &EditOp) -> bool {
        self.document.apply(op)
    }

    /// Replay a sync response through the ordinary apply path.
    ///
    /// Returns how many ops changed the document.
    pub fn bootstrap<I>(&mut self, ops: I) -> usize
    where
        I: IntoIterator<Item = EditOp>,
    {
        let applied = ops
            .into_iter()
            .filter(|op| self.document.apply(op))
            .count();
        log::debug!(
            "Bootstrap applied {applied} ops; document holds {} nodes",
            self.document.len()
        );
        applied
    }

    /// Drain ops waiting for transmission, in the order they were produced.
    pub fn take_outgoing(&mut self) -> Vec<EditOp> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }
}
