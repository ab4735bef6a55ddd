//! Local Edit Generator: turns caret-relative intent into CRDT operations.
//!
//! Carets are visible-character offsets, the way a text widget reports them:
//! caret `0` sits before the first character, caret `n` after the `n`-th.

use crate::document::Document;
use crate::id::IdGenerator;
use crate::node::{CharacterNode, NodeId};
use crate::op::EditOp;

/// Mints nodes for local edits and applies them to a [`Document`].
#[derive(Debug)]
pub struct EditGenerator {
    ids: IdGenerator,
}

impl EditGenerator {
    pub fn new(ids: IdGenerator) -> Self {
        Self { ids }
    }

    pub fn replica_id(&self) -> &str {
        self.ids.replica_id()
    }

    /// Id of the visible node immediately before `caret`, or `ROOT`.
    ///
    /// A caret past the end resolves to the last visible character.
    pub fn parent_for_caret(doc: &Document, caret: usize) -> NodeId {
        if caret == 0 {
            return NodeId::root();
        }
        doc.id_at_visible_position(caret - 1)
            .or_else(|| doc.last_visible_id())
            .cloned()
            .unwrap_or_else(NodeId::root)
    }

    /// Insert `value` at `caret`. Returns the node to transmit.
    pub fn insert_at(&mut self, doc: &mut Document, caret: usize, value: char) -> CharacterNode {
        let parent = Self::parent_for_caret(doc, caret);
        self.insert_after(doc, parent, value)
    }

    /// Tombstone the visible character just before `caret` (backspace).
    ///
    /// Returns the applied delete, naming the incarnation that was hidden.
    pub fn delete_at(&mut self, doc: &mut Document, caret: usize) -> Option<EditOp> {
        let target = doc.id_at_visible_position(caret.checked_sub(1)?)?.clone();
        let incarnation = doc.incarnation_of(&target).unwrap_or(0);
        let op = EditOp::Delete {
            id: target,
            incarnation,
        };
        doc.apply(&op);
        Some(op)
    }

    /// Insert a run of characters at `caret` as a chain.
    ///
    /// The first character's parent is resolved once from the state before
    /// the run; each later character hangs off the one minted before it.
    /// Stopping the iterator early leaves a valid, shorter run.
    pub fn insert_text<I>(&mut self, doc: &mut Document, caret: usize, text: I) -> Vec<CharacterNode>
    where
        I: IntoIterator<Item = char>,
    {
        let mut parent = Self::parent_for_caret(doc, caret);
        let mut inserted = Vec::new();
        for value in text {
            let node = self.insert_after(doc, parent, value);
            parent = node.id.clone();
            inserted.push(node);
        }
        inserted
    }

    fn insert_after(&mut self, doc: &mut Document, parent: NodeId, value: char) -> CharacterNode {
        let node = CharacterNode::new(value, self.ids.next_id(), parent);
        doc.insert(node.clone());
        node
    }
}
