//! Edit operations: the unit of replication and of undo history.

use crate::node::{CharacterNode, NodeId};

/// CRDT operations (must be idempotent and commutative).
///
/// `Delete` and `Restore` name the visibility incarnation they act on, so a
/// delete and a concurrent undo of an earlier delete resolve the same way on
/// every replica regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    /// Add a node to the tree. For a known id only the visibility state is
    /// merged; identity fields are never overwritten.
    Insert(CharacterNode),
    /// Tombstone incarnation `incarnation` of a node.
    Delete { id: NodeId, incarnation: u32 },
    /// Open incarnation `node.incarnation` as visible (local undo of a
    /// delete, redo of an insert). Inserts the node if it is unknown.
    Restore(CharacterNode),
    /// Ordered group recorded as one undo step (paste, import).
    Batch(Vec<EditOp>),
}

impl EditOp {
    /// Delete of a node that was never restored.
    pub fn delete(id: impl Into<NodeId>) -> Self {
        EditOp::Delete {
            id: id.into(),
            incarnation: 0,
        }
    }

    /// Id of the node this op targets. `None` for batches.
    pub fn target(&self) -> Option<&NodeId> {
        match self {
            EditOp::Insert(node) | EditOp::Restore(node) => Some(&node.id),
            EditOp::Delete { id, .. } => Some(id),
            EditOp::Batch(_) => None,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, EditOp::Batch(_))
    }

    /// Number of non-batch ops contained (1 for a plain op).
    pub fn leaf_count(&self) -> usize {
        match self {
            EditOp::Batch(ops) => ops.iter().map(EditOp::leaf_count).sum(),
            _ => 1,
        }
    }

    /// Expand nested batches into their plain ops, in order.
    pub fn flatten(self) -> Vec<EditOp> {
        let mut out = Vec::with_capacity(self.leaf_count());
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<EditOp>) {
        match self {
            EditOp::Batch(ops) => {
                for op in ops {
                    op.flatten_into(out);
                }
            }
            op => out.push(op),
        }
    }
}
