//! Character nodes: the leaf data type of the replicated document.
//!
//! A node's identity (`id`, `parent_id`, `value`) never changes after it is
//! minted. Its visibility is a small join-semilattice `(incarnation, visible)`:
//! a higher incarnation wins, and at equal incarnations a tombstone wins.
//! Only a restore (local undo/redo) opens a new incarnation, so plain inserts
//! and deletes can never bring a tombstone back.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Sentinel parent of nodes inserted at the very start of the document.
pub const ROOT: &str = "ROOT";

/// Separator between replica id and logical counter: `"{replica}_{counter}"`.
pub const ID_SEPARATOR: char = '_';

/// Globally unique node identifier.
///
/// Ordering is the sibling comparator every replica must share:
/// ascending logical counter, then replica id. Ids that do not parse as
/// `{replica}_{counter}` sort after all parseable ids, lexicographically
/// among themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The `ROOT` sentinel.
    pub fn root() -> Self {
        Self(ROOT.to_string())
    }

    /// Build `"{replica}_{counter}"`.
    pub fn from_parts(replica: &str, counter: i64) -> Self {
        Self(format!("{replica}{ID_SEPARATOR}{counter}"))
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(logical counter, replica id)`.
    ///
    /// The counter is whatever follows the *last* separator, so replica ids
    /// may themselves contain `_`.
    pub fn parts(&self) -> Option<(i64, &str)> {
        let (replica, counter) = self.0.rsplit_once(ID_SEPARATOR)?;
        if replica.is_empty() {
            return None;
        }
        let counter = counter.parse::<i64>().ok()?;
        Some((counter, replica))
    }

    pub fn counter(&self) -> Option<i64> {
        self.parts().map(|(counter, _)| counter)
    }

    pub fn replica(&self) -> Option<&str> {
        self.parts().map(|(_, replica)| replica)
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.parts(), other.parts()) {
            (Some((lc, lr)), Some((rc, rr))) => lc
                .cmp(&rc)
                .then_with(|| lr.cmp(rr))
                // "A_01" vs "A_1": keep Ord consistent with Eq
                .then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One character of the shared document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterNode {
    /// `None` (or `'\0'`) is the null sentinel and never renders.
    pub value: Option<char>,
    pub id: NodeId,
    /// Node this one was inserted immediately after, or `ROOT`.
    pub parent_id: NodeId,
    /// `false` marks a tombstone.
    pub visible: bool,
    /// Visibility generation, bumped by every restore. Omitted on the wire
    /// while zero.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub incarnation: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl CharacterNode {
    /// A visible node carrying `value`.
    pub fn new(value: char, id: NodeId, parent_id: NodeId) -> Self {
        Self {
            value: Some(value),
            id,
            parent_id,
            visible: true,
            incarnation: 0,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        !self.visible
    }

    /// Whether this node contributes a character to the visible text.
    pub fn renders(&self) -> bool {
        self.visible && matches!(self.value, Some(c) if c != '\0')
    }

    /// Same identity in the next incarnation, visible.
    pub fn restored(&self) -> Self {
        Self {
            visible: true,
            incarnation: self.incarnation + 1,
            ..self.clone()
        }
    }
}
