//! # tandem-core: Replicated plain-text document
//!
//! A tree-structured sequence CRDT for characters. Replicas apply the same
//! set of operations in any order and converge on the same text.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   caret intent   ┌───────────────┐
//! │ Editor       │ ───────────────► │ EditGenerator │
//! │ (facade)     │                  │ (mint ids)    │
//! └──────┬───────┘                  └───────┬───────┘
//!        │ undo / redo                      │ Insert / Delete
//!        ▼                                  ▼
//! ┌──────────────┐    inverse ops   ┌───────────────┐
//! │ UndoManager  │ ───────────────► │ Document      │ ◄── remote ops
//! │ (local only) │                  │ (tree + index)│
//! └──────────────┘                  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`node`]: `CharacterNode`, `NodeId` and the sibling ordering
//! - [`id`]: monotonic id minting per replica
//! - [`document`]: the Document Engine (insert / delete / linearize)
//! - [`op`]: `EditOp`, the unit of replication and undo
//! - [`generator`]: caret-relative edits → operations
//! - [`undo`]: linear local undo/redo
//! - [`editor`]: command-dispatch facade tying the above together

pub mod node;
pub mod id;
pub mod document;
pub mod op;
pub mod generator;
pub mod undo;
pub mod editor;

// Re-exports for convenience
pub use node::{CharacterNode, NodeId, ID_SEPARATOR, ROOT};
pub use id::IdGenerator;
pub use document::Document;
pub use op::EditOp;
pub use generator::EditGenerator;
pub use undo::UndoManager;
pub use editor::{AccessMode, Editor};
