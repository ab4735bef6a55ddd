//! JSON wire protocol for document synchronization.
//!
//! Every WebSocket text frame is one JSON object tagged by `"frame"`:
//! ```text
//! client → server   subscribe | sync | edit | create | exists | join | leave | ping
//! server → client   update | syncResponse | existsResponse | users | error | pong
//! ```
//!
//! Edits travel as a [`WireMessage`], the flat message shape shared with
//! other implementations of the protocol:
//! ```text
//! { "type": "insert",
//!   "character": { "value": "h", "id": "A_1", "parentId": "ROOT", "visible": true },
//!   "batchOperations": null }
//! ```
//!
//! [`WireMessage`] is deliberately loose (every payload optional, unknown
//! `type` strings accepted); [`EditOp`] is the checked form. Conversion
//! between the two is where malformed input is rejected.

use serde::{Deserialize, Serialize};
use tandem_core::{CharacterNode, EditOp, NodeId};

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Message of type '{0}' is missing its payload")]
    MissingPayload(&'static str),
    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => ProtocolError::ConnectionClosed,
            other => ProtocolError::Transport(other.to_string()),
        }
    }
}

/// Message `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Insert,
    Delete,
    Restore,
    Batch,
    /// Also the landing spot for any `type` this build does not know.
    #[serde(other)]
    Error,
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Insert => "insert",
            MessageKind::Delete => "delete",
            MessageKind::Restore => "restore",
            MessageKind::Batch => "batch",
            MessageKind::Error => "error",
        }
    }
}

fn default_visible() -> bool {
    true
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// `character` payload. Deletes only need `id` (and `incarnation`), so the
/// rest is optional here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCharacter {
    #[serde(default)]
    pub value: Option<char>,
    pub id: NodeId,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub incarnation: u32,
}

impl From<&CharacterNode> for WireCharacter {
    fn from(node: &CharacterNode) -> Self {
        Self {
            value: node.value,
            id: node.id.clone(),
            parent_id: Some(node.parent_id.clone()),
            visible: node.visible,
            incarnation: node.incarnation,
        }
    }
}

impl From<WireCharacter> for CharacterNode {
    /// A missing `parentId` anchors at `ROOT`, same as an unknown one.
    fn from(wire: WireCharacter) -> Self {
        CharacterNode {
            value: wire.value,
            id: wire.id,
            parent_id: wire.parent_id.unwrap_or_else(NodeId::root),
            visible: wire.visible,
            incarnation: wire.incarnation,
        }
    }
}

/// One edit message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<WireCharacter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_operations: Option<Vec<WireMessage>>,
}

impl WireMessage {
    /// Payload-less reply to an unsupported message.
    pub fn error() -> Self {
        Self {
            kind: MessageKind::Error,
            character: None,
            batch_operations: None,
        }
    }

    fn with_character(kind: MessageKind, character: WireCharacter) -> Self {
        Self {
            kind,
            character: Some(character),
            batch_operations: None,
        }
    }
}

impl From<&EditOp> for WireMessage {
    fn from(op: &EditOp) -> Self {
        match op {
            EditOp::Insert(node) => Self::with_character(MessageKind::Insert, node.into()),
            EditOp::Restore(node) => Self::with_character(MessageKind::Restore, node.into()),
            EditOp::Delete { id, incarnation } => Self::with_character(
                MessageKind::Delete,
                WireCharacter {
                    value: None,
                    id: id.clone(),
                    parent_id: None,
                    visible: false,
                    incarnation: *incarnation,
                },
            ),
            EditOp::Batch(ops) => Self {
                kind: MessageKind::Batch,
                character: None,
                batch_operations: Some(ops.iter().map(WireMessage::from).collect()),
            },
        }
    }
}

impl TryFrom<WireMessage> for EditOp {
    type Error = ProtocolError;

    fn try_from(msg: WireMessage) -> Result<Self, Self::Error> {
        let kind = msg.kind;
        match kind {
            MessageKind::Insert | MessageKind::Restore | MessageKind::Delete => {
                let character = msg
                    .character
                    .ok_or(ProtocolError::MissingPayload(kind.as_str()))?;
                Ok(match kind {
                    MessageKind::Insert => EditOp::Insert(character.into()),
                    MessageKind::Restore => EditOp::Restore(character.into()),
                    _ => EditOp::Delete {
                        id: character.id,
                        incarnation: character.incarnation,
                    },
                })
            }
            MessageKind::Batch => {
                let ops = msg
                    .batch_operations
                    .ok_or(ProtocolError::MissingPayload(kind.as_str()))?;
                let ops = ops
                    .into_iter()
                    .map(EditOp::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(EditOp::Batch(ops))
            }
            MessageKind::Error => Err(ProtocolError::UnsupportedType(kind.as_str().to_string())),
        }
    }
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Join the document's broadcast channel.
    Subscribe { doc_id: String },
    /// Sync Request: answered on this connection only.
    Sync { doc_id: String },
    /// Publish an op to the document.
    Edit { doc_id: String, message: WireMessage },
    /// Fire-and-forget creation notification.
    Create { doc_id: String },
    Exists { doc_id: String },
    Join { doc_id: String, username: String },
    Leave { doc_id: String, username: String },
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Op published by another connection.
    Update { doc_id: String, message: WireMessage },
    /// Full node set in linear order, tombstones included.
    SyncResponse { doc_id: String, messages: Vec<WireMessage> },
    ExistsResponse { doc_id: String, exists: bool },
    /// Sorted roster of the document's users.
    Users { doc_id: String, users: Vec<String> },
    Error { message: WireMessage },
    Pong,
}

impl ClientFrame {
    /// Publish `op` to `doc_id`.
    pub fn edit(doc_id: impl Into<String>, op: &EditOp) -> Self {
        ClientFrame::Edit {
            doc_id: doc_id.into(),
            message: op.into(),
        }
    }

    /// Document this frame addresses, if any.
    pub fn doc_id(&self) -> Option<&str> {
        match self {
            ClientFrame::Subscribe { doc_id }
            | ClientFrame::Sync { doc_id }
            | ClientFrame::Edit { doc_id, .. }
            | ClientFrame::Create { doc_id }
            | ClientFrame::Exists { doc_id }
            | ClientFrame::Join { doc_id, .. }
            | ClientFrame::Leave { doc_id, .. } => Some(doc_id),
            ClientFrame::Ping => None,
        }
    }

    /// Serialize to one JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse one JSON text frame from a client.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerFrame {
    /// Sync response for `nodes`, given in linear order.
    pub fn sync_response(doc_id: impl Into<String>, nodes: &[CharacterNode]) -> Self {
        ServerFrame::SyncResponse {
            doc_id: doc_id.into(),
            messages: nodes
                .iter()
                .map(|node| WireMessage::with_character(MessageKind::Insert, node.into()))
                .collect(),
        }
    }

    /// The generic refusal; it carries no detail.
    pub fn error() -> Self {
        ServerFrame::Error {
            message: WireMessage::error(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}
