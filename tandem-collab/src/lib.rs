//! # tandem-collab: Sync service for tandem documents
//!
//! Keeps replicas of a [`tandem_core::Document`] converged over WebSockets.
//! The server holds one canonical replica per document id and relays ops;
//! clients bootstrap from it and then exchange live ops.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON text frames   ┌─────────────┐
//! │ SyncClient  │ ◄──────────────────► │ SyncServer  │
//! │ (per user)  │                      │ (central)   │
//! └──────┬──────┘                      └──────┬──────┘
//!        │ SyncEvent                          │
//!        ▼                                    ▼
//! ┌─────────────┐                   ┌──────────────────┐
//! │ Editor      │                   │ DocumentRegistry │
//! │ (local)     │                   │ (canonical)      │
//! └─────────────┘                   └────────┬─────────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │ BroadcastGroup │
//!                                    │ (fan-out)      │
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire messages and frames (serde_json)
//! - [`broadcast`]: per-document fan-out with backpressure
//! - [`registry`]: canonical replicas, one lock per document
//! - [`server`]: WebSocket sync server
//! - [`client`]: reconnecting WebSocket client with offline queue
//! - [`session`]: document ids and join codes

pub mod protocol;
pub mod broadcast;
pub mod registry;
pub mod server;
pub mod client;
pub mod session;

// Re-exports for convenience
pub use protocol::{
    ClientFrame, MessageKind, ProtocolError, ServerFrame, WireCharacter, WireMessage,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound, RoomManager};
pub use registry::{DocumentRegistry, SharedDocument};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{
    create_document, document_exists, ClientConfig, ConnectionState, OfflineQueue, SyncClient,
    SyncEvent,
};
pub use session::{generate_document_id, JoinCode, JoinCodeError, DOCUMENT_ID_LEN};
