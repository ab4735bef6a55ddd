//! WebSocket sync server holding the canonical replica of every document.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── DocumentRegistry ── Mutex<Document> per id
//!            ├── connection task ──┤
//! Client B ──┘   (one per socket)  └── RoomManager ── BroadcastGroup per id
//!                                              │
//!                               ┌──────────────┼──────────────┐
//!                               ▼              ▼              ▼
//!                            Client A       Client B       Client C
//! ```
//!
//! Per connection, one task selects over the socket and the broadcast
//! receiver of the document it is subscribed to:
//! - `edit`: decode, apply to the canonical replica under its lock, fan the
//!   op out to every other subscriber of the document.
//! - `sync`: linearize the canonical replica under its lock and answer on
//!   this connection only.
//! - `subscribe` / `join` / `leave`: room membership and the user roster.
//! - `exists` / `create` / `ping`: request-response and fire-and-forget
//!   housekeeping.
//!
//! Malformed frames and unsupported message types get a private `error`
//! frame; nothing is applied and the connection stays open. A `subscribe`
//! or `join` refused because the document is full is the exception: the
//! error frame is followed by a close.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_core::EditOp;

use crate::broadcast::{BroadcastGroup, Outbound, RoomManager};
use crate::protocol::{ClientFrame, ServerFrame, WireMessage};
use crate::registry::DocumentRegistry;

/// How long a refused connection waits for the peer's close frame.
const CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Maximum subscribed connections per document
    pub max_peers_per_room: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames answered with an `error` frame.
    pub rejected_messages: u64,
}

/// State shared by every connection task.
#[derive(Clone)]
struct ServerContext {
    registry: Arc<DocumentRegistry>,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: ServerContext,
}

impl SyncServer {
    /// Build a server with an empty registry. Nothing is bound until [`run`](Self::run).
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            ctx: ServerContext {
                registry: Arc::new(DocumentRegistry::new()),
                rooms,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Server with [`ServerConfig::default`].
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Snapshot of the connection and message counters.
    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    /// Address [`run`](Self::run) binds to.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Canonical replicas.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.ctx.registry
    }

    /// Live subscriptions by document.
    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.ctx.rooms
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ServerContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut session = Session::new(ctx.clone());
    log::info!("WebSocket connection {} established from {addr}", session.conn_id);

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let reply = match ClientFrame::decode(text.as_str()) {
                                Ok(frame) => session.handle_frame(frame).await,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    Some(ServerFrame::error())
                                }
                            };
                            if let Some(reply) = reply {
                                if matches!(reply, ServerFrame::Error { .. }) {
                                    ctx.stats.write().await.rejected_messages += 1;
                                }
                                ws_sender.send(Message::text(reply.encode()?)).await?;
                            }
                            if session.closing {
                                log::info!("Closing connection {} from {addr}: room is full", session.conn_id);
                                ws_sender.send(Message::Close(None)).await?;
                                // Read until the peer closes too, so frames it already
                                // sent do not reset the socket under our close.
                                let _ = tokio::time::timeout(CLOSE_GRACE, async {
                                    while let Some(Ok(msg)) = ws_receiver.next().await {
                                        if msg.is_close() {
                                            break;
                                        }
                                    }
                                })
                                .await;
                                break;
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Binary frame from {addr} rejected");
                            ctx.stats.write().await.rejected_messages += 1;
                            ws_sender.send(Message::text(ServerFrame::error().encode()?)).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                outbound = session.next_outbound() => {
                    match outbound {
                        Ok(outbound) => {
                            // Don't echo back to sender
                            if outbound.is_for(session.conn_id) {
                                ws_sender.send(Message::text(outbound.frame.clone())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {} lagged by {n} frames", session.conn_id);
                            session.record_lag(n);
                        }
                        Err(RecvError::Closed) => session.subscription = None,
                    }
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    // Cleanup runs on every exit path, including send failures.
    session.unsubscribe().await;
    ctx.stats.write().await.active_connections -= 1;

    result
}

/// The document a connection is subscribed to.
struct Subscription {
    doc_id: String,
    room: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Arc<Outbound>>,
}

/// Per-connection protocol state.
struct Session {
    conn_id: Uuid,
    ctx: ServerContext,
    subscription: Option<Subscription>,
    /// Set once a subscription is refused; the connection is closed after the reply.
    closing: bool,
}

impl Session {
    fn new(ctx: ServerContext) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            ctx,
            subscription: None,
            closing: false,
        }
    }

    /// Next frame on the subscribed document; pending while unsubscribed.
    async fn next_outbound(&mut self) -> Result<Arc<Outbound>, RecvError> {
        match self.subscription.as_mut() {
            Some(sub) => sub.rx.recv().await,
            None => std::future::pending().await,
        }
    }

    fn record_lag(&self, n: u64) {
        if let Some(sub) = &self.subscription {
            sub.room.record_dropped(n);
        }
    }

    fn is_subscribed_to(&self, doc_id: &str) -> bool {
        self.subscription.as_ref().is_some_and(|sub| sub.doc_id == doc_id)
    }

    /// Process one client frame. Returns the private reply, if any.
    async fn handle_frame(&mut self, frame: ClientFrame) -> Option<ServerFrame> {
        match frame {
            ClientFrame::Subscribe { doc_id } => {
                if self.subscribe(&doc_id).await {
                    None
                } else {
                    self.closing = true;
                    Some(ServerFrame::error())
                }
            }

            ClientFrame::Sync { doc_id } => {
                let (doc, created) = self.ctx.registry.get_or_create(&doc_id).await;
                if created {
                    log::info!("Sync request created empty document {doc_id}");
                }
                let reply = {
                    let doc = doc.lock().await;
                    ServerFrame::sync_response(doc_id.clone(), &doc.snapshot())
                };
                log::debug!("Answering sync request for {doc_id} on {}", self.conn_id);
                Some(reply)
            }

            ClientFrame::Edit { doc_id, message } => self.apply_edit(doc_id, message).await,

            ClientFrame::Create { doc_id } => {
                let (_, created) = self.ctx.registry.get_or_create(&doc_id).await;
                if !created {
                    log::debug!("Create for existing document {doc_id} ignored");
                }
                None
            }

            ClientFrame::Exists { doc_id } => {
                let exists = self.ctx.registry.exists(&doc_id).await;
                Some(ServerFrame::ExistsResponse { doc_id, exists })
            }

            ClientFrame::Join { doc_id, username } => {
                if !self.is_subscribed_to(&doc_id) && !self.subscribe(&doc_id).await {
                    self.closing = true;
                    return Some(ServerFrame::error());
                }
                log::info!("User {username} joined document {doc_id}");
                self.set_username(Some(username)).await;
                None
            }

            ClientFrame::Leave { doc_id, username } => {
                if self.is_subscribed_to(&doc_id) {
                    log::info!("User {username} left document {doc_id}");
                    self.set_username(None).await;
                }
                None
            }

            ClientFrame::Ping => Some(ServerFrame::Pong),
        }
    }

    async fn apply_edit(&mut self, doc_id: String, message: WireMessage) -> Option<ServerFrame> {
        let op = match EditOp::try_from(message) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("Rejected edit for {doc_id} from {}: {e}", self.conn_id);
                return Some(ServerFrame::error());
            }
        };

        let (doc, _) = self.ctx.registry.get_or_create(&doc_id).await;
        let changed = doc.lock().await.apply(&op);
        match op.target() {
            Some(target) => log::debug!("Applied op on {target} to {doc_id} (changed: {changed})"),
            None => log::debug!("Applied batch of {} to {doc_id} (changed: {changed})", op.leaf_count()),
        }

        if let Some(room) = self.ctx.rooms.get(&doc_id).await {
            let update = ServerFrame::Update {
                doc_id,
                message: WireMessage::from(&op),
            };
            if let Err(e) = room.broadcast(Some(self.conn_id), &update) {
                log::error!("Failed to broadcast update: {e}");
            }
        }
        None
    }

    /// Subscribe to `doc_id`, leaving any previous document.
    async fn subscribe(&mut self, doc_id: &str) -> bool {
        if self.is_subscribed_to(doc_id) {
            return true;
        }
        self.unsubscribe().await;

        match self.ctx.rooms.join(doc_id, self.conn_id).await {
            Some((room, rx)) => {
                log::info!("Connection {} subscribed to {doc_id}", self.conn_id);
                self.subscription = Some(Subscription {
                    doc_id: doc_id.to_string(),
                    room,
                    rx,
                });
                true
            }
            None => {
                log::warn!("Connection {} refused: document {doc_id} is full", self.conn_id);
                false
            }
        }
    }

    async fn unsubscribe(&mut self) {
        let Some(sub) = self.subscription.take() else {
            return;
        };
        if self.ctx.rooms.leave(&sub.doc_id, &sub.room, &self.conn_id).await {
            publish_roster(&sub.doc_id, &sub.room).await;
        }
    }

    async fn set_username(&mut self, username: Option<String>) {
        if let Some(sub) = &self.subscription {
            if sub.room.set_username(&self.conn_id, username).await {
                publish_roster(&sub.doc_id, &sub.room).await;
            }
        }
    }
}

/// Send the current roster to every subscriber of the room.
async fn publish_roster(doc_id: &str, room: &BroadcastGroup) {
    let users = room.roster().await;
    let frame = ServerFrame::Users {
        doc_id: doc_id.to_string(),
        users,
    };
    if let Err(e) = room.broadcast(None, &frame) {
        log::error!("Failed to publish roster for {doc_id}: {e}");
    }
}
