//! WebSocket sync client for one document.
//!
//! Provides:
//! - Connection lifecycle with fixed-delay reconnect, retried forever
//! - Op publish with an offline queue replayed on reconnect
//! - Bootstrap from the server's canonical replica after every connect
//! - User roster updates
//!
//! ```text
//!            connect ok                 socket error / close
//! Connecting ─────────► Connected ───────────────────────────► ReconnectWait
//!     ▲                                                              │
//!     └──────────────────────── reconnect_delay ─────────────────────┘
//! ```
//!
//! The client never touches a [`tandem_core::Document`]. Decoded ops come
//! out as [`SyncEvent`]s and the application applies them to its own
//! `Editor` on its own task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tandem_core::EditOp;

use crate::protocol::{ClientFrame, ProtocolError, ServerFrame};

/// Upper bound on a one-shot request such as [`document_exists`].
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Wait between a lost connection and the next attempt
    pub reconnect_delay: Duration,
    /// Capacity of the event channel handed to the application
    pub event_capacity: usize,
    /// Ops kept while offline; publishing beyond this fails
    pub offline_queue_capacity: usize,
    /// Display name announced with `join`, if any
    pub username: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            reconnect_delay: Duration::from_secs(2),
            event_capacity: 256,
            offline_queue_capacity: 10_000,
            username: None,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectWait,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Subscribed, queue replayed and sync requested
    Connected,
    /// Connection lost; a reconnect is scheduled
    Disconnected,
    /// A live op from another connection
    RemoteOp(EditOp),
    /// The canonical node set, as inserts in linear order
    Bootstrap(Vec<EditOp>),
    /// Sorted names of users joined to the document
    Users(Vec<String>),
    /// The server refused one of our frames
    Rejected,
}

/// Offline queue for ops published while disconnected.
///
/// Replayed in publish order on the next connect.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<EditOp>,
    max_size: usize,
}

impl OfflineQueue {
    /// Empty queue holding at most `max_size` ops.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an op. `false` if the queue is full.
    pub fn enqueue(&mut self, op: EditOp) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(op);
        true
    }

    /// Put ops that failed to send back at the front, keeping their order.
    ///
    /// Ignores the capacity: these ops were already accepted once.
    pub fn requeue(&mut self, ops: Vec<EditOp>) {
        for op in ops.into_iter().rev() {
            self.queue.push_front(op);
        }
    }

    /// Remove and return every queued op, oldest first.
    pub fn drain(&mut self) -> Vec<EditOp> {
        self.queue.drain(..).collect()
    }

    /// Queued entries; a batch counts once.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is waiting to be replayed.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Leaf ops queued, counting each batch member.
    pub fn leaf_count(&self) -> usize {
        self.queue.iter().map(EditOp::leaf_count).sum()
    }
}

/// State shared between the client handle and its supervisor task.
struct Shared {
    doc_id: String,
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    // Lock order: `queue` before `state`.
    queue: Mutex<OfflineQueue>,
    event_tx: mpsc::Sender<SyncEvent>,
}

/// The sync client.
///
/// Keeps one document in sync with the server, reconnecting as needed.
pub struct SyncClient {
    shared: Arc<Shared>,
    op_tx: mpsc::UnboundedSender<EditOp>,
    op_rx: Option<mpsc::UnboundedReceiver<EditOp>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    supervisor: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client for `doc_id`. Nothing is sent until [`start`](Self::start).
    pub fn new(doc_id: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let queue = OfflineQueue::new(config.offline_queue_capacity);
        Self {
            shared: Arc::new(Shared {
                doc_id: doc_id.into(),
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                queue: Mutex::new(queue),
                event_tx,
            }),
            op_tx,
            op_rx: Some(op_rx),
            event_rx: Some(event_rx),
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Spawn the connection supervisor. Calling it again is a no-op.
    pub fn start(&mut self) {
        let Some(op_rx) = self.op_rx.take() else {
            return;
        };
        let shared = self.shared.clone();
        self.supervisor = Some(tokio::spawn(supervise(shared, op_rx)));
    }

    /// Send an op to the server, or queue it while offline.
    ///
    /// Fails only when the offline queue is full.
    pub async fn publish(&self, op: &EditOp) -> Result<(), ProtocolError> {
        let mut queue = self.shared.queue.lock().await;
        let connected = *self.shared.state.read().await == ConnectionState::Connected;
        if connected && self.op_tx.send(op.clone()).is_ok() {
            return Ok(());
        }
        if !queue.enqueue(op.clone()) {
            log::warn!(
                "Offline queue full for {}, dropping op",
                self.shared.doc_id
            );
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    /// Publish every op in order, e.g. the output of `Editor::take_outgoing`.
    pub async fn publish_all<I>(&self, ops: I) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = EditOp>,
    {
        for op in ops {
            self.publish(&op).await?;
        }
        Ok(())
    }

    /// Stop the supervisor, cancelling any pending reconnect.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
            let _ = handle.await;
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
        log::info!("Sync client for {} shut down", self.shared.doc_id);
    }

    /// Current state of the connection supervisor.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Document this client keeps in sync.
    pub fn doc_id(&self) -> &str {
        &self.shared.doc_id
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Ops waiting for the next connect.
    pub async fn offline_queue_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

/// Connect, run a session, wait, repeat. Never returns on its own.
async fn supervise(shared: Arc<Shared>, mut op_rx: mpsc::UnboundedReceiver<EditOp>) {
    let url = shared.config.server_url.clone();
    loop {
        *shared.state.write().await = ConnectionState::Connecting;
        log::debug!("Connecting to {url} for document {}", shared.doc_id);

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                log::info!("Connected to {url} for document {}", shared.doc_id);
                if let Err(e) = shared.run_session(socket, &mut op_rx).await {
                    log::warn!("Session for {} ended: {e}", shared.doc_id);
                }
                shared.end_session(&mut op_rx).await;
            }
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *shared.state.write().await = ConnectionState::ReconnectWait;
            }
        }

        tokio::time::sleep(shared.config.reconnect_delay).await;
    }
}

impl Shared {
    async fn run_session(
        &self,
        socket: Socket,
        op_rx: &mut mpsc::UnboundedReceiver<EditOp>,
    ) -> Result<(), ProtocolError> {
        let (mut sink, mut stream) = socket.split();
        let doc_id = self.doc_id.clone();

        send_frame(&mut sink, &ClientFrame::Subscribe { doc_id: doc_id.clone() }).await?;
        if let Some(username) = &self.config.username {
            let join = ClientFrame::Join {
                doc_id: doc_id.clone(),
                username: username.clone(),
            };
            send_frame(&mut sink, &join).await?;
        }

        {
            let mut queue = self.queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued ops for {doc_id}", queued.len());
            }
            let mut pending = queued.into_iter();
            while let Some(op) = pending.next() {
                if let Err(e) = send_frame(&mut sink, &ClientFrame::edit(doc_id.clone(), &op)).await {
                    let mut rest = vec![op];
                    rest.extend(pending);
                    queue.requeue(rest);
                    return Err(e);
                }
            }
            send_frame(&mut sink, &ClientFrame::Sync { doc_id: doc_id.clone() }).await?;
            *self.state.write().await = ConnectionState::Connected;
        }
        self.emit(SyncEvent::Connected).await;

        let mut gate = BootstrapGate::new();
        loop {
            tokio::select! {
                op = op_rx.recv() => {
                    // The sender lives in the client handle, which aborts us on drop.
                    let Some(op) = op else { return Ok(()) };
                    if let Err(e) = send_frame(&mut sink, &ClientFrame::edit(doc_id.clone(), &op)).await {
                        self.queue.lock().await.requeue(vec![op]);
                        return Err(e);
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = interpret(&doc_id, text.as_str()) {
                                for event in gate.admit(event) {
                                    self.emit(event).await;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Move unsent ops back to the offline queue and schedule a reconnect.
    async fn end_session(&self, op_rx: &mut mpsc::UnboundedReceiver<EditOp>) {
        let previous = {
            let mut queue = self.queue.lock().await;
            let previous = {
                let mut state = self.state.write().await;
                std::mem::replace(&mut *state, ConnectionState::ReconnectWait)
            };
            while let Ok(op) = op_rx.try_recv() {
                if !queue.enqueue(op) {
                    log::warn!("Offline queue full for {}, dropping op", self.doc_id);
                }
            }
            previous
        };

        if previous == ConnectionState::Connected {
            self.emit(SyncEvent::Disconnected).await;
        }
    }

    async fn emit(&self, event: SyncEvent) {
        // The application may have dropped its receiver; that is not our error.
        let _ = self.event_tx.send(event).await;
    }
}

/// Holds live ops back until the session's bootstrap is out.
///
/// The server relays updates from the moment we subscribe, so one can
/// arrive before the sync response. Its parent may only be in that
/// response, and a child applied before its parent would be anchored
/// at the root for good.
#[derive(Debug)]
struct BootstrapGate {
    held: Option<Vec<EditOp>>,
}

impl BootstrapGate {
    fn new() -> Self {
        Self {
            held: Some(Vec::new()),
        }
    }

    /// Events to emit, in order, for one interpreted server frame.
    fn admit(&mut self, event: SyncEvent) -> Vec<SyncEvent> {
        match (event, &mut self.held) {
            (SyncEvent::RemoteOp(op), Some(held)) => {
                held.push(op);
                Vec::new()
            }
            (SyncEvent::Bootstrap(ops), held) => {
                let mut events = vec![SyncEvent::Bootstrap(ops)];
                if let Some(held) = held.take() {
                    if !held.is_empty() {
                        log::debug!("Releasing {} ops held for bootstrap", held.len());
                    }
                    events.extend(held.into_iter().map(SyncEvent::RemoteOp));
                }
                events
            }
            (event, _) => vec![event],
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), ProtocolError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::text(frame.encode()?)).await?;
    Ok(())
}

/// Turn a server text frame into an application event.
fn interpret(doc_id: &str, text: &str) -> Option<SyncEvent> {
    let frame = match ServerFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Failed to decode server frame: {e}");
            return None;
        }
    };

    match frame {
        ServerFrame::Update { doc_id: id, message } if id == doc_id => {
            match EditOp::try_from(message) {
                Ok(op) => Some(SyncEvent::RemoteOp(op)),
                Err(e) => {
                    log::warn!("Ignoring update for {doc_id}: {e}");
                    None
                }
            }
        }
        ServerFrame::SyncResponse { doc_id: id, messages } if id == doc_id => {
            let mut ops = Vec::with_capacity(messages.len());
            for message in messages {
                match EditOp::try_from(message) {
                    Ok(op) => ops.push(op),
                    Err(e) => log::warn!("Skipping sync entry for {doc_id}: {e}"),
                }
            }
            log::debug!("Received {} nodes for {doc_id}", ops.len());
            Some(SyncEvent::Bootstrap(ops))
        }
        ServerFrame::Users { doc_id: id, users } if id == doc_id => Some(SyncEvent::Users(users)),
        ServerFrame::Error { .. } => {
            log::warn!("Server rejected a frame for {doc_id}");
            Some(SyncEvent::Rejected)
        }
        ServerFrame::Pong => {
            log::trace!("pong");
            None
        }
        other => {
            log::debug!("Ignoring unrelated frame {other:?}");
            None
        }
    }
}

/// Ask the server whether `doc_id` exists. Never creates it.
pub async fn document_exists(server_url: &str, doc_id: &str) -> Result<bool, ProtocolError> {
    let frames = [ClientFrame::Exists {
        doc_id: doc_id.to_string(),
    }];
    request(server_url, &frames, |frame| match frame {
        ServerFrame::ExistsResponse { doc_id: id, exists } if id == doc_id => Some(exists),
        _ => None,
    })
    .await
}

/// Tell the server to create an empty `doc_id`.
///
/// Returns once the server has handled the request.
pub async fn create_document(server_url: &str, doc_id: &str) -> Result<(), ProtocolError> {
    let frames = [
        ClientFrame::Create {
            doc_id: doc_id.to_string(),
        },
        // Frames on one connection are handled in order.
        ClientFrame::Ping,
    ];
    request(server_url, &frames, |frame| {
        matches!(frame, ServerFrame::Pong).then_some(())
    })
    .await
}

/// One-shot exchange on a fresh connection, bounded by [`REQUEST_TIMEOUT`].
async fn request<T, F>(server_url: &str, frames: &[ClientFrame], mut pick: F) -> Result<T, ProtocolError>
where
    F: FnMut(ServerFrame) -> Option<T>,
{
    let exchange = async {
        let (mut socket, _) = tokio_tungstenite::connect_async(server_url).await?;
        for frame in frames {
            send_frame(&mut socket, frame).await?;
        }
        while let Some(msg) = socket.next().await {
            if let Message::Text(text) = msg? {
                if let Some(answer) = ServerFrame::decode(text.as_str()).ok().and_then(&mut pick) {
                    let _ = socket.close(None).await;
                    return Ok(answer);
                }
            }
        }
        Err(ProtocolError::ConnectionClosed)
    };

    tokio::time::timeout(REQUEST_TIMEOUT, exchange)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireMessage;
    use tandem_core::{CharacterNode, NodeId};

    fn insert(value: char, id: &str) -> EditOp {
        EditOp::Insert(CharacterNode::new(value, NodeId::new(id), NodeId::root()))
    }

    fn offline_config() -> ClientConfig {
        ClientConfig {
            // Port 9 (discard) is never a WebSocket server.
            server_url: "ws://127.0.0.1:9".to_string(),
            reconnect_delay: Duration::from_millis(20),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:9090");
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.offline_queue_capacity, 10_000);
        assert!(config.username.is_none());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("12345", ClientConfig::default());
        assert_eq!(client.doc_id(), "12345");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_publish_offline_queues() {
        let client = SyncClient::new("12345", ClientConfig::default());
        client.publish(&insert('a', "A_1")).await.unwrap();
        client
            .publish_all(vec![insert('b', "A_2"), EditOp::delete("A_1")])
            .await
            .unwrap();
        assert_eq!(client.offline_queue_len().await, 3);
    }

    #[tokio::test]
    async fn test_publish_fails_when_queue_full() {
        let config = ClientConfig {
            offline_queue_capacity: 1,
            ..ClientConfig::default()
        };
        let client = SyncClient::new("12345", config);
        client.publish(&insert('a', "A_1")).await.unwrap();
        assert_eq!(
            client.publish(&insert('b', "A_2")).await,
            Err(ProtocolError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("12345", ClientConfig::default());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_retrying() {
        let mut client = SyncClient::new("12345", offline_config());
        client.start();
        client.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = client.connection_state().await;
        assert!(
            matches!(state, ConnectionState::Connecting | ConnectionState::ReconnectWait),
            "unexpected state {state:?}"
        );

        // Edits made meanwhile wait in the queue.
        client.publish(&insert('a', "A_1")).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 1);

        client.shutdown().await;
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_request_to_unreachable_server_fails() {
        assert!(document_exists("ws://127.0.0.1:9", "12345").await.is_err());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(insert('a', "A_1"));
        queue.enqueue(EditOp::Batch(vec![insert('b', "A_2"), insert('c', "A_3")]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.leaf_count(), 3);

        let drained = queue.drain();
        assert_eq!(drained[0], insert('a', "A_1"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity_and_clear() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(insert('a', "A_1")));
        assert!(queue.enqueue(insert('b', "A_2")));
        assert!(!queue.enqueue(insert('c', "A_3")));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_requeue_keeps_order() {
        let mut queue = OfflineQueue::new(2);
        queue.enqueue(insert('c', "A_3"));
        queue.requeue(vec![insert('a', "A_1"), insert('b', "A_2")]);
        let ids: Vec<_> = queue
            .drain()
            .iter()
            .filter_map(|op| op.target().map(|id| id.to_string()))
            .collect();
        assert_eq!(ids, vec!["A_1", "A_2", "A_3"]);
    }

    #[test]
    fn test_gate_holds_live_ops_until_bootstrap() {
        let mut gate = BootstrapGate::new();
        assert!(gate.admit(SyncEvent::RemoteOp(insert('b', "B_2"))).is_empty());
        assert_eq!(gate.admit(SyncEvent::Rejected), vec![SyncEvent::Rejected]);
        assert!(gate.admit(SyncEvent::RemoteOp(insert('c', "B_3"))).is_empty());

        let snapshot = vec![insert('a', "A_1")];
        assert_eq!(
            gate.admit(SyncEvent::Bootstrap(snapshot.clone())),
            vec![
                SyncEvent::Bootstrap(snapshot),
                SyncEvent::RemoteOp(insert('b', "B_2")),
                SyncEvent::RemoteOp(insert('c', "B_3")),
            ]
        );
    }

    #[test]
    fn test_gate_passes_ops_after_bootstrap() {
        let mut gate = BootstrapGate::new();
        assert_eq!(
            gate.admit(SyncEvent::Bootstrap(Vec::new())),
            vec![SyncEvent::Bootstrap(Vec::new())]
        );
        assert_eq!(
            gate.admit(SyncEvent::RemoteOp(insert('x', "B_9"))),
            vec![SyncEvent::RemoteOp(insert('x', "B_9"))]
        );
        let users = SyncEvent::Users(vec!["alice".into()]);
        assert_eq!(gate.admit(users.clone()), vec![users]);
    }

    #[test]
    fn test_interpret_update_for_our_document() {
        let op = insert('x', "B_1");
        let frame = ServerFrame::Update {
            doc_id: "12345".into(),
            message: WireMessage::from(&op),
        };
        let text = frame.encode().unwrap();
        assert_eq!(interpret("12345", &text), Some(SyncEvent::RemoteOp(op)));
        assert_eq!(interpret("54321", &text), None);
    }

    #[test]
    fn test_interpret_sync_response() {
        let mut tomb = CharacterNode::new('a', NodeId::new("A_1"), NodeId::root());
        tomb.visible = false;
        let frame = ServerFrame::sync_response("12345", &[tomb.clone()]);
        let text = frame.encode().unwrap();
        assert_eq!(
            interpret("12345", &text),
            Some(SyncEvent::Bootstrap(vec![EditOp::Insert(tomb)]))
        );
    }

    #[test]
    fn test_interpret_roster_error_and_garbage() {
        let users = ServerFrame::Users {
            doc_id: "12345".into(),
            users: vec!["ana".into()],
        };
        assert_eq!(
            interpret("12345", &users.encode().unwrap()),
            Some(SyncEvent::Users(vec!["ana".into()]))
        );
        assert_eq!(
            interpret("12345", &ServerFrame::error().encode().unwrap()),
            Some(SyncEvent::Rejected)
        );
        assert_eq!(interpret("12345", r#"{"frame":"pong"}"#), None);
        assert_eq!(interpret("12345", "not json"), None);
    }
}
