//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients, feeding
//! every event into a real `Editor` the way an application would.

use std::sync::Arc;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

use tandem_collab::client::{
    create_document, document_exists, ClientConfig, ConnectionState, SyncClient, SyncEvent,
};
use tandem_collab::protocol::{ClientFrame, ServerFrame};
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_core::{EditOp, Editor};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server_on(port: u16) -> Arc<SyncServer> {
    start_server(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        max_peers_per_room: 10,
    })
    .await
}

async fn start_server(config: ServerConfig) -> Arc<SyncServer> {
    let server = Arc::new(SyncServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;
    server
}

/// Start a server on a free port, return it and its URL.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let port = free_port().await;
    let server = start_server_on(port).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

fn config(url: &str, username: Option<&str>) -> ClientConfig {
    ClientConfig {
        server_url: url.to_string(),
        reconnect_delay: Duration::from_millis(50),
        username: username.map(str::to_string),
        ..ClientConfig::default()
    }
}

async fn next_event(events: &mut Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches.
async fn wait_for<F>(events: &mut Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Start a client and wait until it has bootstrapped.
///
/// Fails if a live op is delivered before the bootstrap.
async fn join(
    url: &str,
    doc_id: &str,
    username: Option<&str>,
) -> (SyncClient, Receiver<SyncEvent>, Vec<EditOp>) {
    let mut client = SyncClient::new(doc_id, config(url, username));
    let mut events = client.take_event_rx().unwrap();
    client.start();

    wait_for(&mut events, |e| *e == SyncEvent::Connected).await;
    let ops = loop {
        match next_event(&mut events).await {
            SyncEvent::Bootstrap(ops) => break ops,
            SyncEvent::RemoteOp(op) => panic!("live op {op:?} delivered before the bootstrap"),
            _ => {}
        }
    };
    (client, events, ops)
}

/// Apply the next `n` remote ops to `editor`.
async fn receive_ops(events: &mut Receiver<SyncEvent>, editor: &mut Editor, n: usize) {
    for _ in 0..n {
        match wait_for(events, |e| matches!(e, SyncEvent::RemoteOp(_))).await {
            SyncEvent::RemoteOp(op) => {
                editor.apply_remote(&op);
            }
            _ => unreachable!(),
        }
    }
}

async fn wait_for_server_text(server: &SyncServer, doc_id: &str, expected: &str) {
    let converged = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(doc) = server.registry().get(doc_id).await {
                if doc.lock().await.visible_text() == expected {
                    return;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "server never reached {expected:?}");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_joiner_bootstraps_from_canonical_replica() {
    let (server, url) = start_test_server().await;

    let (alice, _alice_events, snapshot) = join(&url, "10001", None).await;
    assert!(snapshot.is_empty());

    let mut alice_editor = Editor::new("A");
    for (caret, c) in "Hi!".chars().enumerate() {
        alice_editor.insert_at(caret, c);
    }
    alice_editor.delete_at(3);
    alice.publish_all(alice_editor.take_outgoing()).await.unwrap();
    wait_for_server_text(&server, "10001", "Hi").await;

    let (_bob, _bob_events, snapshot) = join(&url, "10001", None).await;
    // Tombstones travel with the snapshot.
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.iter().all(|op| matches!(op, EditOp::Insert(_))));

    let mut bob_editor = Editor::new("B");
    assert_eq!(bob_editor.bootstrap(snapshot), 3);
    assert_eq!(bob_editor.text(), "Hi");
    assert_eq!(bob_editor.document().len(), 3);
}

#[tokio::test]
async fn test_edits_relay_without_echo() {
    let (_server, url) = start_test_server().await;
    let (alice, mut alice_events, _) = join(&url, "10002", None).await;
    let (bob, mut bob_events, _) = join(&url, "10002", None).await;
    let mut alice_editor = Editor::new("A");
    let mut bob_editor = Editor::new("B");

    alice_editor.insert_at(0, 'x');
    alice.publish_all(alice_editor.take_outgoing()).await.unwrap();
    receive_ops(&mut bob_events, &mut bob_editor, 1).await;
    assert_eq!(bob_editor.text(), "x");

    // The originating connection is skipped.
    let echo = timeout(Duration::from_millis(200), alice_events.recv()).await;
    assert!(echo.is_err(), "unexpected event {echo:?}");

    bob_editor.delete_at(1);
    bob.publish_all(bob_editor.take_outgoing()).await.unwrap();
    receive_ops(&mut alice_events, &mut alice_editor, 1).await;
    assert_eq!(alice_editor.text(), "");
}

#[tokio::test]
async fn test_concurrent_typing_converges() {
    let (server, url) = start_test_server().await;
    let (alice, mut alice_events, _) = join(&url, "10003", None).await;
    let (bob, mut bob_events, _) = join(&url, "10003", None).await;
    let mut alice_editor = Editor::new("A");
    let mut bob_editor = Editor::new("B");

    // Both type at the start of an empty document before seeing each other.
    for (caret, c) in "abc".chars().enumerate() {
        alice_editor.insert_at(caret, c);
    }
    for (caret, c) in "xyz".chars().enumerate() {
        bob_editor.insert_at(caret, c);
    }
    let (a, b) = tokio::join!(
        alice.publish_all(alice_editor.take_outgoing()),
        bob.publish_all(bob_editor.take_outgoing()),
    );
    a.unwrap();
    b.unwrap();

    receive_ops(&mut alice_events, &mut alice_editor, 3).await;
    receive_ops(&mut bob_events, &mut bob_editor, 3).await;

    assert_eq!(alice_editor.text(), bob_editor.text());
    assert_eq!(alice_editor.text().len(), 6);
    wait_for_server_text(&server, "10003", &alice_editor.text()).await;
}

#[tokio::test]
async fn test_undo_propagates_to_peers() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events, _) = join(&url, "10004", None).await;
    let (_bob, mut bob_events, _) = join(&url, "10004", None).await;
    let mut alice_editor = Editor::new("A");
    let mut bob_editor = Editor::new("B");

    alice_editor.insert_at(0, 'q');
    alice_editor.delete_at(1);
    alice_editor.undo();
    alice.publish_all(alice_editor.take_outgoing()).await.unwrap();

    receive_ops(&mut bob_events, &mut bob_editor, 3).await;
    assert_eq!(alice_editor.text(), "q");
    assert_eq!(bob_editor.text(), "q");
}

#[tokio::test]
async fn test_document_exists_and_create() {
    let (_server, url) = start_test_server().await;

    assert!(!document_exists(&url, "20001").await.unwrap());
    // The existence check itself must not create the document.
    assert!(!document_exists(&url, "20001").await.unwrap());

    create_document(&url, "20001").await.unwrap();
    assert!(document_exists(&url, "20001").await.unwrap());
    assert!(!document_exists(&url, "20002").await.unwrap());
}

#[tokio::test]
async fn test_user_roster_follows_joins_and_disconnects() {
    let (_server, url) = start_test_server().await;
    // Alice's own roster may arrive before or after her bootstrap.
    let (_alice, mut alice_events, _) = join(&url, "10005", Some("alice")).await;

    let (mut bob, _bob_events, _) = join(&url, "10005", Some("bob")).await;
    wait_for(&mut alice_events, |e| {
        *e == SyncEvent::Users(vec!["alice".into(), "bob".into()])
    })
    .await;

    bob.shutdown().await;
    wait_for(&mut alice_events, |e| *e == SyncEvent::Users(vec!["alice".into()])).await;
}

#[tokio::test]
async fn test_offline_edits_replay_once_server_is_up() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = SyncClient::new("10006", config(&url, None));
    let mut events = client.take_event_rx().unwrap();
    client.start();

    let mut editor = Editor::new("A");
    editor.paste(0, "ok".chars());
    client.publish_all(editor.take_outgoing()).await.unwrap();
    assert_eq!(client.offline_queue_len().await, 2);

    let server = start_server_on(port).await;
    wait_for(&mut events, |e| *e == SyncEvent::Connected).await;
    let snapshot = match wait_for(&mut events, |e| matches!(e, SyncEvent::Bootstrap(_))).await {
        SyncEvent::Bootstrap(ops) => ops,
        _ => unreachable!(),
    };

    // Replayed before the sync request, so the snapshot already holds them.
    assert_eq!(editor.bootstrap(snapshot), 0);
    assert_eq!(client.offline_queue_len().await, 0);
    wait_for_server_text(&server, "10006", "ok").await;
}

#[tokio::test]
async fn test_bad_frames_get_private_error() {
    let (server, url) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    async fn reply<S>(ws: &mut S) -> ServerFrame
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return ServerFrame::decode(text.as_str()).unwrap();
            }
        }
    }

    let unsupported = r#"{"frame":"edit","docId":"10007","message":{"type":"bold"}}"#;
    ws.send(Message::text(unsupported.to_string())).await.unwrap();
    assert_eq!(reply(&mut ws).await, ServerFrame::error());

    ws.send(Message::text("not a frame".to_string())).await.unwrap();
    assert_eq!(reply(&mut ws).await, ServerFrame::error());

    ws.send(Message::binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(reply(&mut ws).await, ServerFrame::error());

    // The connection survives and nothing was applied.
    ws.send(Message::text(r#"{"frame":"ping"}"#.to_string())).await.unwrap();
    assert_eq!(reply(&mut ws).await, ServerFrame::Pong);
    assert!(!server.registry().exists("10007").await);
    assert_eq!(server.stats().await.rejected_messages, 3);
}

/// Next text frame from the client, decoded.
async fn read_client_frame<S>(ws: &mut S) -> ClientFrame
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return ClientFrame::decode(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_update_ahead_of_sync_response_waits_for_bootstrap() {
    // A hand-driven server that relays a peer's keystroke between the
    // client's subscribe and its sync request.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let mut writer = Editor::new("W");
    writer.insert_at(0, 'a');
    let canonical = writer.document().snapshot();
    writer.take_outgoing();
    writer.insert_at(1, 'b');
    let keystroke = writer.take_outgoing().remove(0);

    let update = ServerFrame::Update {
        doc_id: "10008".into(),
        message: (&keystroke).into(),
    };
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        assert!(matches!(read_client_frame(&mut ws).await, ClientFrame::Subscribe { .. }));
        ws.send(Message::text(update.encode().unwrap())).await.unwrap();

        assert!(matches!(read_client_frame(&mut ws).await, ClientFrame::Sync { .. }));
        let response = ServerFrame::sync_response("10008", &canonical);
        ws.send(Message::text(response.encode().unwrap())).await.unwrap();

        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut client = SyncClient::new("10008", config(&url, None));
    let mut events = client.take_event_rx().unwrap();
    client.start();

    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
    let mut reader = Editor::new("R");
    match next_event(&mut events).await {
        SyncEvent::Bootstrap(ops) => assert_eq!(reader.bootstrap(ops), 1),
        other => panic!("expected the bootstrap first, got {other:?}"),
    }
    match next_event(&mut events).await {
        SyncEvent::RemoteOp(op) => assert!(reader.apply_remote(&op)),
        other => panic!("expected the held keystroke, got {other:?}"),
    }

    // Same tree as the writer, so "b" hangs off "a" rather than the root.
    assert_eq!(reader.text(), "ab");
    assert_eq!(reader.document().snapshot(), writer.document().snapshot());
}

#[tokio::test]
async fn test_full_document_refuses_and_closes() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let server = start_server(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        max_peers_per_room: 1,
    })
    .await;

    let (_alice, _alice_events, _) = join(&url, "10009", None).await;

    let mut bob = SyncClient::new(
        "10009",
        ClientConfig {
            reconnect_delay: Duration::from_secs(30),
            ..config(&url, None)
        },
    );
    let mut events = bob.take_event_rx().unwrap();
    bob.start();

    let mut seen = Vec::new();
    loop {
        match next_event(&mut events).await {
            SyncEvent::Disconnected => break,
            event @ (SyncEvent::Bootstrap(_) | SyncEvent::RemoteOp(_)) => {
                panic!("refused client received {event:?}")
            }
            event => seen.push(event),
        }
    }
    assert!(seen.contains(&SyncEvent::Rejected));
    assert_eq!(bob.connection_state().await, ConnectionState::ReconnectWait);

    let room = server.room_manager().get("10009").await.unwrap();
    assert_eq!(room.peer_count().await, 1);
}
