use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{
    Query, State,
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use peerlink::{
    ConnectionEvent, DataConnection, DataConnectionOptions, DataValue, ErrorKind, MemoryProvider,
    Peer, PeerEvent, PeerOptions, Serialization,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;
use tracing_subscriber::fmt::SubscriberBuilder;

const WAIT: Duration = Duration::from_secs(10);

/// Minimal PeerJS-style server: hands out ids and forwards messages by `dst`.
#[derive(Clone, Default)]
struct RelayState {
    peers: Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>>,
    next_id: Arc<AtomicU32>,
}

fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/peerjs", get(ws_handler))
        .route("/peerjs/id", get(issue_id))
        .with_state(state)
}

async fn issue_id(State(state): State<RelayState>) -> String {
    format!("peer-{}", state.next_id.fetch_add(1, Ordering::SeqCst) + 1)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let id = params.get("id").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, id, state))
}

async fn handle_socket(socket: WebSocket, id: String, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    {
        let mut peers = state.peers.lock().await;
        if peers.contains_key(&id) {
            drop(peers);
            send_json(&tx, json!({ "type": "ID-TAKEN", "payload": { "msg": "ID is taken" } }));
            // Let the writer flush before the socket goes away.
            tokio::time::sleep(Duration::from_millis(50)).await;
            send_task.abort();
            return;
        }
        peers.insert(id.clone(), tx.clone());
    }
    send_json(&tx, json!({ "type": "OPEN" }));

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if value["type"] == "HEARTBEAT" {
                    continue;
                }
                let Some(dst) = value["dst"].as_str().map(str::to_string) else {
                    continue;
                };
                value["src"] = json!(id);
                debug!(src = %id, %dst, kind = %value["type"], "relay forwarding");
                let target = state.peers.lock().await.get(&dst).cloned();
                match target {
                    Some(target) => send_json(&target, value),
                    None => send_json(&tx, json!({ "type": "EXPIRE", "src": dst })),
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.peers.lock().await.remove(&id);
    send_task.abort();
    let _ = send_task.await;
}

fn send_json(tx: &mpsc::UnboundedSender<WsMessage>, value: Value) {
    if let Ok(text) = serde_json::to_string(&value) {
        let _ = tx.send(WsMessage::Text(text));
    }
}

async fn next_matching<E, T>(
    events: &mut mpsc::UnboundedReceiver<E>,
    mut pick: impl FnMut(E) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_open(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> String {
    next_matching(events, |event| match event {
        PeerEvent::Open(id) => Some(id),
        PeerEvent::Error(error) => panic!("peer error: {error}"),
        _ => None,
    })
    .await
}

async fn wait_data(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> DataValue {
    next_matching(events, |event| match event {
        ConnectionEvent::Data(value) => Some(value),
        _ => None,
    })
    .await
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    expected: ConnectionEvent,
) {
    next_matching(events, |event| (event == expected).then_some(())).await
}

struct Relay {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Relay {
    async fn start() -> Self {
        let _ = SubscriberBuilder::default()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let port = listener.local_addr().expect("local addr").port();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, build_router(RelayState::default()))
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        Self {
            port,
            shutdown: Some(shutdown_tx),
        }
    }

    fn options(&self) -> PeerOptions {
        PeerOptions::new("127.0.0.1", self.port)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Connect `from` to `to` and wait until both ends report open.
async fn open_pair(
    from: &Peer,
    to_events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    to_id: &str,
    options: DataConnectionOptions,
) -> (
    DataConnection,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    DataConnection,
    mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let outgoing = from.connect(to_id, options).expect("connection");
    let mut outgoing_events = outgoing.events().expect("connection events");
    let incoming = next_matching(to_events, |event| match event {
        PeerEvent::Connection(connection) => Some(connection),
        _ => None,
    })
    .await;
    let mut incoming_events = incoming.events().expect("incoming events");
    wait_for(&mut outgoing_events, ConnectionEvent::Open).await;
    wait_for(&mut incoming_events, ConnectionEvent::Open).await;
    (outgoing, outgoing_events, incoming, incoming_events)
}

#[tokio::test]
async fn two_peers_exchange_data_through_signaling_relay() {
    let relay = Relay::start().await;

    let provider = MemoryProvider::new();
    let alice = Peer::new(relay.options().with_identity("alice"), provider.clone());
    let bob = Peer::new(relay.options(), provider.clone());
    let mut alice_events = alice.events().expect("alice events");
    let mut bob_events = bob.events().expect("bob events");

    assert_eq!(wait_open(&mut alice_events).await, "alice");
    let bob_id = wait_open(&mut bob_events).await;
    assert_eq!(bob_id, "peer-1");

    let connection = alice
        .connect(
            &bob_id,
            DataConnectionOptions::default()
                .with_serialization(Serialization::Json)
                .with_metadata(json!({ "topic": "greeting" })),
        )
        .expect("connection");
    let mut outgoing = connection.events().expect("connection events");

    let incoming = next_matching(&mut bob_events, |event| match event {
        PeerEvent::Connection(connection) => Some(connection),
        _ => None,
    })
    .await;
    assert_eq!(incoming.peer(), "alice");
    assert_eq!(incoming.serialization(), Serialization::Json);
    assert_eq!(incoming.metadata(), Some(&json!({ "topic": "greeting" })));
    let mut incoming_events = incoming.events().expect("incoming events");

    wait_for(&mut outgoing, ConnectionEvent::Open).await;
    wait_for(&mut incoming_events, ConnectionEvent::Open).await;

    let greeting = DataValue::from(json!({ "hello": "bob", "n": 1 }));
    connection.send(greeting.clone());
    assert_eq!(wait_data(&mut incoming_events).await, greeting);

    incoming.send("pong");
    assert_eq!(wait_data(&mut outgoing).await, DataValue::from("pong"));

    let expire = alice.connect("nobody", DataConnectionOptions::default());
    assert!(expire.is_some());
    next_matching(&mut alice_events, |event| match event {
        PeerEvent::Error(error) if error.kind == ErrorKind::PeerUnavailable => Some(()),
        _ => None,
    })
    .await;

    alice.destroy();
    wait_for(&mut incoming_events, ConnectionEvent::Close).await;
    assert!(bob.connections().is_empty());

    bob.destroy();
}

#[tokio::test]
async fn large_binary_payloads_cross_the_relay_in_chunks() {
    let relay = Relay::start().await;
    let provider = MemoryProvider::new();
    let alice = Peer::new(relay.options().with_identity("alice"), provider.clone());
    let bob = Peer::new(relay.options().with_identity("bob"), provider.clone());
    let mut alice_events = alice.events().expect("alice events");
    let mut bob_events = bob.events().expect("bob events");
    wait_open(&mut alice_events).await;
    wait_open(&mut bob_events).await;

    let (outgoing, _outgoing_events, incoming, mut incoming_events) = open_pair(
        &alice,
        &mut bob_events,
        "bob",
        DataConnectionOptions::default(),
    )
    .await;
    assert_eq!(incoming.serialization(), Serialization::Binary);

    let blob: Vec<u8> = (0..200_000u32).map(|n| (n % 251) as u8).collect();
    outgoing.send(DataValue::from(blob.clone()));
    outgoing.send("after");
    assert_eq!(wait_data(&mut incoming_events).await, DataValue::from(blob));
    assert_eq!(wait_data(&mut incoming_events).await, DataValue::from("after"));

    alice.destroy();
    bob.destroy();
}

#[tokio::test]
async fn disconnected_peer_reconnects_with_the_same_identity() {
    let relay = Relay::start().await;
    let provider = MemoryProvider::new();
    let alice = Peer::new(relay.options().with_identity("alice"), provider.clone());
    let bob = Peer::new(relay.options().with_identity("bob"), provider.clone());
    let mut alice_events = alice.events().expect("alice events");
    let mut bob_events = bob.events().expect("bob events");
    wait_open(&mut alice_events).await;
    wait_open(&mut bob_events).await;

    alice.disconnect();
    let last = next_matching(&mut alice_events, |event| match event {
        PeerEvent::Disconnected(id) => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(last.as_deref(), Some("alice"));
    assert!(alice.id().is_none());

    // The relay forgets the old socket once it notices the close.
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.reconnect();
    assert_eq!(wait_open(&mut alice_events).await, "alice");
    assert!(alice.is_open());

    let (outgoing, _outgoing_events, _incoming, mut incoming_events) = open_pair(
        &alice,
        &mut bob_events,
        "bob",
        DataConnectionOptions::default().with_serialization(Serialization::Json),
    )
    .await;
    outgoing.send("back online");
    assert_eq!(
        wait_data(&mut incoming_events).await,
        DataValue::from("back online")
    );

    alice.destroy();
    bob.destroy();
}

#[tokio::test]
async fn duplicate_identity_is_rejected_by_the_server() {
    let relay = Relay::start().await;
    let provider = MemoryProvider::new();
    let first = Peer::new(relay.options().with_identity("carol"), provider.clone());
    let mut first_events = first.events().expect("first events");
    wait_open(&mut first_events).await;

    let second = Peer::new(relay.options().with_identity("carol"), provider.clone());
    let mut second_events = second.events().expect("second events");
    let kind = next_matching(&mut second_events, |event| match event {
        PeerEvent::Error(error) => Some(error.kind),
        PeerEvent::Open(id) => panic!("duplicate identity {id} was accepted"),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::UnavailableId);
    next_matching(&mut second_events, |event| (event == PeerEvent::Close).then_some(())).await;
    assert!(second.is_destroyed());
    assert!(first.is_open());

    first.destroy();
}
