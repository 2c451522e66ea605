//! WebSocket Transport Tests
//!
//! End-to-end over a loopback socket: connect, authenticate, subscribe,
//! receive live events, and observe subscribe-time rejections on the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use stratodb::auth::{TokenConfig, TokenValidator};
use stratodb::livequery::{
    feed, AccessRule, ClassPolicy, ConnectionRegistry, Dispatcher, InMemoryRelationStore,
    InMemoryRoleStore, LiveQueryServer, MutationFeed, SubscriptionTable, WebSocketConfig,
};

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Helper Functions
// =============================================================================

struct TestServer {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    feed: MutationFeed,
    tokens: Arc<TokenValidator>,
}

async fn start_server() -> TestServer {
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(ConnectionRegistry::new(64)),
        Arc::new(SubscriptionTable::new(32)),
        Arc::new(InMemoryRoleStore::new()),
        Arc::new(InMemoryRelationStore::new()),
    ));

    let (feed_handle, consumer) = feed(64);
    tokio::spawn(consumer.run(Arc::clone(&dispatcher)));

    let tokens = Arc::new(TokenValidator::new(TokenConfig::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = LiveQueryServer::new(
        WebSocketConfig::default(),
        Arc::clone(&dispatcher),
        Arc::clone(&tokens),
    );
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    TestServer {
        addr,
        dispatcher,
        feed: feed_handle,
        tokens,
    }
}

async fn connect(addr: SocketAddr) -> ClientStream {
    let (stream, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    stream
}

/// Next JSON text frame, skipping protocol pings/pongs
async fn next_message(stream: &mut ClientStream) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout(deadline, stream.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed unexpectedly")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(stream: &mut ClientStream, message: Value) {
    stream
        .send(Message::Text(message.to_string()))
        .await
        .unwrap();
}

// =============================================================================
// Connection and subscription flow
// =============================================================================

#[tokio::test]
async fn test_connect_subscribe_receive() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;

    let connected = next_message(&mut client).await;
    assert_eq!(connected["type"], "connected");
    assert!(connected["connection_id"].is_string());

    send(
        &mut client,
        json!({
            "type": "subscribe",
            "id": "s1",
            "class_name": "tasks",
            "query": {"status": "open"}
        }),
    )
    .await;
    let subscribed = next_message(&mut client).await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["id"], "s1");

    server
        .feed
        .publish_create(
            "tasks",
            "t1",
            json!({"id": "t1", "status": "open"}),
            AccessRule::public(),
        )
        .await;

    let event = next_message(&mut client).await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["subscription_id"], "s1");
    assert_eq!(event["kind"], "created");
    assert_eq!(event["object"]["id"], "t1");
}

#[tokio::test]
async fn test_unsubscribe_stops_events() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;
    next_message(&mut client).await; // connected

    send(
        &mut client,
        json!({"type": "subscribe", "id": "s1", "class_name": "tasks"}),
    )
    .await;
    next_message(&mut client).await; // subscribed

    send(&mut client, json!({"type": "unsubscribe", "id": "s1"})).await;
    let unsubscribed = next_message(&mut client).await;
    assert_eq!(unsubscribed["type"], "unsubscribed");

    server
        .feed
        .publish_create("tasks", "t1", json!({"id": "t1"}), AccessRule::public())
        .await;

    // Heartbeat round-trip proves no event frame was queued in between
    send(&mut client, json!({"type": "heartbeat", "ref_id": "hb1"})).await;
    let reply = next_message(&mut client).await;
    assert_eq!(reply["type"], "heartbeat");
    assert_eq!(reply["ref_id"], "hb1");
}

#[tokio::test]
async fn test_malformed_query_rejected_on_wire() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;
    next_message(&mut client).await; // connected

    send(
        &mut client,
        json!({
            "type": "subscribe",
            "id": "s1",
            "class_name": "tasks",
            "query": {"status": {"wobbles": 1}}
        }),
    )
    .await;

    let error = next_message(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "MALFORMED_QUERY");

    // The connection survives a rejected subscribe
    send(&mut client, json!({"type": "heartbeat"})).await;
    assert_eq!(next_message(&mut client).await["type"], "heartbeat");
}

#[tokio::test]
async fn test_invalid_json_reported() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;
    next_message(&mut client).await; // connected

    client
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    let error = next_message(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "INVALID_MESSAGE");
}

// =============================================================================
// Authentication on the wire
// =============================================================================

#[tokio::test]
async fn test_auth_unlocks_gated_class() {
    let server = start_server().await;
    server
        .dispatcher
        .set_class_policy("audit_log", ClassPolicy::Authenticated);

    let mut client = connect(server.addr).await;
    next_message(&mut client).await; // connected

    // Anonymous subscribe to the gated class is rejected
    send(
        &mut client,
        json!({"type": "subscribe", "id": "s1", "class_name": "audit_log"}),
    )
    .await;
    let rejected = next_message(&mut client).await;
    assert_eq!(rejected["type"], "error");
    assert_eq!(rejected["code"], "AUTHENTICATION_REQUIRED");

    // Authenticate, then the same subscribe succeeds
    let principal = Uuid::new_v4();
    let token = server.tokens.issue(principal).unwrap();
    send(&mut client, json!({"type": "auth", "token": token})).await;
    let authed = next_message(&mut client).await;
    assert_eq!(authed["type"], "authenticated");
    assert_eq!(authed["principal"], principal.to_string());

    send(
        &mut client,
        json!({"type": "subscribe", "id": "s1", "class_name": "audit_log"}),
    )
    .await;
    assert_eq!(next_message(&mut client).await["type"], "subscribed");
}

#[tokio::test]
async fn test_bad_token_rejected() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;
    next_message(&mut client).await; // connected

    send(&mut client, json!({"type": "auth", "token": "garbage"})).await;
    let error = next_message(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "AUTH_FAILED");
}

// =============================================================================
// Authorization end to end
// =============================================================================

#[tokio::test]
async fn test_owner_only_object_invisible_to_stranger() {
    let server = start_server().await;

    let owner = Uuid::new_v4();
    let mut owner_client = connect(server.addr).await;
    next_message(&mut owner_client).await;
    let token = server.tokens.issue(owner).unwrap();
    send(&mut owner_client, json!({"type": "auth", "token": token})).await;
    next_message(&mut owner_client).await;

    let mut stranger_client = connect(server.addr).await;
    next_message(&mut stranger_client).await;

    for client in [&mut owner_client, &mut stranger_client] {
        send(
            client,
            json!({"type": "subscribe", "id": "s1", "class_name": "tasks"}),
        )
        .await;
        next_message(client).await;
    }

    server
        .feed
        .publish_create(
            "tasks",
            "t1",
            json!({"id": "t1"}),
            AccessRule::owned_by(owner),
        )
        .await;

    let delivered = next_message(&mut owner_client).await;
    assert_eq!(delivered["type"], "event");
    assert_eq!(delivered["object"]["id"], "t1");

    // The stranger sees only its own heartbeat reply
    send(
        &mut stranger_client,
        json!({"type": "heartbeat", "ref_id": "hb"}),
    )
    .await;
    assert_eq!(next_message(&mut stranger_client).await["type"], "heartbeat");
}
