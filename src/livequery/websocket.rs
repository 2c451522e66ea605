//! # WebSocket Transport
//!
//! Network layer for live query connections, on top of the dispatcher.
//!
//! The transport owns framing, keepalive pings, and the mapping from wire
//! messages to dispatcher operations. It is deliberately thin: every
//! subscribe/unsubscribe decision, all matching, and all authorization
//! live in the dispatcher, so the transport can be swapped without touching
//! engine semantics.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::auth::TokenValidator;
use crate::observability::Logger;

use super::connection::ConnectionHandle;
use super::dispatcher::{Dispatcher, SubscribeRequest};
use super::errors::{LiveQueryError, LiveQueryResult};
use super::event::{Notification, NotificationKind};
use super::session::SessionContext;

/// WebSocket server configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Bind address
    pub bind_addr: String,

    /// Keepalive ping interval in seconds
    pub ping_interval_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".to_string(),
            ping_interval_secs: 10,
        }
    }
}

/// Message from client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present a session token
    Auth { token: String },

    /// Register a standing query
    Subscribe {
        id: String,
        class_name: String,
        #[serde(default)]
        query: Value,
        #[serde(default)]
        fields: Option<Vec<String>>,
        #[serde(default)]
        events: Option<Vec<NotificationKind>>,
    },

    /// Drop a standing query
    Unsubscribe { id: String },

    /// Application-level heartbeat
    Heartbeat {
        #[serde(default)]
        ref_id: Option<String>,
    },
}

/// Message to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Connected { connection_id: String },

    /// Session token accepted
    Authenticated { principal: String },

    /// Subscription is active
    Subscribed { id: String },

    /// Subscription removed
    Unsubscribed { id: String },

    /// A live query event
    Event {
        subscription_id: String,
        class_name: String,
        kind: NotificationKind,
        object: Value,
        sequence: u64,
    },

    /// Heartbeat response
    Heartbeat {
        ref_id: Option<String>,
        server_time: i64,
    },

    /// Error reply; `code` is stable, `message` is informational
    Error { code: String, message: String },
}

impl ServerMessage {
    fn event(notification: Notification) -> Self {
        ServerMessage::Event {
            subscription_id: notification.subscription_id,
            class_name: notification.class_name,
            kind: notification.kind,
            object: notification.object,
            sequence: notification.sequence,
        }
    }

    fn error(error: &LiveQueryError) -> Self {
        ServerMessage::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// WebSocket server for live query connections
pub struct LiveQueryServer {
    config: WebSocketConfig,
    dispatcher: Arc<Dispatcher>,
    tokens: Arc<TokenValidator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LiveQueryServer {
    pub fn new(
        config: WebSocketConfig,
        dispatcher: Arc<Dispatcher>,
        tokens: Arc<TokenValidator>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            dispatcher,
            tokens,
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> LiveQueryResult<()> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| LiveQueryError::ConfigError(format!("invalid bind address: {}", e)))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| LiveQueryError::ConfigError(format!("failed to bind: {}", e)))?;

        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    pub async fn serve(&self, listener: TcpListener) -> LiveQueryResult<()> {
        if let Ok(addr) = listener.local_addr() {
            Logger::info("LIVEQUERY_LISTENING", &[("addr", &addr.to_string())]);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let tokens = Arc::clone(&self.tokens);
                            let config = self.config.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream, peer_addr, dispatcher, tokens, config,
                                )
                                .await
                                {
                                    Logger::warn(
                                        "WEBSOCKET_SESSION_ENDED",
                                        &[
                                            ("peer", &peer_addr.to_string()),
                                            ("reason", &e.to_string()),
                                        ],
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            Logger::warn("ACCEPT_FAILED", &[("reason", &e.to_string())]);
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    Logger::info("LIVEQUERY_SHUTDOWN", &[]);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Signal the accept loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        tokens: Arc<TokenValidator>,
        config: WebSocketConfig,
    ) -> LiveQueryResult<()> {
        let ws_stream = accept_async(stream).await.map_err(|e| {
            LiveQueryError::Internal(format!("WebSocket handshake failed: {}", e))
        })?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let ConnectionHandle {
            connection,
            mut events,
            mut closed,
        } = dispatcher.connect(SessionContext::anonymous());
        let connection_id = connection.id();

        Logger::info(
            "WEBSOCKET_CONNECTED",
            &[
                ("connection", &connection_id.to_string()),
                ("peer", &peer_addr.to_string()),
            ],
        );

        let reply = ServerMessage::Connected {
            connection_id: connection_id.to_string(),
        };
        let _ = Self::send(&mut ws_sender, &reply).await;

        let mut ping_timer = tokio::time::interval(std::time::Duration::from_secs(
            config.ping_interval_secs.max(1),
        ));
        ping_timer.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let reply = match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(message) => {
                                    Self::process(&dispatcher, &tokens, &connection, message).await
                                }
                                Err(e) => ServerMessage::error(&LiveQueryError::InvalidMessage(
                                    e.to_string(),
                                )),
                            };
                            if Self::send(&mut ws_sender, &reply).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let reply = ServerMessage::error(&LiveQueryError::InvalidMessage(
                                "binary frames not supported".to_string(),
                            ));
                            if Self::send(&mut ws_sender, &reply).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws_sender.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }

                outbound = events.recv() => {
                    match outbound {
                        Some(notification) => {
                            let message = ServerMessage::event(notification);
                            if Self::send(&mut ws_sender, &message).await.is_err() {
                                break;
                            }
                        }
                        // Engine dropped the queue: connection is gone
                        None => break,
                    }
                }

                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break;
                    }
                }

                _ = ping_timer.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        dispatcher.disconnect(connection_id);
        let _ = ws_sender.send(Message::Close(None)).await;
        Ok(())
    }

    /// Map one client message to a dispatcher operation and build the reply
    async fn process(
        dispatcher: &Arc<Dispatcher>,
        tokens: &Arc<TokenValidator>,
        connection: &Arc<super::connection::Connection>,
        message: ClientMessage,
    ) -> ServerMessage {
        match message {
            ClientMessage::Auth { token } => match tokens.validate(&token) {
                Ok(session) => {
                    let principal = session
                        .principal
                        .map(|p| p.to_string())
                        .unwrap_or_default();
                    connection.set_session(session);
                    ServerMessage::Authenticated { principal }
                }
                Err(e) => ServerMessage::error(&LiveQueryError::AuthError(e.to_string())),
            },

            ClientMessage::Subscribe {
                id,
                class_name,
                query,
                fields,
                events,
            } => {
                let request = SubscribeRequest {
                    id: id.clone(),
                    class_name,
                    query,
                    fields,
                    events,
                };
                match dispatcher.subscribe(connection, request).await {
                    Ok(()) => ServerMessage::Subscribed { id },
                    Err(e) => ServerMessage::error(&e),
                }
            }

            ClientMessage::Unsubscribe { id } => {
                match dispatcher.unsubscribe(connection.id(), &id) {
                    Ok(()) => ServerMessage::Unsubscribed { id },
                    Err(e) => ServerMessage::error(&e),
                }
            }

            ClientMessage::Heartbeat { ref_id } => ServerMessage::Heartbeat {
                ref_id,
                server_time: chrono::Utc::now().timestamp(),
            },
        }
    }

    async fn send(
        sender: &mut (impl SinkExt<Message> + Unpin),
        message: &ServerMessage,
    ) -> Result<(), ()> {
        let json = serde_json::to_string(message).map_err(|_| ())?;
        sender.send(Message::Text(json)).await.map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.ping_interval_secs, 10);
    }

    #[test]
    fn test_subscribe_message_parses() {
        let json = r#"{
            "type": "subscribe",
            "id": "s1",
            "class_name": "tasks",
            "query": {"status": "open"},
            "events": ["created", "left"]
        }"#;
        let message: ClientMessage = serde_json::from_str(json).unwrap();

        match message {
            ClientMessage::Subscribe {
                id,
                class_name,
                query,
                events,
                ..
            } => {
                assert_eq!(id, "s1");
                assert_eq!(class_name, "tasks");
                assert_eq!(query["status"], "open");
                assert_eq!(
                    events.unwrap(),
                    vec![NotificationKind::Created, NotificationKind::Left]
                );
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_subscribe_defaults_query_and_fields() {
        let json = r#"{"type": "subscribe", "id": "s1", "class_name": "tasks"}"#;
        let message: ClientMessage = serde_json::from_str(json).unwrap();

        match message {
            ClientMessage::Subscribe { query, fields, .. } => {
                assert!(query.is_null());
                assert!(fields.is_none());
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_event_message_serializes() {
        let message = ServerMessage::Event {
            subscription_id: "s1".to_string(),
            class_name: "tasks".to_string(),
            kind: NotificationKind::Entered,
            object: serde_json::json!({"id": "t1"}),
            sequence: 7,
        };

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"event\""));
        assert!(json.contains("\"kind\":\"entered\""));
        assert!(json.contains("\"sequence\":7"));
    }

    #[test]
    fn test_error_message_carries_stable_code() {
        let message = ServerMessage::error(&LiveQueryError::MalformedQuery("bad".to_string()));
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("MALFORMED_QUERY"));
    }
}
