//! stratodb live query server binary.
//!
//! Wires the dispatch engine to the WebSocket transport. Configuration
//! comes from the environment: `STRATODB_BIND` for the listen address,
//! `STRATODB_TOKEN_SECRET` for the session token secret.

use std::sync::Arc;

use stratodb::auth::{TokenConfig, TokenValidator};
use stratodb::livequery::{
    feed, ConnectionRegistry, Dispatcher, InMemoryRelationStore, InMemoryRoleStore,
    LiveQueryServer, SubscriptionTable, WebSocketConfig,
};
use stratodb::observability::Logger;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 100;
const FEED_BUFFER: usize = 1024;

#[tokio::main]
async fn main() {
    let mut ws_config = WebSocketConfig::default();
    if let Ok(bind_addr) = std::env::var("STRATODB_BIND") {
        ws_config.bind_addr = bind_addr;
    }

    let mut token_config = TokenConfig::default();
    if let Ok(secret) = std::env::var("STRATODB_TOKEN_SECRET") {
        token_config.secret = secret;
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(ConnectionRegistry::new(OUTBOUND_QUEUE_CAPACITY)),
        Arc::new(SubscriptionTable::new(MAX_SUBSCRIPTIONS_PER_CONNECTION)),
        Arc::new(InMemoryRoleStore::new()),
        Arc::new(InMemoryRelationStore::new()),
    ));

    let (_feed, consumer) = feed(FEED_BUFFER);
    tokio::spawn(consumer.run(Arc::clone(&dispatcher)));

    let server = LiveQueryServer::new(
        ws_config,
        dispatcher,
        Arc::new(TokenValidator::new(token_config)),
    );

    if let Err(e) = server.run().await {
        Logger::error("SERVER_FAILED", &[("reason", &e.to_string())]);
        std::process::exit(1);
    }
}
