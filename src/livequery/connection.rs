//! # Connections
//!
//! Registry of live client connections and their outbound queues.
//!
//! Each connection owns a bounded, ordered outbound queue. Dispatch never
//! blocks on a slow consumer: enqueueing is non-blocking, and a queue at
//! capacity force-closes that one connection instead of back-pressuring the
//! dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::event::Notification;
use super::session::SessionContext;

/// Opaque connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Transport reported the peer gone
    ClientDisconnect,
    /// Outbound queue exceeded its bound
    Overflow,
    /// Server is shutting down
    ServerShutdown,
}

/// Failure to enqueue on a connection's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Connection already closed; the send is discarded silently
    Closed,
    /// Queue at capacity; the connection must be force-closed
    Overflow,
}

/// One live client connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    session: RwLock<SessionContext>,
    outbound: mpsc::Sender<Notification>,
    live: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current session context. Re-read on every dispatch so an auth change
    /// on the transport takes effect on the next event.
    pub fn session(&self) -> SessionContext {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the session context (transport authentication)
    pub fn set_session(&self, session: SessionContext) {
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Non-blocking enqueue. Never waits on the consumer.
    pub fn try_push(&self, notification: Notification) -> Result<(), PushError> {
        if !self.is_live() {
            return Err(PushError::Closed);
        }
        match self.outbound.try_send(notification) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Overflow),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Mark the connection closed and wake the transport. Idempotent.
    pub fn close(&self) {
        self.live.store(false, Ordering::Release);
        let _ = self.closed_tx.send(true);
    }
}

/// Transport-side handle for one connection: the queue consumer plus the
/// close signal
pub struct ConnectionHandle {
    pub connection: Arc<Connection>,
    /// Ordered outbound events; drained by the transport
    pub events: mpsc::Receiver<Notification>,
    /// Flips to true when the engine closes the connection
    pub closed: watch::Receiver<bool>,
}

/// Registry of live connections.
///
/// Sharded map: connects and disconnects on different connections proceed
/// concurrently, dispatch reads without a global lock.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            queue_capacity,
        }
    }

    /// Register a new connection with the given session context
    pub fn open(&self, session: SessionContext) -> ConnectionHandle {
        let (outbound, events) = mpsc::channel(self.queue_capacity);
        let (closed_tx, closed) = watch::channel(false);

        let connection = Arc::new(Connection {
            id: ConnectionId::new(),
            session: RwLock::new(session),
            outbound,
            live: AtomicBool::new(true),
            closed_tx,
        });

        self.connections.insert(connection.id, Arc::clone(&connection));

        ConnectionHandle {
            connection,
            events,
            closed,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| Arc::clone(&c))
    }

    /// Remove a connection, marking it closed. Idempotent.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, c)| c);
        if let Some(connection) = &removed {
            connection.close();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
