//! # Subscriptions
//!
//! Subscription records, their lifecycle, and the shared table the
//! dispatcher reads.
//!
//! ## Lifecycle
//!
//! `Pending` (subscribe received) → `Active` (class precheck passed) →
//! `Closed` (unsubscribed or connection gone; terminal). Closed is checked
//! again at send time, so an in-flight evaluation for a just-closed
//! subscription completes and discards its send.
//!
//! The table is indexed three ways: by (connection, id) for ownership, by
//! class name for event routing, and by connection for teardown. All three
//! indexes are pruned synchronously on removal to bound memory. The maps are
//! sharded; there is no global table lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::acl::Projection;
use super::connection::ConnectionId;
use super::errors::{LiveQueryError, LiveQueryResult};
use super::event::NotificationKind;
use super::query::ConstraintNode;

const STATE_PENDING: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Closed,
}

/// A standing client query
#[derive(Debug)]
pub struct Subscription {
    /// Client-chosen id, unique within the owning connection
    pub id: String,

    /// Owning connection
    pub connection_id: ConnectionId,

    /// Entity class the query targets
    pub class_name: String,

    /// Parsed constraint tree
    pub constraints: ConstraintNode,

    /// Requested output fields
    pub projection: Projection,

    /// Event kinds the client asked for
    events: HashSet<NotificationKind>,

    state: AtomicU8,

    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a subscription in `Pending` state. `events` of `None`
    /// subscribes to every kind.
    pub fn new(
        connection_id: ConnectionId,
        id: String,
        class_name: String,
        constraints: ConstraintNode,
        projection: Projection,
        events: Option<Vec<NotificationKind>>,
    ) -> Self {
        let events = match events {
            None => NotificationKind::all().into_iter().collect(),
            Some(kinds) => kinds.into_iter().collect(),
        };

        Self {
            id,
            connection_id,
            class_name,
            constraints,
            projection,
            events,
            state: AtomicU8::new(STATE_PENDING),
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        match self.state.load(Ordering::Acquire) {
            STATE_PENDING => SubscriptionState::Pending,
            STATE_ACTIVE => SubscriptionState::Active,
            _ => SubscriptionState::Closed,
        }
    }

    /// Pending → Active. Returns false if the subscription was already
    /// closed (or already active).
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_PENDING,
                STATE_ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Terminal transition. Idempotent.
    pub fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_ACTIVE
    }

    /// Whether the client asked for this notification kind
    pub fn wants(&self, kind: NotificationKind) -> bool {
        self.events.contains(&kind)
    }
}

type SubscriptionKey = (ConnectionId, String);

/// The shared subscription table.
///
/// Reads during dispatch and writes for different connections proceed
/// concurrently; writes for one connection are serialized by its transport
/// task, which is the only mutator of that connection's entries.
#[derive(Debug)]
pub struct SubscriptionTable {
    subscriptions: DashMap<SubscriptionKey, Arc<Subscription>>,
    by_class: DashMap<String, HashSet<SubscriptionKey>>,
    by_connection: DashMap<ConnectionId, HashSet<String>>,
    max_per_connection: usize,
}

impl SubscriptionTable {
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            subscriptions: DashMap::new(),
            by_class: DashMap::new(),
            by_connection: DashMap::new(),
            max_per_connection,
        }
    }

    /// Insert a subscription, replacing any prior one under the same
    /// (connection, id). The replaced subscription is closed so in-flight
    /// dispatch against it discards its send — re-subscribing never causes
    /// duplicate delivery.
    pub fn insert(&self, subscription: Arc<Subscription>) -> LiveQueryResult<()> {
        let key = (subscription.connection_id, subscription.id.clone());

        if !self.subscriptions.contains_key(&key) {
            let count = self
                .by_connection
                .get(&subscription.connection_id)
                .map(|ids| ids.len())
                .unwrap_or(0);
            if count >= self.max_per_connection {
                return Err(LiveQueryError::TooManySubscriptions(
                    self.max_per_connection,
                ));
            }
        }

        let replaced = self
            .subscriptions
            .insert(key.clone(), Arc::clone(&subscription));

        if let Some(old) = replaced {
            old.close();
            if old.class_name != subscription.class_name {
                if let Some(mut keys) = self.by_class.get_mut(&old.class_name) {
                    keys.remove(&key);
                }
            }
        }

        self.by_class
            .entry(subscription.class_name.clone())
            .or_default()
            .insert(key.clone());
        self.by_connection
            .entry(subscription.connection_id)
            .or_default()
            .insert(subscription.id.clone());

        Ok(())
    }

    /// Remove one subscription, pruning every index synchronously
    pub fn remove(&self, connection_id: ConnectionId, id: &str) -> LiveQueryResult<()> {
        let key = (connection_id, id.to_string());

        let Some((_, subscription)) = self.subscriptions.remove(&key) else {
            return Err(LiveQueryError::SubscriptionNotFound(id.to_string()));
        };
        subscription.close();

        if let Some(mut keys) = self.by_class.get_mut(&subscription.class_name) {
            keys.remove(&key);
            let drained = keys.is_empty();
            drop(keys);
            if drained {
                self.by_class
                    .remove_if(&subscription.class_name, |_, keys| keys.is_empty());
            }
        }

        if let Some(mut ids) = self.by_connection.get_mut(&connection_id) {
            ids.remove(id);
        }

        Ok(())
    }

    /// Remove every subscription owned by a connection. Returns how many
    /// were removed.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> usize {
        let Some((_, ids)) = self.by_connection.remove(&connection_id) else {
            return 0;
        };

        let mut removed = 0;
        for id in ids {
            let key = (connection_id, id);
            if let Some((_, subscription)) = self.subscriptions.remove(&key) {
                subscription.close();
                if let Some(mut keys) = self.by_class.get_mut(&subscription.class_name) {
                    keys.remove(&key);
                }
                removed += 1;
            }
        }
        removed
    }

    /// Active subscriptions that target a class. This is the event-routing
    /// read: a class-name index lookup, not a scan of the whole table.
    pub fn candidates(&self, class_name: &str) -> Vec<Arc<Subscription>> {
        let keys: Vec<SubscriptionKey> = match self.by_class.get(class_name) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Vec::new(),
        };

        keys.iter()
            .filter_map(|key| self.subscriptions.get(key).map(|s| Arc::clone(&s)))
            .filter(|s| s.is_active())
            .collect()
    }

    /// Look up one subscription
    pub fn get(&self, connection_id: ConnectionId, id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions
            .get(&(connection_id, id.to_string()))
            .map(|s| Arc::clone(&s))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
