//! Live query metrics.
//!
//! Counters only, monotonic, reset on process start. Atomic with Relaxed
//! ordering: metrics tolerate eventual consistency, dispatch does not pay
//! for stronger ordering.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters for the live query engine
#[derive(Debug, Default)]
pub struct LiveQueryMetrics {
    /// Mutation events consumed from the feed
    events_dispatched: AtomicU64,
    /// (event, subscription) pairs evaluated
    pairs_evaluated: AtomicU64,
    /// Notifications enqueued to subscribers
    notifications_delivered: AtomicU64,
    /// Notifications suppressed by the authorization filter
    notifications_suppressed: AtomicU64,
    /// Isolated matcher/filter failures
    evaluation_errors: AtomicU64,
    /// Connections force-closed on queue overflow
    overflow_closes: AtomicU64,
    /// Connections opened
    connections_opened: AtomicU64,
    /// Connections closed (any reason)
    connections_closed: AtomicU64,
    /// Subscriptions that reached Active
    subscriptions_opened: AtomicU64,
    /// Subscriptions closed (unsubscribe, replace, or disconnect)
    subscriptions_closed: AtomicU64,
    /// Subscribe requests rejected before Active
    subscriptions_rejected: AtomicU64,
}

impl LiveQueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_events_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pairs_evaluated(&self, count: u64) {
        self.pairs_evaluated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_notifications_delivered(&self) {
        self.notifications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_notifications_suppressed(&self) {
        self.notifications_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_evaluation_errors(&self) {
        self.evaluation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_overflow_closes(&self) {
        self.overflow_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_subscriptions_opened(&self) {
        self.subscriptions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_subscriptions_closed(&self, count: u64) {
        self.subscriptions_closed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_subscriptions_rejected(&self) {
        self.subscriptions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Getters

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    pub fn pairs_evaluated(&self) -> u64 {
        self.pairs_evaluated.load(Ordering::Relaxed)
    }

    pub fn notifications_delivered(&self) -> u64 {
        self.notifications_delivered.load(Ordering::Relaxed)
    }

    pub fn notifications_suppressed(&self) -> u64 {
        self.notifications_suppressed.load(Ordering::Relaxed)
    }

    pub fn evaluation_errors(&self) -> u64 {
        self.evaluation_errors.load(Ordering::Relaxed)
    }

    pub fn overflow_closes(&self) -> u64 {
        self.overflow_closes.load(Ordering::Relaxed)
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    pub fn subscriptions_opened(&self) -> u64 {
        self.subscriptions_opened.load(Ordering::Relaxed)
    }

    pub fn subscriptions_closed(&self) -> u64 {
        self.subscriptions_closed.load(Ordering::Relaxed)
    }

    pub fn subscriptions_rejected(&self) -> u64 {
        self.subscriptions_rejected.load(Ordering::Relaxed)
    }
}
