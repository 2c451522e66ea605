//! # Mutation Feed
//!
//! The ordered stream of committed writes the dispatcher consumes.
//!
//! The publishing side stamps every event with a monotonically increasing
//! sequence number at commit order. The consuming side dispatches strictly
//! one event at a time, in order — the feed is never acknowledged or
//! advanced out of order, which is what the per-connection ordering
//! guarantee rests on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use super::acl::AccessRule;
use super::dispatcher::Dispatcher;
use super::event::MutationEvent;

/// Publisher handle given to the storage layer
#[derive(Debug, Clone)]
pub struct MutationFeed {
    tx: mpsc::Sender<MutationEvent>,
    sequence: Arc<AtomicU64>,
}

/// Consumer side, pumped into the dispatcher
#[derive(Debug)]
pub struct FeedConsumer {
    rx: mpsc::Receiver<MutationEvent>,
}

/// Create a feed pair with the given buffer capacity.
///
/// The buffer absorbs bursts; a full buffer back-pressures the storage
/// publisher, never the other way around.
pub fn feed(capacity: usize) -> (MutationFeed, FeedConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        MutationFeed {
            tx,
            sequence: Arc::new(AtomicU64::new(1)),
        },
        FeedConsumer { rx },
    )
}

impl MutationFeed {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a committed create
    pub async fn publish_create(
        &self,
        class_name: &str,
        object_id: &str,
        snapshot: Value,
        access: AccessRule,
    ) -> MutationEvent {
        let event = MutationEvent::create(
            self.next_sequence(),
            class_name.to_string(),
            object_id.to_string(),
            snapshot,
            access,
        );
        let _ = self.tx.send(event.clone()).await;
        event
    }

    /// Publish a committed update with both snapshots
    pub async fn publish_update(
        &self,
        class_name: &str,
        object_id: &str,
        previous: Value,
        current: Value,
        access: AccessRule,
    ) -> MutationEvent {
        let event = MutationEvent::update(
            self.next_sequence(),
            class_name.to_string(),
            object_id.to_string(),
            previous,
            current,
            access,
        );
        let _ = self.tx.send(event.clone()).await;
        event
    }

    /// Publish a committed delete carrying the object's final state
    pub async fn publish_delete(
        &self,
        class_name: &str,
        object_id: &str,
        snapshot: Value,
        access: AccessRule,
    ) -> MutationEvent {
        let event = MutationEvent::delete(
            self.next_sequence(),
            class_name.to_string(),
            object_id.to_string(),
            snapshot,
            access,
        );
        let _ = self.tx.send(event.clone()).await;
        event
    }
}

impl FeedConsumer {
    /// Pump the feed into the dispatcher until every publisher is dropped.
    ///
    /// Each dispatch completes before the next event is taken; dispatch
    /// internally parallelizes across subscriptions, never across events.
    pub async fn run(mut self, dispatcher: Arc<Dispatcher>) {
        while let Some(event) = self.rx.recv().await {
            dispatcher.dispatch(&event).await;
        }
    }
}
