//! # Mutation Events
//!
//! Event types flowing through the live query engine.
//!
//! A [`MutationEvent`] records one committed write (create/update/delete)
//! together with its pre- and post-mutation snapshots. It is transient:
//! consumed by the dispatcher and discarded, never persisted here.
//!
//! A [`Notification`] is what a subscriber actually receives — the event
//! re-classified against that subscription's query (an update can surface
//! as `entered` or `left`) with the snapshot redacted for that subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::acl::AccessRule;

/// Kind of committed write, as reported by the storage feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    /// New object created
    Create,
    /// Existing object updated
    Update,
    /// Object deleted
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Kind of notification delivered to a subscriber.
///
/// `Entered` and `Left` classify updates where the object newly starts or
/// stops satisfying the subscription's query; a transition always wins over
/// a plain `Updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Created,
    Updated,
    Deleted,
    Entered,
    Left,
}

impl NotificationKind {
    /// The full set, used when a subscription does not narrow event types
    pub fn all() -> [NotificationKind; 5] {
        [
            NotificationKind::Created,
            NotificationKind::Updated,
            NotificationKind::Deleted,
            NotificationKind::Entered,
            NotificationKind::Left,
        ]
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Created => write!(f, "created"),
            NotificationKind::Updated => write!(f, "updated"),
            NotificationKind::Deleted => write!(f, "deleted"),
            NotificationKind::Entered => write!(f, "entered"),
            NotificationKind::Left => write!(f, "left"),
        }
    }
}

/// One committed write, carried from the storage feed to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Feed sequence number, monotonically increasing per feed
    pub sequence: u64,

    /// Kind of write
    pub kind: MutationKind,

    /// Entity class the object belongs to
    pub class_name: String,

    /// Object id
    pub object_id: String,

    /// Post-mutation snapshot. For deletes, the final state of the object.
    pub current: Value,

    /// Pre-mutation snapshot, present for updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,

    /// Access rule attached to the object's snapshot
    pub access: AccessRule,

    /// Commit timestamp
    pub timestamp: DateTime<Utc>,
}

impl MutationEvent {
    /// Build a create event
    pub fn create(
        sequence: u64,
        class_name: String,
        object_id: String,
        snapshot: Value,
        access: AccessRule,
    ) -> Self {
        Self {
            sequence,
            kind: MutationKind::Create,
            class_name,
            object_id,
            current: snapshot,
            previous: None,
            access,
            timestamp: Utc::now(),
        }
    }

    /// Build an update event carrying both snapshots
    pub fn update(
        sequence: u64,
        class_name: String,
        object_id: String,
        previous: Value,
        current: Value,
        access: AccessRule,
    ) -> Self {
        Self {
            sequence,
            kind: MutationKind::Update,
            class_name,
            object_id,
            current,
            previous: Some(previous),
            access,
            timestamp: Utc::now(),
        }
    }

    /// Build a delete event. The snapshot is the object's final state.
    pub fn delete(
        sequence: u64,
        class_name: String,
        object_id: String,
        snapshot: Value,
        access: AccessRule,
    ) -> Self {
        Self {
            sequence,
            kind: MutationKind::Delete,
            class_name,
            object_id,
            current: snapshot,
            previous: None,
            access,
            timestamp: Utc::now(),
        }
    }
}

/// A classified, redacted event bound for one subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Client-chosen id of the subscription this event answers
    pub subscription_id: String,

    /// Entity class of the mutated object
    pub class_name: String,

    /// Classification for this subscriber
    pub kind: NotificationKind,

    /// Redacted snapshot
    pub object: Value,

    /// Feed sequence of the originating mutation
    pub sequence: u64,
}
