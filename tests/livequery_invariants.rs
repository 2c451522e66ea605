//! Live Query Dispatch Invariant Tests
//!
//! - An event is delivered to a subscription iff the query matches (or an
//!   entered/left transition applies) AND the subscriber may see the object
//! - Re-subscribing under the same id never causes duplicate delivery
//! - Per-object update order is preserved per connection
//! - Redaction always strips protected fields
//! - A closed connection receives nothing, ever again

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use stratodb::livequery::{
    AccessRule, ConnectionRegistry, Dispatcher, InMemoryRelationStore, InMemoryRoleStore,
    MutationEvent, NotificationKind, SessionContext, SubscribeRequest, SubscriptionTable,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn engine() -> (Arc<Dispatcher>, Arc<InMemoryRoleStore>) {
    let roles = Arc::new(InMemoryRoleStore::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(ConnectionRegistry::new(64)),
        Arc::new(SubscriptionTable::new(32)),
        Arc::clone(&roles) as Arc<dyn stratodb::livequery::RoleResolver>,
        Arc::new(InMemoryRelationStore::new()),
    ));
    (dispatcher, roles)
}

fn subscribe(id: &str, class_name: &str, query: Value) -> SubscribeRequest {
    SubscribeRequest {
        id: id.to_string(),
        class_name: class_name.to_string(),
        query,
        fields: None,
        events: None,
    }
}

fn create_event(sequence: u64, object: Value, access: AccessRule) -> MutationEvent {
    let object_id = object["id"].as_str().unwrap_or("x").to_string();
    MutationEvent::create(sequence, "tasks".to_string(), object_id, object, access)
}

fn update_event(sequence: u64, previous: Value, current: Value, access: AccessRule) -> MutationEvent {
    let object_id = current["id"].as_str().unwrap_or("x").to_string();
    MutationEvent::update(
        sequence,
        "tasks".to_string(),
        object_id,
        previous,
        current,
        access,
    )
}

// =============================================================================
// Delivery iff match AND visible
// =============================================================================

/// A matching, visible event is delivered; a non-matching one is not.
#[tokio::test]
async fn test_delivery_requires_query_match() {
    let (dispatcher, _) = engine();
    let mut handle = dispatcher.connect(SessionContext::anonymous());

    dispatcher
        .subscribe(
            &handle.connection,
            subscribe("s1", "tasks", json!({"status": "open"})),
        )
        .await
        .unwrap();

    dispatcher
        .dispatch(&create_event(
            1,
            json!({"id": "t1", "status": "open"}),
            AccessRule::public(),
        ))
        .await;
    dispatcher
        .dispatch(&create_event(
            2,
            json!({"id": "t2", "status": "closed"}),
            AccessRule::public(),
        ))
        .await;
    dispatcher
        .dispatch(&create_event(
            3,
            json!({"id": "t3", "status": "open"}),
            AccessRule::public(),
        ))
        .await;

    assert_eq!(handle.events.recv().await.unwrap().object["id"], "t1");
    // t2 was skipped entirely
    assert_eq!(handle.events.recv().await.unwrap().object["id"], "t3");
}

/// A matching event on an invisible object is suppressed, indistinguishable
/// from no match.
#[tokio::test]
async fn test_delivery_requires_visibility() {
    let (dispatcher, _) = engine();
    let subscriber = Uuid::new_v4();
    let mut handle = dispatcher.connect(SessionContext::authenticated(subscriber));

    dispatcher
        .subscribe(
            &handle.connection,
            subscribe("s1", "tasks", json!({"status": "open"})),
        )
        .await
        .unwrap();

    // Foreign, non-public object: matches the query, hidden by access rule
    dispatcher
        .dispatch(&create_event(
            1,
            json!({"id": "t1", "status": "open"}),
            AccessRule::owned_by(Uuid::new_v4()),
        ))
        .await;
    // Own object: delivered
    dispatcher
        .dispatch(&create_event(
            2,
            json!({"id": "t2", "status": "open"}),
            AccessRule::owned_by(subscriber),
        ))
        .await;

    let only = handle.events.recv().await.unwrap();
    assert_eq!(only.object["id"], "t2");
}

/// Event-type narrowing: a subscription that did not ask for `updated`
/// does not receive plain updates, but still receives transitions.
#[tokio::test]
async fn test_event_type_narrowing() {
    let (dispatcher, _) = engine();
    let mut handle = dispatcher.connect(SessionContext::anonymous());

    dispatcher
        .subscribe(
            &handle.connection,
            SubscribeRequest {
                events: Some(vec![NotificationKind::Entered, NotificationKind::Left]),
                ..subscribe("s1", "tasks", json!({"status": "open"}))
            },
        )
        .await
        .unwrap();

    // true→true: updated, not requested
    dispatcher
        .dispatch(&update_event(
            1,
            json!({"id": "t1", "status": "open", "p": 1}),
            json!({"id": "t1", "status": "open", "p": 2}),
            AccessRule::public(),
        ))
        .await;
    // false→true: entered, requested
    dispatcher
        .dispatch(&update_event(
            2,
            json!({"id": "t2", "status": "draft"}),
            json!({"id": "t2", "status": "open"}),
            AccessRule::public(),
        ))
        .await;

    let received = handle.events.recv().await.unwrap();
    assert_eq!(received.kind, NotificationKind::Entered);
    assert_eq!(received.sequence, 2);
}

// =============================================================================
// Re-subscribe idempotence
// =============================================================================

/// Subscribing twice under one id yields exactly one delivery per event.
#[tokio::test]
async fn test_resubscribe_is_idempotent() {
    let (dispatcher, _) = engine();
    let mut handle = dispatcher.connect(SessionContext::anonymous());

    for _ in 0..3 {
        dispatcher
            .subscribe(
                &handle.connection,
                subscribe("s1", "tasks", json!({"status": "open"})),
            )
            .await
            .unwrap();
    }

    let summary = dispatcher
        .dispatch(&create_event(
            1,
            json!({"id": "t1", "status": "open"}),
            AccessRule::public(),
        ))
        .await;

    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.delivered, 1);
    handle.events.recv().await.unwrap();
    assert!(handle.events.try_recv().is_err());
}

// =============================================================================
// Ordering
// =============================================================================

/// Two updates to the same object arrive in dispatch order.
#[tokio::test]
async fn test_same_object_updates_ordered() {
    let (dispatcher, _) = engine();
    let mut handle = dispatcher.connect(SessionContext::anonymous());

    dispatcher
        .subscribe(&handle.connection, subscribe("s1", "tasks", json!({})))
        .await
        .unwrap();

    dispatcher
        .dispatch(&update_event(
            1,
            json!({"id": "t1", "rev": 0}),
            json!({"id": "t1", "rev": 1}),
            AccessRule::public(),
        ))
        .await;
    dispatcher
        .dispatch(&update_event(
            2,
            json!({"id": "t1", "rev": 1}),
            json!({"id": "t1", "rev": 2}),
            AccessRule::public(),
        ))
        .await;

    let first = handle.events.recv().await.unwrap();
    let second = handle.events.recv().await.unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(first.object["rev"], 1);
    assert_eq!(second.sequence, 2);
    assert_eq!(second.object["rev"], 2);
}

// =============================================================================
// Redaction
// =============================================================================

/// Protected fields never reach a subscriber, requested or not.
#[tokio::test]
async fn test_redaction_always_strips_protected() {
    let (dispatcher, _) = engine();
    let mut wants_all = dispatcher.connect(SessionContext::anonymous());
    let mut wants_secret = dispatcher.connect(SessionContext::anonymous());

    dispatcher
        .subscribe(&wants_all.connection, subscribe("s1", "tasks", json!({})))
        .await
        .unwrap();
    dispatcher
        .subscribe(
            &wants_secret.connection,
            SubscribeRequest {
                fields: Some(vec!["a".to_string(), "b".to_string()]),
                ..subscribe("s1", "tasks", json!({}))
            },
        )
        .await
        .unwrap();

    let access = AccessRule::public().with_protected_field("b");
    dispatcher
        .dispatch(&create_event(
            1,
            json!({"id": "t1", "a": "visible", "b": "restricted"}),
            access,
        ))
        .await;

    let full = wants_all.events.recv().await.unwrap();
    assert_eq!(full.object["a"], "visible");
    assert!(full.object.get("b").is_none());

    let narrowed = wants_secret.events.recv().await.unwrap();
    assert_eq!(narrowed.object["a"], "visible");
    assert!(narrowed.object.get("b").is_none());
}

// =============================================================================
// Disconnect cleanup
// =============================================================================

/// Zero dispatches after a connection closes, even for events generated
/// immediately after.
#[tokio::test]
async fn test_disconnect_cleanup_is_immediate() {
    let (dispatcher, _) = engine();
    let handle = dispatcher.connect(SessionContext::anonymous());
    let connection_id = handle.connection.id();

    for i in 0..3 {
        dispatcher
            .subscribe(
                &handle.connection,
                subscribe(&format!("s{}", i), "tasks", json!({})),
            )
            .await
            .unwrap();
    }

    dispatcher.disconnect(connection_id);

    for sequence in 1..=5u64 {
        let summary = dispatcher
            .dispatch(&create_event(
                sequence,
                json!({"id": format!("t{}", sequence)}),
                AccessRule::public(),
            ))
            .await;
        assert_eq!(summary.candidates, 0);
        assert_eq!(summary.delivered, 0);
    }

    let metrics = dispatcher.metrics();
    assert_eq!(metrics.subscriptions_closed(), 3);
}

// =============================================================================
// Concrete scenario
// =============================================================================

/// Task walk-through: owner sees created then left; a foreign private task
/// produces nothing.
#[tokio::test]
async fn test_task_scenario() {
    let (dispatcher, _) = engine();
    let subscriber = Uuid::new_v4();
    let mut handle = dispatcher.connect(SessionContext::authenticated(subscriber));

    dispatcher
        .subscribe(
            &handle.connection,
            subscribe("tasks-open", "tasks", json!({"status": "open"})),
        )
        .await
        .unwrap();

    // T created (owner = subscriber, status open) → created
    dispatcher
        .dispatch(&create_event(
            1,
            json!({"id": "T", "status": "open"}),
            AccessRule::owned_by(subscriber),
        ))
        .await;
    let created = handle.events.recv().await.unwrap();
    assert_eq!(created.kind, NotificationKind::Created);
    assert_eq!(created.object["id"], "T");

    // T updated to closed → left, not updated
    dispatcher
        .dispatch(&update_event(
            2,
            json!({"id": "T", "status": "open"}),
            json!({"id": "T", "status": "closed"}),
            AccessRule::owned_by(subscriber),
        ))
        .await;
    let left = handle.events.recv().await.unwrap();
    assert_eq!(left.kind, NotificationKind::Left);

    // T2 created by someone else, not public → nothing
    let summary = dispatcher
        .dispatch(&create_event(
            3,
            json!({"id": "T2", "status": "open"}),
            AccessRule::owned_by(Uuid::new_v4()),
        ))
        .await;
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.suppressed, 1);
    assert!(handle.events.try_recv().is_err());
}
