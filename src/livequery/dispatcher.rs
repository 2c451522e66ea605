//! # Event Dispatcher
//!
//! Fans each committed mutation out to every subscription whose query
//! matches and whose subscriber may see the object.
//!
//! One dispatch call processes one mutation event: candidates come from the
//! class-name index, every (event, subscription) pair is evaluated
//! concurrently (a suspending related-subquery or role lookup on one pair
//! never delays the others), and the surviving notifications are enqueued in
//! stable candidate order. The caller awaits each dispatch before feeding
//! the next event, which is what gives every connection feed-order delivery.
//!
//! Failures are isolated per pair: logged, counted, treated as no-match.
//! A full outbound queue force-closes that one connection and nothing else.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;

use crate::observability::{LiveQueryMetrics, Logger};

use super::acl::{self, Projection, Visibility};
use super::connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionId, ConnectionRegistry, PushError,
};
use super::errors::{EvaluationError, LiveQueryError, LiveQueryResult};
use super::event::{MutationEvent, Notification, NotificationKind};
use super::matcher::{QueryMatcher, RelationEvaluator};
use super::query::ConstraintNode;
use super::session::{RoleResolver, SessionContext};
use super::subscription::{Subscription, SubscriptionTable};

/// Who may subscribe to a class. Checked once, at subscribe time.
#[derive(Debug, Clone)]
pub enum ClassPolicy {
    /// Anyone, including anonymous sessions
    Open,
    /// Any authenticated session
    Authenticated,
    /// Sessions holding at least one of these roles
    RoleGated(HashSet<String>),
}

/// A subscribe message, as handed over by the transport
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Client-chosen subscription id
    pub id: String,
    /// Entity class to watch
    pub class_name: String,
    /// Query constraints as a JSON document
    pub query: Value,
    /// Requested output fields (None = all)
    pub fields: Option<Vec<String>>,
    /// Requested event kinds (None = all)
    pub events: Option<Vec<NotificationKind>>,
}

/// Outcome counts for one dispatched event
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Subscriptions the class index yielded
    pub candidates: usize,
    /// Notifications enqueued
    pub delivered: usize,
    /// Pairs suppressed by the authorization filter
    pub suppressed: usize,
    /// Pairs skipped on an isolated evaluation failure
    pub errors: usize,
    /// Connections force-closed on queue overflow
    pub overflowed: usize,
}

enum PairOutcome {
    /// No match, unwanted kind, or connection already gone
    Skip,
    /// Query matched but the subscriber may not see the object
    Suppressed,
    /// Isolated evaluation failure
    Error(EvaluationError),
    /// Enqueue this notification
    Deliver(Notification),
}

/// The live query dispatch engine
pub struct Dispatcher {
    connections: Arc<ConnectionRegistry>,
    table: Arc<SubscriptionTable>,
    roles: Arc<dyn RoleResolver>,
    relations: Arc<dyn RelationEvaluator>,
    policies: DashMap<String, ClassPolicy>,
    metrics: Arc<LiveQueryMetrics>,
}

impl Dispatcher {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        table: Arc<SubscriptionTable>,
        roles: Arc<dyn RoleResolver>,
        relations: Arc<dyn RelationEvaluator>,
    ) -> Self {
        Self {
            connections,
            table,
            roles,
            relations,
            policies: DashMap::new(),
            metrics: Arc::new(LiveQueryMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<LiveQueryMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Register the subscribe policy for a class. Unregistered classes are
    /// open.
    pub fn set_class_policy(&self, class_name: &str, policy: ClassPolicy) {
        self.policies.insert(class_name.to_string(), policy);
    }

    /// Open a connection with the given session context
    pub fn connect(&self, session: SessionContext) -> ConnectionHandle {
        let handle = self.connections.open(session);
        self.metrics.increment_connections_opened();
        let id = handle.connection.id().to_string();
        Logger::info("CONNECTION_OPENED", &[("connection", &id)]);
        handle
    }

    /// Register a subscription for a connection.
    ///
    /// The subscription is Pending until the class precheck passes, and is
    /// only ever dispatched to once Active. Subscribing again under the
    /// same id replaces the prior subscription.
    pub async fn subscribe(
        &self,
        connection: &Arc<Connection>,
        request: SubscribeRequest,
    ) -> LiveQueryResult<()> {
        let result = self.try_subscribe(connection, request).await;
        if result.is_err() {
            self.metrics.increment_subscriptions_rejected();
        }
        result
    }

    async fn try_subscribe(
        &self,
        connection: &Arc<Connection>,
        request: SubscribeRequest,
    ) -> LiveQueryResult<()> {
        // An omitted query subscribes to the whole class
        let constraints = if request.query.is_null() {
            ConstraintNode::And(Vec::new())
        } else {
            ConstraintNode::parse(&request.query)?
        };

        let subscription = Arc::new(Subscription::new(
            connection.id(),
            request.id,
            request.class_name,
            constraints,
            Projection::from_fields(request.fields),
            request.events,
        ));

        self.precheck_class(&subscription.class_name, &connection.session())
            .await?;
        subscription.activate();

        let id = subscription.id.clone();
        let class_name = subscription.class_name.clone();
        let replacing = self.table.get(connection.id(), &id).is_some();
        self.table.insert(subscription)?;

        if replacing {
            self.metrics.add_subscriptions_closed(1);
        }
        self.metrics.increment_subscriptions_opened();
        Logger::info(
            "SUBSCRIBED",
            &[
                ("class", &class_name),
                ("connection", &connection.id().to_string()),
                ("subscription", &id),
            ],
        );
        Ok(())
    }

    async fn precheck_class(
        &self,
        class_name: &str,
        session: &SessionContext,
    ) -> LiveQueryResult<()> {
        let policy = self
            .policies
            .get(class_name)
            .map(|p| p.value().clone())
            .unwrap_or(ClassPolicy::Open);

        match policy {
            ClassPolicy::Open => Ok(()),

            ClassPolicy::Authenticated => {
                if session.authenticated {
                    Ok(())
                } else {
                    Err(LiveQueryError::AuthenticationRequired)
                }
            }

            ClassPolicy::RoleGated(required) => {
                if session.is_service() {
                    return Ok(());
                }
                let Some(principal) = session.principal else {
                    return Err(LiveQueryError::AuthenticationRequired);
                };
                let roles = self
                    .roles
                    .resolve(principal)
                    .await
                    .map_err(|e| LiveQueryError::Internal(e.to_string()))?;
                if required.is_disjoint(&roles) {
                    Err(LiveQueryError::SubscribeDenied(class_name.to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Drop one subscription. The table index is pruned synchronously.
    pub fn unsubscribe(&self, connection_id: ConnectionId, id: &str) -> LiveQueryResult<()> {
        self.table.remove(connection_id, id)?;
        self.metrics.add_subscriptions_closed(1);
        Logger::info(
            "UNSUBSCRIBED",
            &[
                ("connection", &connection_id.to_string()),
                ("subscription", id),
            ],
        );
        Ok(())
    }

    /// Tear down a connection and everything it owns. Idempotent; called on
    /// transport disconnect and on forced close.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let removed = self.connections.remove(connection_id);
        let closed_subscriptions = self.table.remove_connection(connection_id);

        if removed.is_some() {
            self.metrics.increment_connections_closed();
            self.metrics
                .add_subscriptions_closed(closed_subscriptions as u64);
            Logger::info(
                "CONNECTION_CLOSED",
                &[
                    ("connection", &connection_id.to_string()),
                    ("subscriptions", &closed_subscriptions.to_string()),
                ],
            );
        }
    }

    fn force_close(&self, connection_id: ConnectionId, reason: CloseReason) {
        if reason == CloseReason::Overflow {
            self.metrics.increment_overflow_closes();
            Logger::warn(
                "CONNECTION_OVERFLOW",
                &[("connection", &connection_id.to_string())],
            );
        }
        self.disconnect(connection_id);
    }

    /// Fan one mutation event out to every eligible subscription.
    ///
    /// Events must be dispatched in feed order; per-connection delivery
    /// order follows from it.
    pub async fn dispatch(&self, event: &MutationEvent) -> DispatchSummary {
        self.metrics.increment_events_dispatched();

        let candidates = self.table.candidates(&event.class_name);
        self.metrics.add_pairs_evaluated(candidates.len() as u64);

        let mut summary = DispatchSummary {
            candidates: candidates.len(),
            ..DispatchSummary::default()
        };

        // Evaluate every pair concurrently; enqueue afterwards in stable
        // candidate order.
        let outcomes = join_all(
            candidates
                .iter()
                .map(|subscription| self.evaluate_pair(subscription, event)),
        )
        .await;

        for (subscription, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                PairOutcome::Skip => {}

                PairOutcome::Suppressed => {
                    summary.suppressed += 1;
                    self.metrics.increment_notifications_suppressed();
                }

                PairOutcome::Error(error) => {
                    summary.errors += 1;
                    self.metrics.increment_evaluation_errors();
                    Logger::error(
                        "EVALUATION_FAILED",
                        &[
                            ("class", &event.class_name),
                            ("connection", &subscription.connection_id.to_string()),
                            ("reason", &error.to_string()),
                            ("sequence", &event.sequence.to_string()),
                            ("subscription", &subscription.id),
                        ],
                    );
                }

                PairOutcome::Deliver(notification) => {
                    // A subscription closed while its evaluation was in
                    // flight completes here and discards the send.
                    if !subscription.is_active() {
                        continue;
                    }
                    let Some(connection) = self.connections.get(subscription.connection_id)
                    else {
                        continue;
                    };

                    match connection.try_push(notification) {
                        Ok(()) => {
                            summary.delivered += 1;
                            self.metrics.increment_notifications_delivered();
                        }
                        Err(PushError::Closed) => {}
                        Err(PushError::Overflow) => {
                            summary.overflowed += 1;
                            self.force_close(subscription.connection_id, CloseReason::Overflow);
                        }
                    }
                }
            }
        }

        summary
    }

    async fn evaluate_pair(
        &self,
        subscription: &Arc<Subscription>,
        event: &MutationEvent,
    ) -> PairOutcome {
        let Some(connection) = self.connections.get(subscription.connection_id) else {
            return PairOutcome::Skip;
        };
        // Session is re-read per event so transport re-authentication and
        // expiry apply from the next event on.
        let session = connection.session();

        let matcher = QueryMatcher::new(self.relations.as_ref());
        let kind = match matcher.classify(event, &subscription.constraints).await {
            Err(error) => return PairOutcome::Error(error),
            Ok(None) => return PairOutcome::Skip,
            Ok(Some(kind)) => kind,
        };
        if !subscription.wants(kind) {
            return PairOutcome::Skip;
        }

        match acl::precheck(&event.access, &session) {
            Visibility::Visible => {}
            Visibility::Hidden => return PairOutcome::Suppressed,
            Visibility::NeedsRoles => {
                let Some(principal) = session.principal else {
                    return PairOutcome::Suppressed;
                };
                match self.roles.resolve(principal).await {
                    Err(error) => return PairOutcome::Error(error),
                    Ok(roles) => {
                        if !acl::visible_with_roles(&event.access, &roles) {
                            return PairOutcome::Suppressed;
                        }
                    }
                }
            }
        }

        let object = acl::project(&event.current, &event.access, &subscription.projection);
        PairOutcome::Deliver(Notification {
            subscription_id: subscription.id.clone(),
            class_name: event.class_name.clone(),
            kind,
            object,
            sequence: event.sequence,
        })
    }
}
