//! # Live Queries
//!
//! Real-time subscription dispatch: standing client queries evaluated
//! against every committed mutation, with per-subscriber authorization and
//! per-connection ordered delivery.
//!
//! ## Architecture
//!
//! - **Query** / **Matcher**: constraint trees parsed at subscribe time,
//!   evaluated per event; updates classify as entered/left/updated
//! - **Acl**: per-object visibility and field redaction
//! - **Connection** / **Subscription**: registries the dispatcher reads,
//!   sharded, pruned synchronously on teardown
//! - **Dispatcher**: the fan-out core; isolates per-pair failures
//! - **Feed**: ordered mutation stream from storage
//! - **WebSocket**: the transport layer on top

pub mod acl;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod feed;
pub mod matcher;
pub mod query;
pub mod session;
pub mod subscription;
pub mod websocket;

pub use acl::{AccessRule, Projection};
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use dispatcher::{ClassPolicy, DispatchSummary, Dispatcher, SubscribeRequest};
pub use errors::{EvaluationError, LiveQueryError, LiveQueryResult};
pub use event::{MutationEvent, MutationKind, Notification, NotificationKind};
pub use feed::{feed, FeedConsumer, MutationFeed};
pub use matcher::{InMemoryRelationStore, QueryMatcher, RelationEvaluator};
pub use query::{ConstraintNode, GeoPoint};
pub use session::{InMemoryRoleStore, RoleResolver, SessionContext};
pub use subscription::{Subscription, SubscriptionState, SubscriptionTable};
pub use websocket::{ClientMessage, LiveQueryServer, ServerMessage, WebSocketConfig};
