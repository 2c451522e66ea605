//! # Sessions and Role Resolution
//!
//! The session context carried by each connection, and the identity
//! collaborator that resolves a principal's current roles.
//!
//! Roles are never cached on the subscription: the dispatcher asks the
//! resolver again on every event that needs them, so a revoked grant stops
//! delivery at the next event rather than lingering until re-subscribe.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::errors::EvaluationError;

/// Authentication context of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// The authenticated principal (None if anonymous)
    pub principal: Option<Uuid>,

    /// Whether the session is authenticated
    pub authenticated: bool,

    /// Backend-internal sessions bypass per-object visibility
    service: bool,
}

impl SessionContext {
    /// Session for an authenticated principal
    pub fn authenticated(principal: Uuid) -> Self {
        Self {
            principal: Some(principal),
            authenticated: true,
            service: false,
        }
    }

    /// Anonymous session
    pub fn anonymous() -> Self {
        Self {
            principal: None,
            authenticated: false,
            service: false,
        }
    }

    /// Backend-internal session; sees every object
    pub fn service() -> Self {
        Self {
            principal: None,
            authenticated: true,
            service: true,
        }
    }

    pub fn is_service(&self) -> bool {
        self.service
    }
}

/// Identity collaborator: resolves a principal's current role set.
///
/// Called fresh on every evaluation that needs roles; a lookup may suspend
/// (external identity service) and may fail, in which case the evaluation
/// for that one (event, subscription) pair is skipped.
#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve(&self, principal: Uuid) -> Result<HashSet<String>, EvaluationError>;
}

/// In-memory role store.
///
/// Serves the server binary and tests; a deployment would put its identity
/// provider behind the same trait.
#[derive(Debug, Default)]
pub struct InMemoryRoleStore {
    grants: DashMap<Uuid, HashSet<String>>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a role to a principal
    pub fn grant(&self, principal: Uuid, role: &str) {
        self.grants
            .entry(principal)
            .or_default()
            .insert(role.to_string());
    }

    /// Revoke a role from a principal. Takes effect on the next event.
    pub fn revoke(&self, principal: Uuid, role: &str) {
        if let Some(mut roles) = self.grants.get_mut(&principal) {
            roles.remove(role);
        }
    }
}

#[async_trait]
impl RoleResolver for InMemoryRoleStore {
    async fn resolve(&self, principal: Uuid) -> Result<HashSet<String>, EvaluationError> {
        Ok(self
            .grants
            .get(&principal)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}
