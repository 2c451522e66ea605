//! # Access Rules
//!
//! Per-object authorization metadata and the visibility filter applied on
//! every dispatch.
//!
//! A hidden subscriber receives no event at all for an object — never an
//! empty event. Field-level redaction strips protected fields before the
//! requested-field projection, even when the subscription asked for them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::session::SessionContext;

/// Per-object read/write permission data, attached to each snapshot.
///
/// Consulted by the dispatcher on every event; never mutated here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessRule {
    /// Owner principal, if the object has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Uuid>,

    /// World-readable flag
    #[serde(default)]
    pub public_read: bool,

    /// Roles granted read access
    #[serde(default)]
    pub read_roles: HashSet<String>,

    /// Roles granted write access
    #[serde(default)]
    pub write_roles: HashSet<String>,

    /// Field names that are write-only or restricted-read; always stripped
    /// from snapshots before delivery
    #[serde(default)]
    pub protected_fields: HashSet<String>,
}

impl AccessRule {
    /// World-readable rule with no owner
    pub fn public() -> Self {
        Self {
            public_read: true,
            ..Self::default()
        }
    }

    /// Rule readable only by the owning principal
    pub fn owned_by(owner: Uuid) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    pub fn with_read_role(mut self, role: &str) -> Self {
        self.read_roles.insert(role.to_string());
        self
    }

    pub fn with_write_role(mut self, role: &str) -> Self {
        self.write_roles.insert(role.to_string());
        self
    }

    pub fn with_protected_field(mut self, field: &str) -> Self {
        self.protected_fields.insert(field.to_string());
        self
    }
}

/// Outcome of the role-free visibility precheck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Decided visible without consulting the role resolver
    Visible,
    /// Decided hidden; no role grant could change the outcome
    Hidden,
    /// A role grant may apply; the subscriber's roles must be resolved
    NeedsRoles,
}

/// Decide visibility as far as possible without role resolution.
///
/// Public read, owner match, and service-role sessions are all decidable
/// from the rule and session alone. Anonymous sessions can never satisfy a
/// role grant, so they resolve to `Hidden` here rather than `NeedsRoles`.
pub fn precheck(rule: &AccessRule, session: &SessionContext) -> Visibility {
    if rule.public_read || session.is_service() {
        return Visibility::Visible;
    }

    if let (Some(owner), Some(principal)) = (rule.owner, session.principal) {
        if owner == principal {
            return Visibility::Visible;
        }
    }

    if session.principal.is_some() && !rule.read_roles.is_empty() {
        Visibility::NeedsRoles
    } else {
        Visibility::Hidden
    }
}

/// Final visibility decision once the subscriber's roles are known
pub fn visible_with_roles(rule: &AccessRule, roles: &HashSet<String>) -> bool {
    !rule.read_roles.is_disjoint(roles)
}

/// Requested output fields of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Deliver every (non-protected) field
    All,
    /// Deliver only the named fields
    Fields(HashSet<String>),
}

impl Projection {
    pub fn from_fields(fields: Option<Vec<String>>) -> Self {
        match fields {
            None => Projection::All,
            Some(list) => Projection::Fields(list.into_iter().collect()),
        }
    }
}

/// The object id key every snapshot carries; it survives projection so a
/// client can always correlate events.
const ID_FIELD: &str = "id";

/// Redact a snapshot for delivery to one subscriber.
///
/// Protected fields are stripped first, unconditionally. The requested-field
/// projection is applied afterwards, so requesting a protected field does
/// not resurrect it.
pub fn project(snapshot: &Value, rule: &AccessRule, projection: &Projection) -> Value {
    let Some(object) = snapshot.as_object() else {
        // Snapshots are objects; anything else passes through untouched.
        return snapshot.clone();
    };

    let mut redacted = serde_json::Map::with_capacity(object.len());
    for (key, value) in object {
        if rule.protected_fields.contains(key) {
            continue;
        }
        match projection {
            Projection::All => {
                redacted.insert(key.clone(), value.clone());
            }
            Projection::Fields(wanted) => {
                if key == ID_FIELD || wanted.contains(key) {
                    redacted.insert(key.clone(), value.clone());
                }
            }
        }
    }

    Value::Object(redacted)
}
