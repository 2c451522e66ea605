//! # Query Matcher
//!
//! Decides whether a mutated object satisfies a subscription's constraint
//! tree, without touching storage. The one exception is the `related`
//! predicate, which delegates the subquery to the storage collaborator and
//! may suspend.
//!
//! Matching replicates the storage engine's semantics: strict comparisons
//! with no cross-type coercion, absent-field three-valued logic (absent is
//! never equal, fails `exists:true`, passes `exists:false`), and any-element
//! semantics for equality and `in` against array fields.
//!
//! For updates the matcher runs against both snapshots and classifies the
//! result: false→true is `entered`, true→false is `left`, true→true is
//! `updated`, false→false is no event. A transition always wins over a
//! plain `updated`.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use super::errors::EvaluationError;
use super::event::{MutationEvent, MutationKind, NotificationKind};
use super::query::{lookup_path, ConstraintNode, FieldPredicate, GeoPoint};

/// Mean Earth radius, for point-in-radius distance
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Storage collaborator: evaluates a subquery against one related object.
///
/// The query body is in the storage engine's own language; the matcher only
/// supplies it together with the related object id it found in the snapshot.
#[async_trait]
pub trait RelationEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        class_name: &str,
        query: &Value,
        related_object_id: &str,
    ) -> Result<bool, EvaluationError>;
}

/// Evaluates constraint trees against object snapshots
pub struct QueryMatcher<'a> {
    relations: &'a dyn RelationEvaluator,
}

impl<'a> QueryMatcher<'a> {
    pub fn new(relations: &'a dyn RelationEvaluator) -> Self {
        Self { relations }
    }

    /// Check whether a snapshot satisfies a constraint tree
    pub async fn matches(
        &self,
        snapshot: &Value,
        constraints: &ConstraintNode,
    ) -> Result<bool, EvaluationError> {
        self.eval(snapshot, constraints).await
    }

    /// Classify a mutation event for one subscription's constraints.
    ///
    /// Returns `None` when the event is invisible to the query (no snapshot
    /// matched). Deletes match against the final state of the object.
    pub async fn classify(
        &self,
        event: &MutationEvent,
        constraints: &ConstraintNode,
    ) -> Result<Option<NotificationKind>, EvaluationError> {
        match event.kind {
            MutationKind::Create => Ok(self
                .matches(&event.current, constraints)
                .await?
                .then_some(NotificationKind::Created)),

            MutationKind::Delete => Ok(self
                .matches(&event.current, constraints)
                .await?
                .then_some(NotificationKind::Deleted)),

            MutationKind::Update => {
                let after = self.matches(&event.current, constraints).await?;
                // A feed that omits the pre-snapshot is treated as a fresh
                // appearance: the object cannot have matched before.
                let before = match &event.previous {
                    Some(previous) => self.matches(previous, constraints).await?,
                    None => false,
                };

                Ok(match (before, after) {
                    (false, true) => Some(NotificationKind::Entered),
                    (true, false) => Some(NotificationKind::Left),
                    (true, true) => Some(NotificationKind::Updated),
                    (false, false) => None,
                })
            }
        }
    }

    fn eval<'b>(
        &'b self,
        snapshot: &'b Value,
        node: &'b ConstraintNode,
    ) -> BoxFuture<'b, Result<bool, EvaluationError>> {
        Box::pin(async move {
            match node {
                ConstraintNode::And(children) => {
                    for child in children {
                        if !self.eval(snapshot, child).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }

                ConstraintNode::Or(children) => {
                    for child in children {
                        if self.eval(snapshot, child).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }

                ConstraintNode::Nor(children) => {
                    for child in children {
                        if self.eval(snapshot, child).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }

                ConstraintNode::Predicate { path, op } => match op {
                    FieldPredicate::Related(related) => {
                        let Some(id) = lookup_path(snapshot, path).and_then(related_id) else {
                            return Ok(false);
                        };
                        self.relations
                            .evaluate(&related.class_name, &related.query, id)
                            .await
                    }
                    _ => Ok(eval_field(lookup_path(snapshot, path), op)),
                },
            }
        })
    }
}

/// Extract a related object id from a snapshot field: either a bare string
/// id or a pointer object carrying an `id` key.
fn related_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// Evaluate a non-suspending predicate against the resolved field value
fn eval_field(actual: Option<&Value>, op: &FieldPredicate) -> bool {
    // Absence decides existence checks and fails everything else.
    let Some(actual) = actual else {
        return matches!(op, FieldPredicate::Exists(false));
    };

    match op {
        FieldPredicate::Exists(wanted) => *wanted,

        FieldPredicate::Equal(expected) => eq_any_element(actual, expected),

        FieldPredicate::LessThan(bound) => compare(actual, bound, |o| o.is_lt()),
        FieldPredicate::LessThanOrEqual(bound) => compare(actual, bound, |o| o.is_le()),
        FieldPredicate::GreaterThan(bound) => compare(actual, bound, |o| o.is_gt()),
        FieldPredicate::GreaterThanOrEqual(bound) => compare(actual, bound, |o| o.is_ge()),

        FieldPredicate::In(set) => in_any_element(actual, set),
        FieldPredicate::NotIn(set) => !in_any_element(actual, set),

        FieldPredicate::Matches(pattern) => actual
            .as_str()
            .map(|s| pattern.is_match(s))
            .unwrap_or(false),

        FieldPredicate::WithinRadius { center, radius_km } => as_point(actual)
            .map(|p| haversine_km(&p, center) <= *radius_km)
            .unwrap_or(false),

        FieldPredicate::WithinBox {
            southwest,
            northeast,
        } => as_point(actual)
            .map(|p| in_box(&p, southwest, northeast))
            .unwrap_or(false),

        FieldPredicate::WithinPolygon(vertices) => as_point(actual)
            .map(|p| in_polygon(&p, vertices))
            .unwrap_or(false),

        // Suspending predicate, handled by the evaluator
        FieldPredicate::Related(_) => false,
    }
}

/// Equality with any-element semantics: an array field matches when the
/// whole array equals the expected value or any element does.
fn eq_any_element(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match actual {
        Value::Array(elements) => elements.iter().any(|e| e == expected),
        _ => false,
    }
}

/// Set membership with any-element semantics for array fields
fn in_any_element(actual: &Value, set: &[Value]) -> bool {
    match actual {
        Value::Array(elements) => elements.iter().any(|e| set.contains(e)),
        _ => set.contains(actual),
    }
}

/// Strict ordered comparison: numeric against numeric, string against
/// string, anything else never matches. No cross-type coercion.
fn compare(
    actual: &Value,
    bound: &Value,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    match (actual, bound) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(af), Some(bf)) => af.partial_cmp(&bf).map(&accept).unwrap_or(false),
            _ => false,
        },
        (Value::String(a), Value::String(b)) => accept(a.cmp(b)),
        _ => false,
    }
}

fn as_point(value: &Value) -> Option<GeoPoint> {
    serde_json::from_value::<GeoPoint>(value.clone())
        .ok()
        .filter(GeoPoint::in_range)
}

/// Great-circle distance between two points in kilometers
fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Axis-aligned containment. Boxes do not wrap the antimeridian, matching
/// the storage engine.
fn in_box(p: &GeoPoint, southwest: &GeoPoint, northeast: &GeoPoint) -> bool {
    p.latitude >= southwest.latitude
        && p.latitude <= northeast.latitude
        && p.longitude >= southwest.longitude
        && p.longitude <= northeast.longitude
}

/// Ray-casting point-in-polygon over latitude/longitude treated as a plane
fn in_polygon(p: &GeoPoint, vertices: &[GeoPoint]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let a = &vertices[i];
        let b = &vertices[j];
        let crosses = (a.latitude > p.latitude) != (b.latitude > p.latitude)
            && p.longitude
                < (b.longitude - a.longitude) * (p.latitude - a.latitude)
                    / (b.latitude - a.latitude)
                    + a.longitude;
        if crosses {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// In-memory related-object store.
///
/// Backs the `related` predicate for the server binary and tests: related
/// objects are registered per class, and subqueries are evaluated with the
/// same matcher semantics. A deployment would put the storage engine's
/// query capability behind the same trait.
#[derive(Debug, Default)]
pub struct InMemoryRelationStore {
    objects: DashMap<(String, String), Value>,
}

impl InMemoryRelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a related object
    pub fn put(&self, class_name: &str, object_id: &str, snapshot: Value) {
        self.objects
            .insert((class_name.to_string(), object_id.to_string()), snapshot);
    }

    pub fn remove(&self, class_name: &str, object_id: &str) {
        self.objects
            .remove(&(class_name.to_string(), object_id.to_string()));
    }
}

#[async_trait]
impl RelationEvaluator for InMemoryRelationStore {
    async fn evaluate(
        &self,
        class_name: &str,
        query: &Value,
        related_object_id: &str,
    ) -> Result<bool, EvaluationError> {
        let constraints =
            ConstraintNode::parse(query).map_err(|e| EvaluationError::RelatedLookup {
                class: class_name.to_string(),
                reason: e.to_string(),
            })?;

        let Some(snapshot) = self
            .objects
            .get(&(class_name.to_string(), related_object_id.to_string()))
            .map(|o| o.value().clone())
        else {
            return Ok(false);
        };

        QueryMatcher::new(self).matches(&snapshot, &constraints).await
    }
}
