//! # Query Constraints
//!
//! The constraint tree a subscription evaluates mutations against.
//!
//! Client queries arrive as JSON and are parsed into a tagged tree at
//! subscribe time. Unknown or malformed operators are rejected here, before
//! the subscription ever becomes active — the matcher itself only sees
//! well-formed trees. Regexes are compiled once here, not per event.
//!
//! Grammar: implicit equality, `eq`, `lt`/`lte`/`gt`/`gte`, `in`/`nin`,
//! `exists`, `regex`, logical `and`/`or`/`nor`, `related` (subquery against
//! a related class, delegated to storage), and the geo predicates
//! `withinRadius`, `withinBox`, `withinPolygon`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{LiveQueryError, LiveQueryResult};

/// A geographic point, as stored in object snapshots
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// True if both coordinates are within their valid ranges
    pub fn in_range(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A subquery against a related class.
///
/// The query body stays in the storage engine's own language — the matcher
/// never interprets it, it hands it to the storage collaborator together
/// with the related object id found in the snapshot.
#[derive(Debug, Clone)]
pub struct RelatedQuery {
    /// Related class the subquery runs against
    pub class_name: String,
    /// Subquery body, opaque to the matcher
    pub query: Value,
}

/// A single-field predicate
#[derive(Debug, Clone)]
pub enum FieldPredicate {
    Equal(Value),
    LessThan(Value),
    LessThanOrEqual(Value),
    GreaterThan(Value),
    GreaterThanOrEqual(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Exists(bool),
    Matches(Regex),
    Related(RelatedQuery),
    WithinRadius { center: GeoPoint, radius_km: f64 },
    WithinBox { southwest: GeoPoint, northeast: GeoPoint },
    WithinPolygon(Vec<GeoPoint>),
}

/// A node in the constraint tree
#[derive(Debug, Clone)]
pub enum ConstraintNode {
    /// All children must match
    And(Vec<ConstraintNode>),
    /// At least one child must match
    Or(Vec<ConstraintNode>),
    /// No child may match
    Nor(Vec<ConstraintNode>),
    /// A predicate on one (possibly dotted) field path
    Predicate { path: String, op: FieldPredicate },
}

impl ConstraintNode {
    /// Parse a client query document into a constraint tree.
    ///
    /// The empty object is a valid query matching every object of the class.
    pub fn parse(query: &Value) -> LiveQueryResult<Self> {
        let map = query.as_object().ok_or_else(|| {
            LiveQueryError::MalformedQuery("query must be a JSON object".to_string())
        })?;

        let mut children = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "and" => children.push(ConstraintNode::And(Self::parse_branch_list(key, value)?)),
                "or" => children.push(ConstraintNode::Or(Self::parse_branch_list(key, value)?)),
                "nor" => children.push(ConstraintNode::Nor(Self::parse_branch_list(key, value)?)),
                _ => Self::parse_field(key, value, &mut children)?,
            }
        }

        Ok(ConstraintNode::And(children))
    }

    fn parse_branch_list(key: &str, value: &Value) -> LiveQueryResult<Vec<ConstraintNode>> {
        let branches = value.as_array().ok_or_else(|| {
            LiveQueryError::MalformedQuery(format!("'{}' takes an array of queries", key))
        })?;
        if branches.is_empty() {
            return Err(LiveQueryError::MalformedQuery(format!(
                "'{}' requires at least one branch",
                key
            )));
        }
        branches.iter().map(Self::parse).collect()
    }

    fn parse_field(
        path: &str,
        value: &Value,
        out: &mut Vec<ConstraintNode>,
    ) -> LiveQueryResult<()> {
        if path.is_empty() {
            return Err(LiveQueryError::MalformedQuery(
                "empty field name".to_string(),
            ));
        }

        let Some(ops) = value.as_object().filter(|m| Self::is_operator_map(m)) else {
            // Scalar, array, or plain object value: implicit equality
            out.push(ConstraintNode::Predicate {
                path: path.to_string(),
                op: FieldPredicate::Equal(value.clone()),
            });
            return Ok(());
        };

        for (op_name, operand) in ops {
            let op = Self::parse_operator(path, op_name, operand)?;
            out.push(ConstraintNode::Predicate {
                path: path.to_string(),
                op,
            });
        }
        Ok(())
    }

    /// An object value containing any operator key is treated as an operator
    /// map; remaining non-operator keys inside it are then rejected, rather
    /// than silently treated as an equality literal.
    fn is_operator_map(map: &serde_json::Map<String, Value>) -> bool {
        map.keys().any(|k| Self::is_operator(k))
    }

    fn is_operator(name: &str) -> bool {
        matches!(
            name,
            "eq" | "lt"
                | "lte"
                | "gt"
                | "gte"
                | "in"
                | "nin"
                | "exists"
                | "regex"
                | "related"
                | "withinRadius"
                | "withinBox"
                | "withinPolygon"
        )
    }

    fn parse_operator(path: &str, name: &str, operand: &Value) -> LiveQueryResult<FieldPredicate> {
        match name {
            "eq" => Ok(FieldPredicate::Equal(operand.clone())),
            "lt" => Ok(FieldPredicate::LessThan(operand.clone())),
            "lte" => Ok(FieldPredicate::LessThanOrEqual(operand.clone())),
            "gt" => Ok(FieldPredicate::GreaterThan(operand.clone())),
            "gte" => Ok(FieldPredicate::GreaterThanOrEqual(operand.clone())),

            "in" => Ok(FieldPredicate::In(Self::operand_list(path, name, operand)?)),
            "nin" => Ok(FieldPredicate::NotIn(Self::operand_list(path, name, operand)?)),

            "exists" => operand
                .as_bool()
                .map(FieldPredicate::Exists)
                .ok_or_else(|| {
                    LiveQueryError::MalformedQuery(format!(
                        "'exists' on '{}' takes a boolean",
                        path
                    ))
                }),

            "regex" => {
                let pattern = operand.as_str().ok_or_else(|| {
                    LiveQueryError::MalformedQuery(format!("'regex' on '{}' takes a string", path))
                })?;
                let compiled = Regex::new(pattern).map_err(|e| {
                    LiveQueryError::MalformedQuery(format!(
                        "invalid regex on '{}': {}",
                        path, e
                    ))
                })?;
                Ok(FieldPredicate::Matches(compiled))
            }

            "related" => {
                let params = operand.as_object().ok_or_else(|| {
                    LiveQueryError::MalformedQuery(format!(
                        "'related' on '{}' takes an object",
                        path
                    ))
                })?;
                let class_name = params
                    .get("class")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        LiveQueryError::MalformedQuery(format!(
                            "'related' on '{}' requires a 'class' name",
                            path
                        ))
                    })?;
                let query = params.get("where").cloned().ok_or_else(|| {
                    LiveQueryError::MalformedQuery(format!(
                        "'related' on '{}' requires a 'where' body",
                        path
                    ))
                })?;
                Ok(FieldPredicate::Related(RelatedQuery {
                    class_name: class_name.to_string(),
                    query,
                }))
            }

            "withinRadius" => {
                let params = operand.as_object().ok_or_else(|| {
                    LiveQueryError::MalformedQuery(format!(
                        "'withinRadius' on '{}' takes an object",
                        path
                    ))
                })?;
                let center = Self::operand_point(path, params.get("center"))?;
                let radius_km = params
                    .get("radiusKm")
                    .and_then(Value::as_f64)
                    .filter(|r| r.is_finite() && *r >= 0.0)
                    .ok_or_else(|| {
                        LiveQueryError::MalformedQuery(format!(
                            "'withinRadius' on '{}' requires a non-negative 'radiusKm'",
                            path
                        ))
                    })?;
                Ok(FieldPredicate::WithinRadius { center, radius_km })
            }

            "withinBox" => {
                let params = operand.as_object().ok_or_else(|| {
                    LiveQueryError::MalformedQuery(format!(
                        "'withinBox' on '{}' takes an object",
                        path
                    ))
                })?;
                let southwest = Self::operand_point(path, params.get("southwest"))?;
                let northeast = Self::operand_point(path, params.get("northeast"))?;
                Ok(FieldPredicate::WithinBox {
                    southwest,
                    northeast,
                })
            }

            "withinPolygon" => {
                let raw = operand.as_array().ok_or_else(|| {
                    LiveQueryError::MalformedQuery(format!(
                        "'withinPolygon' on '{}' takes an array of points",
                        path
                    ))
                })?;
                if raw.len() < 3 {
                    return Err(LiveQueryError::MalformedQuery(format!(
                        "'withinPolygon' on '{}' requires at least 3 vertices",
                        path
                    )));
                }
                let vertices = raw
                    .iter()
                    .map(|v| Self::operand_point(path, Some(v)))
                    .collect::<LiveQueryResult<Vec<_>>>()?;
                Ok(FieldPredicate::WithinPolygon(vertices))
            }

            other => Err(LiveQueryError::MalformedQuery(format!(
                "unknown operator '{}' on '{}'",
                other, path
            ))),
        }
    }

    fn operand_list(path: &str, name: &str, operand: &Value) -> LiveQueryResult<Vec<Value>> {
        operand.as_array().cloned().ok_or_else(|| {
            LiveQueryError::MalformedQuery(format!("'{}' on '{}' takes an array", name, path))
        })
    }

    fn operand_point(path: &str, value: Option<&Value>) -> LiveQueryResult<GeoPoint> {
        let point = value
            .cloned()
            .and_then(|v| serde_json::from_value::<GeoPoint>(v).ok())
            .ok_or_else(|| {
                LiveQueryError::MalformedQuery(format!(
                    "geo predicate on '{}' requires points with latitude/longitude",
                    path
                ))
            })?;
        if !point.in_range() {
            return Err(LiveQueryError::MalformedQuery(format!(
                "geo predicate on '{}' has out-of-range coordinates",
                path
            )));
        }
        Ok(point)
    }
}

/// Look up a dotted field path in a snapshot.
///
/// Returns `None` for absent intermediate objects. JSON null counts as
/// absent: the storage engine does not distinguish a null field from a
/// missing one.
pub fn lookup_path<'a>(snapshot: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = snapshot;
    for segment in path.split('.') {
        cursor = cursor.as_object()?.get(segment)?;
    }
    if cursor.is_null() {
        None
    } else {
        Some(cursor)
    }
}
