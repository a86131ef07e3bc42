//! Record filters and collection queries
//!
//! A filter is a conjunction of per-field conditions over a JSON record:
//!
//! ```json
//! { "id": "abc", "priority": { "$gte": 2 }, "tag": { "$in": ["a", "b"] } }
//! ```
//!
//! A bare value is an equality test. Operator objects carry exactly one
//! `$`-prefixed key.

use crate::{Map, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    #[error("filter must be an object, got {0}")]
    NotAnObject(String),

    #[error("unknown filter operator '{0}'")]
    UnknownOperator(String),

    #[error("invalid operand for '{op}': {reason}")]
    InvalidOperand { op: String, reason: String },
}

/// A single field condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Exists(bool),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
}

impl Condition {
    fn parse(value: &Value) -> Result<Self, FilterError> {
        let (op, operand) = match value {
            Value::Object(obj) if obj.len() == 1 => match obj.iter().next() {
                Some((op, operand)) if op.starts_with('$') => (op, operand),
                _ => return Ok(Condition::Eq(value.clone())),
            },
            other => return Ok(Condition::Eq(other.clone())),
        };

        let condition = match op.as_str() {
            "$eq" => Condition::Eq(operand.clone()),
            "$ne" => Condition::Ne(operand.clone()),
            "$in" => match operand {
                Value::Array(items) => Condition::In(items.clone()),
                _ => {
                    return Err(FilterError::InvalidOperand {
                        op: op.clone(),
                        reason: "expected an array".to_string(),
                    })
                }
            },
            "$exists" => match operand {
                Value::Bool(b) => Condition::Exists(*b),
                _ => {
                    return Err(FilterError::InvalidOperand {
                        op: op.clone(),
                        reason: "expected a boolean".to_string(),
                    })
                }
            },
            "$gt" => Condition::Gt(operand.clone()),
            "$gte" => Condition::Gte(operand.clone()),
            "$lt" => Condition::Lt(operand.clone()),
            "$lte" => Condition::Lte(operand.clone()),
            other => return Err(FilterError::UnknownOperator(other.to_string())),
        };
        Ok(condition)
    }

    fn matches(&self, field: Option<&Value>) -> bool {
        let field_or_null = field.unwrap_or(&Value::Null);
        match self {
            Condition::Eq(expected) => field_or_null == expected,
            Condition::Ne(expected) => field_or_null != expected,
            Condition::In(options) => options.iter().any(|o| o == field_or_null),
            Condition::Exists(expected) => {
                let present = matches!(field, Some(v) if !v.is_null());
                present == *expected
            }
            Condition::Gt(bound) => {
                compare_values(field_or_null, bound) == Some(Ordering::Greater)
            }
            Condition::Gte(bound) => matches!(
                compare_values(field_or_null, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::Lt(bound) => compare_values(field_or_null, bound) == Some(Ordering::Less),
            Condition::Lte(bound) => matches!(
                compare_values(field_or_null, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }

    fn to_value(&self) -> Value {
        let op = |name: &str, operand: Value| {
            let mut obj = Map::new();
            obj.insert(name.to_string(), operand);
            Value::Object(obj)
        };
        match self {
            Condition::Eq(v) => v.clone(),
            Condition::Ne(v) => op("$ne", v.clone()),
            Condition::In(items) => op("$in", Value::Array(items.clone())),
            Condition::Exists(b) => op("$exists", Value::Bool(*b)),
            Condition::Gt(v) => op("$gt", v.clone()),
            Condition::Gte(v) => op("$gte", v.clone()),
            Condition::Lt(v) => op("$lt", v.clone()),
            Condition::Lte(v) => op("$lte", v.clone()),
        }
    }
}

/// Order two JSON scalars of the same kind
///
/// Numbers compare numerically and strings lexicographically; any other
/// pairing is unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Conjunction of field conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: BTreeMap<String, Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-field equality filter
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        let mut clauses = BTreeMap::new();
        clauses.insert(field.into(), Condition::Eq(value));
        Self { clauses }
    }

    pub fn parse(value: &Value) -> Result<Self, FilterError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FilterError::NotAnObject(value.to_string()))?;
        let mut clauses = BTreeMap::new();
        for (field, condition) in obj {
            clauses.insert(field.clone(), Condition::parse(condition)?);
        }
        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> impl Iterator<Item = (&String, &Condition)> {
        self.clauses.iter()
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, condition)| condition.matches(record.get(field)))
    }

    /// The record id if this filter is a single equality on `id`
    ///
    /// Such filters can be served by a point lookup instead of a scan.
    pub fn point_key(&self) -> Option<&str> {
        if self.clauses.len() != 1 {
            return None;
        }
        match self.clauses.get("id") {
            Some(Condition::Eq(Value::String(id))) => Some(id),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.clauses
                .iter()
                .map(|(field, c)| (field.clone(), c.to_value()))
                .collect(),
        )
    }
}

/// How a collection is read
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Every record, as an array
    All,
    /// A single record by id, or null
    Key(String),
    /// Matching records, as an array
    Filter(Filter),
}

impl Query {
    /// Pick the cheapest query that answers `filter`
    pub fn for_filter(filter: Option<Filter>) -> Query {
        match filter {
            None => Query::All,
            Some(f) if f.is_empty() => Query::All,
            Some(f) => match f.point_key() {
                Some(id) => Query::Key(id.to_string()),
                None => Query::Filter(f),
            },
        }
    }

    pub fn is_point_lookup(&self) -> bool {
        matches!(self, Query::Key(_))
    }
}

/// A context value declaring a live read dependency on a collection
///
/// Recognized by shape: an object with a string `collection` and an optional
/// object `filter`, and nothing else. Filter values may reference context
/// keys as `"$key"`; those are resolved before the query is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map>,
}

impl QueryDescriptor {
    pub fn detect(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let collection = obj.get("collection")?.as_str()?;
        let filter = match obj.get("filter") {
            None | Some(Value::Null) => None,
            Some(Value::Object(filter)) => Some(filter.clone()),
            Some(_) => return None,
        };
        if obj.keys().any(|k| k != "collection" && k != "filter") {
            return None;
        }
        Some(Self {
            collection: collection.to_string(),
            filter,
        })
    }

    /// Top-level context keys referenced by the filter
    pub fn references(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        if let Some(filter) = &self.filter {
            for value in filter.values() {
                collect_references(value, &mut refs);
            }
        }
        refs
    }
}

fn collect_references(value: &Value, refs: &mut BTreeSet<String>) {
    match value {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
            let path = &s[1..];
            let head = path.split('.').next().unwrap_or(path);
            if !head.is_empty() {
                refs.insert(head.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, refs)),
        Value::Object(obj) => obj.values().for_each(|v| collect_references(v, refs)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_filter_matches() {
        let filter = Filter::parse(&json!({"status": "open"})).unwrap();
        assert!(filter.matches(&json!({"status": "open", "id": "1"})));
        assert!(!filter.matches(&json!({"status": "done"})));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn test_operator_filters() {
        let filter = Filter::parse(&json!({
            "priority": {"$gte": 2},
            "tag": {"$in": ["a", "b"]},
            "owner": {"$exists": true},
        }))
        .unwrap();

        assert!(filter.matches(&json!({"priority": 3, "tag": "a", "owner": "x"})));
        assert!(!filter.matches(&json!({"priority": 1, "tag": "a", "owner": "x"})));
        assert!(!filter.matches(&json!({"priority": 3, "tag": "c", "owner": "x"})));
        assert!(!filter.matches(&json!({"priority": 3, "tag": "a", "owner": null})));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = Filter::parse(&json!({"x": {"$near": 1}})).unwrap_err();
        assert_eq!(err, FilterError::UnknownOperator("$near".to_string()));
    }

    #[test]
    fn test_point_key_detection() {
        assert_eq!(Filter::eq("id", json!("X")).point_key(), Some("X"));
        assert_eq!(Filter::eq("name", json!("X")).point_key(), None);
        assert_eq!(Filter::eq("id", json!(7)).point_key(), None);

        assert_eq!(
            Query::for_filter(Some(Filter::eq("id", json!("X")))),
            Query::Key("X".to_string())
        );
        assert_eq!(Query::for_filter(None), Query::All);
    }

    #[test]
    fn test_descriptor_detection() {
        let d = QueryDescriptor::detect(&json!({
            "collection": "spark",
            "filter": {"id": "$sparkId"}
        }))
        .unwrap();
        assert_eq!(d.collection, "spark");
        assert_eq!(d.references().into_iter().collect::<Vec<_>>(), vec!["sparkId"]);

        assert!(QueryDescriptor::detect(&json!({"collection": "spark", "extra": 1})).is_none());
        assert!(QueryDescriptor::detect(&json!({"collection": 3})).is_none());
        assert!(QueryDescriptor::detect(&json!("spark")).is_none());
    }

    #[test]
    fn test_descriptor_references_skip_payload_refs() {
        let d = QueryDescriptor::detect(&json!({
            "collection": "todos",
            "filter": {"owner": "$user.id", "tag": {"$in": "$$tags"}}
        }))
        .unwrap();
        assert_eq!(d.references().into_iter().collect::<Vec<_>>(), vec!["user"]);
    }

    #[test]
    fn test_filter_to_value_round_trips() {
        let raw = json!({"a": 1, "b": {"$ne": "x"}});
        let filter = Filter::parse(&raw).unwrap();
        assert_eq!(filter.to_value(), raw);
    }
}
