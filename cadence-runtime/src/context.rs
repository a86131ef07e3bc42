//! Per-actor context
//!
//! The context keeps two layers. The raw layer mirrors the persisted context
//! document, query descriptors included. The derived layer holds the current
//! result of each descriptor, keyed by the descriptor's context key. Guards
//! and actions see the merged view, where every descriptor is replaced by
//! its result.
//!
//! Each layer has its own write path: `apply_patch` for transitions,
//! `replace_raw` for external document changes, and `apply_derived` for
//! query results.

use cadence_types::{Map, QueryDescriptor, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    raw: Map,
    derived: Map,
}

impl Context {
    pub fn new(raw: Map) -> Self {
        Self {
            raw,
            derived: Map::new(),
        }
    }

    /// Persisted values, descriptors included
    pub fn raw(&self) -> &Map {
        &self.raw
    }

    /// Current query results
    pub fn derived(&self) -> &Map {
        &self.derived
    }

    /// Merged value of one key
    pub fn get(&self, key: &str) -> Option<Value> {
        let value = self.raw.get(key)?;
        if QueryDescriptor::detect(value).is_some() {
            Some(self.derived.get(key).cloned().unwrap_or(Value::Null))
        } else {
            Some(value.clone())
        }
    }

    /// The view guards and actions evaluate against
    pub fn merged(&self) -> Map {
        self.raw
            .iter()
            .map(|(key, value)| {
                let value = if QueryDescriptor::detect(value).is_some() {
                    self.derived.get(key).cloned().unwrap_or(Value::Null)
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Query descriptors in key order
    pub fn descriptors(&self) -> Vec<(String, QueryDescriptor)> {
        self.raw
            .iter()
            .filter_map(|(key, value)| QueryDescriptor::detect(value).map(|d| (key.clone(), d)))
            .collect()
    }

    pub fn is_descriptor(&self, key: &str) -> bool {
        self.raw
            .get(key)
            .map(|v| QueryDescriptor::detect(v).is_some())
            .unwrap_or(false)
    }

    /// Transition write path: overwrite keys, returning those that changed
    pub fn apply_patch(&mut self, patch: &Map) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in patch {
            if self.raw.get(key) != Some(value) {
                self.raw.insert(key.clone(), value.clone());
                changed.push(key.clone());
            }
        }
        self.prune_derived();
        changed
    }

    /// External write path: adopt a new persisted document
    ///
    /// Returns every key that was added, removed or modified.
    pub fn replace_raw(&mut self, raw: Map) -> Vec<String> {
        let mut changed: Vec<String> = raw
            .iter()
            .filter(|(key, value)| self.raw.get(*key) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect();
        changed.extend(
            self.raw
                .keys()
                .filter(|key| !raw.contains_key(*key))
                .cloned(),
        );
        changed.sort();
        self.raw = raw;
        self.prune_derived();
        changed
    }

    /// Derived write path: record a query result
    ///
    /// Returns false if the value is unchanged or the key no longer holds a
    /// descriptor.
    pub fn apply_derived(&mut self, key: &str, value: Value) -> bool {
        if !self.is_descriptor(key) {
            return false;
        }
        if self.derived.get(key) == Some(&value) {
            return false;
        }
        self.derived.insert(key.to_string(), value);
        true
    }

    pub fn clear_derived(&mut self, key: &str) -> bool {
        self.derived.remove(key).is_some()
    }

    fn prune_derived(&mut self) {
        let raw = &self.raw;
        self.derived.retain(|key, _| {
            raw.get(key)
                .map(|v| QueryDescriptor::detect(v).is_some())
                .unwrap_or(false)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_merged_view_replaces_descriptors() {
        let mut ctx = Context::new(map(json!({
            "count": 1,
            "spark": {"collection": "spark", "filter": {"id": "$sparkId"}},
        })));
        assert_eq!(ctx.get("spark"), Some(Value::Null));

        assert!(ctx.apply_derived("spark", json!({"id": "X"})));
        assert_eq!(ctx.merged(), map(json!({"count": 1, "spark": {"id": "X"}})));
        assert_eq!(ctx.descriptors().len(), 1);
    }

    #[test]
    fn test_apply_derived_ignores_plain_keys_and_repeats() {
        let mut ctx = Context::new(map(json!({
            "count": 1,
            "todos": {"collection": "todos"},
        })));
        assert!(!ctx.apply_derived("count", json!(5)));
        assert!(ctx.apply_derived("todos", json!([])));
        assert!(!ctx.apply_derived("todos", json!([])));
    }

    #[test]
    fn test_apply_patch_reports_changes() {
        let mut ctx = Context::new(map(json!({"a": 1, "b": 2})));
        let changed = ctx.apply_patch(&map(json!({"a": 1, "b": 3, "c": 4})));
        assert_eq!(changed, vec!["b", "c"]);
        assert_eq!(ctx.raw()["b"], 3);
    }

    #[test]
    fn test_replace_raw_reports_removed_keys() {
        let mut ctx = Context::new(map(json!({"a": 1, "b": 2})));
        let changed = ctx.replace_raw(map(json!({"b": 2, "c": 3})));
        assert_eq!(changed, vec!["a", "c"]);
    }

    #[test]
    fn test_replacing_descriptor_drops_derived_value() {
        let mut ctx = Context::new(map(json!({"todos": {"collection": "todos"}})));
        ctx.apply_derived("todos", json!([1]));
        ctx.apply_patch(&map(json!({"todos": "plain"})));
        assert!(ctx.derived().is_empty());
        assert_eq!(ctx.get("todos"), Some(json!("plain")));
    }
}
