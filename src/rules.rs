//! Routing rule engine.
//!
//! Rules pair a signal pattern with an optional source filter (a regular
//! expression over the source server name), a set of extra relay targets,
//! and an optional payload transform.  Matching is evaluated in descending
//! rule priority and bumps each matched rule's `match_count` in the same
//! store lock as the query.
//!
//! A malformed `source_filter` must not poison the matcher: regexes are
//! compiled lazily, cached by pattern, and a compile failure downgrades the
//! rule to "no filter" — it still matches on the signal-type criterion.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::rlog;
use crate::storage::{now_ms, RelayRuleRow, RulePatch, Store, StoreError};

/// Fields for a new rule; the store assigns the id and timestamps.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub signal_pattern: u16,
    pub source_filter: Option<String>,
    pub relay_to: Vec<String>,
    pub transform: Option<Map<String, Value>>,
    pub priority: i64,
    pub enabled: bool,
}

pub struct RuleEngine {
    store: Arc<Mutex<Store>>,
    /// Pattern → compiled regex; `None` marks a pattern that failed to
    /// compile so it is not re-attempted on every match.
    regex_cache: std::sync::Mutex<HashMap<String, Option<Regex>>>,
}

impl RuleEngine {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self {
            store,
            regex_cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn add_rule(&self, rule: NewRule) -> Result<i64, StoreError> {
        let row = RelayRuleRow {
            id: 0,
            signal_pattern: rule.signal_pattern,
            source_filter: rule.source_filter,
            relay_to: rule.relay_to,
            transform: rule.transform,
            priority: rule.priority,
            enabled: rule.enabled,
            created_at: now_ms(),
            updated_at: None,
            match_count: 0,
        };
        self.store.lock().await.insert_rule(&row)
    }

    pub async fn update_rule(&self, id: i64, patch: RulePatch) -> Result<bool, StoreError> {
        self.store.lock().await.update_rule(id, &patch, now_ms())
    }

    pub async fn remove_rule(&self, id: i64) -> Result<bool, StoreError> {
        self.store.lock().await.delete_rule(id)
    }

    /// All rules, enabled and disabled, priority descending.
    pub async fn list_rules(&self) -> Result<Vec<RelayRuleRow>, StoreError> {
        self.store.lock().await.list_rules()
    }

    /// Enabled rules whose pattern equals `signal_type` and whose source
    /// filter (if any) matches `source_server`.  Matched rules' counters are
    /// incremented under the same store lock as the query.
    pub async fn match_rules(
        &self,
        signal_type: u16,
        source_server: &str,
    ) -> Result<Vec<RelayRuleRow>, StoreError> {
        let store = self.store.lock().await;
        let candidates = store.enabled_rules_for(signal_type)?;
        let matched: Vec<RelayRuleRow> = candidates
            .into_iter()
            .filter(|rule| self.source_matches(rule, source_server))
            .collect();
        let ids: Vec<i64> = matched.iter().map(|rule| rule.id).collect();
        store.increment_match_counts(&ids)?;
        Ok(matched)
    }

    /// Union of `relay_to` across every matched rule, duplicates collapsed.
    pub async fn auto_relay_targets(
        &self,
        signal_type: u16,
        source_server: &str,
    ) -> Result<Vec<String>, StoreError> {
        let matched = self.match_rules(signal_type, source_server).await?;
        let mut targets = Vec::new();
        for rule in &matched {
            for target in &rule.relay_to {
                if !targets.contains(target) {
                    targets.push(target.clone());
                }
            }
        }
        Ok(targets)
    }

    fn source_matches(&self, rule: &RelayRuleRow, source_server: &str) -> bool {
        let Some(pattern) = rule.source_filter.as_deref() else {
            return true;
        };
        let mut cache = self.regex_cache.lock().unwrap();
        let compiled = cache.entry(pattern.to_string()).or_insert_with(|| {
            match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    rlog!("rules: invalid source_filter {pattern:?} treated as no filter: {e}");
                    None
                }
            }
        });
        match compiled {
            Some(re) => re.is_match(source_server),
            // Invalid regex: the rule still matches on signal type alone.
            None => true,
        }
    }
}

/// Apply a transform spec to a payload, producing a new object.
///
/// Spec entries are applied in the map's key order, which is deterministic
/// for any given spec:
/// - a `null` value deletes the key,
/// - `{"rename": "<field>"}` moves the named field's value under this key,
/// - anything else sets the key to that literal value.
pub fn apply_transform(
    payload: &Map<String, Value>,
    spec: &Map<String, Value>,
) -> Map<String, Value> {
    let mut output = payload.clone();
    for (key, op) in spec {
        match op {
            Value::Null => {
                output.remove(key);
            }
            Value::Object(obj) => {
                let rename_source = obj.get("rename").and_then(Value::as_str);
                match rename_source {
                    Some(source) if output.contains_key(source) => {
                        if let Some(value) = output.remove(source) {
                            output.insert(key.clone(), value);
                        }
                    }
                    _ => {
                        output.insert(key.clone(), op.clone());
                    }
                }
            }
            other => {
                output.insert(key.clone(), other.clone());
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map_of(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn engine() -> RuleEngine {
        let store = Store::open_in_memory().expect("store");
        RuleEngine::new(Arc::new(Mutex::new(store)))
    }

    fn rule_to(targets: &[&str]) -> NewRule {
        NewRule {
            signal_pattern: 0x50,
            source_filter: None,
            relay_to: targets.iter().map(|t| t.to_string()).collect(),
            transform: None,
            priority: 0,
            enabled: true,
        }
    }

    #[test]
    fn transform_identity_set_and_delete() {
        let payload = map_of(&[("a", json!(1)), ("b", json!("two"))]);

        assert_eq!(apply_transform(&payload, &Map::new()), payload);

        let set = apply_transform(&payload, &map_of(&[("c", json!(3))]));
        assert_eq!(set.get("c"), Some(&json!(3)));
        assert_eq!(set.get("a"), Some(&json!(1)));

        let deleted = apply_transform(&payload, &map_of(&[("a", Value::Null)]));
        assert!(!deleted.contains_key("a"));
        assert_eq!(deleted.get("b"), Some(&json!("two")));
    }

    #[test]
    fn transform_rename_moves_value() {
        let payload = map_of(&[("old", json!("v")), ("keep", json!(true))]);
        let spec = map_of(&[
            ("ts", json!(123)),
            ("old", Value::Null),
            ("new", json!({"rename": "old"})),
        ]);
        // Key order puts the rename before the delete, so the value moves
        // and the trailing delete of "old" is a no-op.
        let transformed = apply_transform(&payload, &spec);
        assert_eq!(transformed.get("ts"), Some(&json!(123)));
        assert_eq!(transformed.get("keep"), Some(&json!(true)));
        assert_eq!(transformed.get("new"), Some(&json!("v")));
        assert!(!transformed.contains_key("old"));
        assert_eq!(transformed.len(), 3);
    }

    #[test]
    fn transform_rename_of_missing_field_sets_literal() {
        let payload = map_of(&[("keep", json!(1))]);
        let spec = map_of(&[("new", json!({"rename": "absent"}))]);
        let transformed = apply_transform(&payload, &spec);
        assert_eq!(transformed.get("new"), Some(&json!({"rename": "absent"})));
    }

    #[test]
    fn transform_without_renames_is_idempotent() {
        let payload = map_of(&[("a", json!(1)), ("b", json!(2))]);
        let spec = map_of(&[("a", Value::Null), ("c", json!("x"))]);
        let once = apply_transform(&payload, &spec);
        let twice = apply_transform(&once, &spec);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn match_increments_count_and_respects_filter() {
        let engine = engine();
        let mut filtered = rule_to(&["gamma"]);
        filtered.source_filter = Some("^alpha$".to_string());
        let filtered_id = engine.add_rule(filtered).await.expect("add");
        let open_id = engine.add_rule(rule_to(&["delta"])).await.expect("add");

        let matched = engine.match_rules(0x50, "alpha").await.expect("match");
        assert_eq!(matched.len(), 2);

        let matched = engine.match_rules(0x50, "beta").await.expect("match");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, open_id);

        let rules = engine.list_rules().await.expect("list");
        let by_id: HashMap<i64, i64> = rules.iter().map(|r| (r.id, r.match_count)).collect();
        assert_eq!(by_id[&filtered_id], 1);
        assert_eq!(by_id[&open_id], 2);
    }

    #[tokio::test]
    async fn invalid_regex_is_treated_as_no_filter() {
        let engine = engine();
        let mut broken = rule_to(&["gamma"]);
        broken.source_filter = Some("((unclosed".to_string());
        engine.add_rule(broken).await.expect("add");

        let matched = engine.match_rules(0x50, "anything").await.expect("match");
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn disabled_rules_never_match() {
        let engine = engine();
        let mut disabled = rule_to(&["gamma"]);
        disabled.enabled = false;
        engine.add_rule(disabled).await.expect("add");

        assert!(engine.match_rules(0x50, "alpha").await.expect("match").is_empty());
    }

    #[tokio::test]
    async fn auto_targets_collapse_duplicates() {
        let engine = engine();
        engine.add_rule(rule_to(&["gamma", "delta"])).await.expect("add");
        engine.add_rule(rule_to(&["delta", "epsilon"])).await.expect("add");

        let mut targets = engine.auto_relay_targets(0x50, "alpha").await.expect("targets");
        targets.sort();
        assert_eq!(targets, vec!["delta", "epsilon", "gamma"]);
    }
}
