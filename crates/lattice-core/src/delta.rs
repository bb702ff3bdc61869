use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An ordered mapping from string key to arbitrary nested JSON value.
/// The authoritative shape of every shared context.
pub type ContextValue = serde_json::Map<String, Value>;

/// Minimal description of a context change. Either `reset` carries the full
/// replacement value (wholesale `set`) and the other fields are empty, or
/// `added`/`updated`/`removed` describe the difference against the preimage.
///
/// `updated` is scoped to changed leaves: a deep update on `a.b` produces
/// `{a: {b: <new>}}`, not the whole of `a`. `removed` carries dot-qualified
/// paths (`"a.b"`), so keys containing '.' are not addressable for removal.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextDelta {
    #[serde(default, skip_serializing_if = "ContextValue::is_empty")]
    pub added: ContextValue,
    #[serde(default, skip_serializing_if = "ContextValue::is_empty")]
    pub updated: ContextValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<ContextValue>,
}

impl ContextDelta {
    /// A wholesale-replacement delta, as produced by `set` and by the
    /// synthetic first delivery to a late subscriber.
    pub fn reset_of(value: ContextValue) -> Self {
        Self {
            reset: Some(value),
            ..Self::default()
        }
    }

    pub fn is_reset(&self) -> bool {
        self.reset.is_some()
    }

    /// True when applying this delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty() && self.reset.is_none()
    }
}

/// A delta applied against a value it was not computed from.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("preimage mismatch at '{path}': {reason}")]
    PreimageMismatch { path: String, reason: String },
}

impl DeltaError {
    fn mismatch(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreimageMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Compute the minimal delta that transforms `old` into `new`.
pub fn diff(old: &ContextValue, new: &ContextValue) -> ContextDelta {
    let mut delta = ContextDelta::default();
    for (key, new_value) in new {
        match old.get(key) {
            None => {
                delta.added.insert(key.clone(), new_value.clone());
            }
            Some(old_value) if old_value == new_value => {}
            Some(old_value) => {
                if let (Value::Object(old_map), Value::Object(new_map)) = (old_value, new_value) {
                    let sub = diff_nested(old_map, new_map, &format!("{key}."), &mut delta.removed);
                    if !sub.is_empty() {
                        delta.updated.insert(key.clone(), Value::Object(sub));
                    }
                } else {
                    delta.updated.insert(key.clone(), new_value.clone());
                }
            }
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            delta.removed.push(key.clone());
        }
    }
    delta
}

/// Nested diff: returns the partial map of changed/added leaves under one
/// key, appending dot-qualified removals to `removed`.
fn diff_nested(old: &ContextValue, new: &ContextValue, prefix: &str, removed: &mut Vec<String>) -> ContextValue {
    let mut partial = ContextValue::new();
    for (key, new_value) in new {
        match old.get(key) {
            None => {
                partial.insert(key.clone(), new_value.clone());
            }
            Some(old_value) if old_value == new_value => {}
            Some(old_value) => {
                if let (Value::Object(old_map), Value::Object(new_map)) = (old_value, new_value) {
                    let sub = diff_nested(old_map, new_map, &format!("{prefix}{key}."), removed);
                    if !sub.is_empty() {
                        partial.insert(key.clone(), Value::Object(sub));
                    }
                } else {
                    partial.insert(key.clone(), new_value.clone());
                }
            }
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            removed.push(format!("{prefix}{key}"));
        }
    }
    partial
}

/// Apply `delta` to `value`, producing the post-value.
///
/// Deterministic, and strict about its preimage: an added key that already
/// exists with a different value, an updated top-level key that is absent,
/// or a removed path that is absent all mean the delta was computed against
/// a different base, and the caller must resync rather than guess.
pub fn apply(value: &ContextValue, delta: &ContextDelta) -> Result<ContextValue, DeltaError> {
    if let Some(reset) = &delta.reset {
        return Ok(reset.clone());
    }
    let mut out = value.clone();
    for (key, added) in &delta.added {
        match out.get(key) {
            Some(existing) if existing != added => {
                return Err(DeltaError::mismatch(key, "added key already present with a different value"));
            }
            _ => {
                out.insert(key.clone(), added.clone());
            }
        }
    }
    apply_updated(&mut out, &delta.updated, "", true)?;
    for path in &delta.removed {
        remove_path(&mut out, path)?;
    }
    Ok(out)
}

fn apply_updated(out: &mut ContextValue, partial: &ContextValue, prefix: &str, strict: bool) -> Result<(), DeltaError> {
    for (key, patch) in partial {
        let full = format!("{prefix}{key}");
        match out.get_mut(key) {
            None => {
                if strict {
                    return Err(DeltaError::mismatch(full, "updated key missing from preimage"));
                }
                out.insert(key.clone(), patch.clone());
            }
            Some(existing) => match (existing, patch) {
                (Value::Object(existing_map), Value::Object(patch_map)) => {
                    apply_updated(existing_map, patch_map, &format!("{full}."), false)?;
                }
                (slot, patch) => {
                    *slot = patch.clone();
                }
            },
        }
    }
    Ok(())
}

fn remove_path(out: &mut ContextValue, path: &str) -> Result<(), DeltaError> {
    let segments: Vec<&str> = path.split('.').collect();
    remove_segments(out, &segments, path)
}

fn remove_segments(map: &mut ContextValue, segments: &[&str], full: &str) -> Result<(), DeltaError> {
    match segments {
        [] => Err(DeltaError::mismatch(full, "empty removal path")),
        [leaf] => {
            if map.remove(*leaf).is_none() {
                return Err(DeltaError::mismatch(full, "removed path missing from preimage"));
            }
            Ok(())
        }
        [head, rest @ ..] => match map.get_mut(*head) {
            Some(Value::Object(inner)) => remove_segments(inner, rest, full),
            _ => Err(DeltaError::mismatch(full, "removed path missing from preimage")),
        },
    }
}

/// Merge `partial` into `current` — the `update` semantics. An explicit JSON
/// `null` is a tombstone: `{c: null}` removes key `c`, it does not set it to
/// null. Nested objects merge by key; any other value replaces wholesale.
pub fn merge(current: &ContextValue, partial: &ContextValue) -> ContextValue {
    let mut out = current.clone();
    merge_into(&mut out, partial);
    out
}

fn merge_into(out: &mut ContextValue, partial: &ContextValue) {
    for (key, patch) in partial {
        match patch {
            Value::Null => {
                out.remove(key);
            }
            Value::Object(patch_map) => {
                if let Some(Value::Object(existing)) = out.get_mut(key) {
                    merge_into(existing, patch_map);
                } else {
                    out.insert(key.clone(), Value::Object(strip_tombstones(patch_map)));
                }
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
}

/// A tombstone merged into a key that does not exist yet must not create it.
fn strip_tombstones(map: &ContextValue) -> ContextValue {
    let mut out = ContextValue::new();
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Object(inner) => {
                out.insert(key.clone(), Value::Object(strip_tombstones(inner)));
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> ContextValue {
        match v {
            Value::Object(m) => m,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn diff_added_updated_removed() {
        let old = obj(json!({"a": 1, "b": 2, "c": 3}));
        let new = obj(json!({"a": 1, "b": 5, "d": 4}));
        let delta = diff(&old, &new);
        assert_eq!(delta.added, obj(json!({"d": 4})));
        assert_eq!(delta.updated, obj(json!({"b": 5})));
        assert_eq!(delta.removed, vec!["c".to_string()]);
        assert!(delta.reset.is_none());
    }

    #[test]
    fn diff_identical_is_empty() {
        let value = obj(json!({"a": 1, "b": {"c": 2}}));
        assert!(diff(&value, &value).is_empty());
    }

    #[test]
    fn diff_nested_scoped_to_leaf() {
        let old = obj(json!({"a": {"b": 1, "c": 2}, "x": 9}));
        let new = obj(json!({"a": {"b": 7, "c": 2}, "x": 9}));
        let delta = diff(&old, &new);
        assert_eq!(delta.updated, obj(json!({"a": {"b": 7}})));
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn diff_nested_removal_is_path_qualified() {
        let old = obj(json!({"a": {"b": 1, "c": 2}}));
        let new = obj(json!({"a": {"c": 2}}));
        let delta = diff(&old, &new);
        assert_eq!(delta.removed, vec!["a.b".to_string()]);
        assert!(delta.updated.is_empty());
    }

    #[test]
    fn diff_type_change_replaces_wholesale() {
        let old = obj(json!({"a": {"b": 1}}));
        let new = obj(json!({"a": 5}));
        let delta = diff(&old, &new);
        assert_eq!(delta.updated, obj(json!({"a": 5})));
    }

    #[test]
    fn round_trip_law() {
        let cases = [
            (json!({}), json!({"a": 1})),
            (json!({"a": 1}), json!({})),
            (json!({"a": 1, "b": {"c": 2, "d": 3}}), json!({"a": 2, "b": {"c": 2}})),
            (json!({"a": {"b": {"c": 1}}}), json!({"a": {"b": {"c": 2, "e": 4}}, "f": 6})),
            (json!({"list": [1, 2], "s": "x"}), json!({"list": [2, 1], "s": "x"})),
            (json!({"a": 5}), json!({"a": {"b": 1}})),
        ];
        for (old, new) in cases {
            let old = obj(old);
            let new = obj(new);
            let delta = diff(&old, &new);
            let applied = apply(&old, &delta).unwrap();
            assert_eq!(applied, new, "delta: {delta:?}");
        }
    }

    #[test]
    fn apply_reset_replaces_everything() {
        let value = obj(json!({"a": 1}));
        let delta = ContextDelta::reset_of(obj(json!({"z": 9})));
        assert_eq!(apply(&value, &delta).unwrap(), obj(json!({"z": 9})));
    }

    #[test]
    fn reapply_on_matching_preimage_is_noop() {
        let old = obj(json!({"a": 1}));
        let new = obj(json!({"a": 2, "b": 3}));
        let delta = diff(&old, &new);
        let once = apply(&old, &delta).unwrap();
        // added "b" now present with the same value, updated "a" still present
        let twice = apply(&once, &delta).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn apply_against_divergent_base_fails() {
        let old = obj(json!({"a": 1, "b": 2}));
        let new = obj(json!({"a": 3}));
        let delta = diff(&old, &new); // updated a, removed b

        // removed path already gone
        let diverged = obj(json!({"a": 1}));
        assert!(matches!(
            apply(&diverged, &delta),
            Err(DeltaError::PreimageMismatch { .. })
        ));

        // updated key missing
        let diverged = obj(json!({"b": 2}));
        assert!(matches!(
            apply(&diverged, &delta),
            Err(DeltaError::PreimageMismatch { .. })
        ));
    }

    #[test]
    fn apply_added_conflict_fails() {
        let delta = ContextDelta {
            added: obj(json!({"a": 1})),
            ..ContextDelta::default()
        };
        let base = obj(json!({"a": 2}));
        let err = apply(&base, &delta).unwrap_err();
        assert!(matches!(err, DeltaError::PreimageMismatch { .. }));
    }

    #[test]
    fn merge_overwrites_and_adds() {
        let current = obj(json!({"font": 10, "font-family": "Arial"}));
        let partial = obj(json!({"font": 11}));
        let merged = merge(&current, &partial);
        assert_eq!(merged, obj(json!({"font": 11, "font-family": "Arial"})));
    }

    #[test]
    fn merge_null_is_tombstone() {
        let current = obj(json!({"a": 1, "c": 3}));
        let partial = obj(json!({"c": null}));
        let merged = merge(&current, &partial);
        assert_eq!(merged, obj(json!({"a": 1})));
    }

    #[test]
    fn merge_nested_by_key() {
        let current = obj(json!({"theme": {"font": 10, "color": "red"}}));
        let partial = obj(json!({"theme": {"font": 12}}));
        let merged = merge(&current, &partial);
        assert_eq!(merged, obj(json!({"theme": {"font": 12, "color": "red"}})));
    }

    #[test]
    fn merge_tombstone_does_not_create_keys() {
        let current = obj(json!({}));
        let partial = obj(json!({"a": {"b": null, "c": 1}}));
        let merged = merge(&current, &partial);
        assert_eq!(merged, obj(json!({"a": {"c": 1}})));
    }

    #[test]
    fn delta_serde_skips_empty_fields() {
        let delta = ContextDelta {
            updated: obj(json!({"font": 11})),
            ..ContextDelta::default()
        };
        let json = serde_json::to_string(&delta).unwrap();
        assert_eq!(json, r#"{"updated":{"font":11}}"#);

        let parsed: ContextDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, delta);
    }

    #[test]
    fn reset_delta_roundtrip() {
        let delta = ContextDelta::reset_of(obj(json!({"a": 1})));
        assert!(delta.is_reset());
        let json = serde_json::to_string(&delta).unwrap();
        let parsed: ContextDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, delta);
    }
}
