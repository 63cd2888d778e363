//! Merge policy for shared-state updates.
//!
//! For a key present in both the current value and the patch:
//! - two arrays: appended (deduplicated) when `concat_arrays`, else replaced
//! - two objects: merged recursively when `deep_merge`, else replaced
//! - anything else: the patch value wins
//!
//! Keys only present in the patch are inserted as-is. The top-level objects are
//! always merged key by key; `deep_merge` controls nested levels.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeOptions {
    pub deep_merge: bool,
    pub concat_arrays: bool,
}

impl MergeOptions {
    /// Top-level keys overwrite, arrays are replaced.
    pub fn shallow() -> Self {
        Self::default()
    }

    /// Nested objects merge recursively and arrays accumulate.
    pub fn deep_concat() -> Self {
        Self {
            deep_merge: true,
            concat_arrays: true,
        }
    }
}

/// Merge `patch` into `current` and return the result.
pub fn merge_values(current: Value, patch: Value, options: MergeOptions) -> Value {
    match (current, patch) {
        (Value::Object(current), Value::Object(patch)) => {
            Value::Object(merge_maps(current, patch, options))
        }
        (current, patch) => merge_entry(current, patch, options),
    }
}

fn merge_maps(mut current: Map<String, Value>, patch: Map<String, Value>, options: MergeOptions) -> Map<String, Value> {
    for (key, patch_value) in patch {
        let merged = match current.remove(&key) {
            Some(current_value) => merge_entry(current_value, patch_value, options),
            None => patch_value,
        };
        current.insert(key, merged);
    }
    current
}

fn merge_entry(current: Value, patch: Value, options: MergeOptions) -> Value {
    match (current, patch) {
        (Value::Array(mut current), Value::Array(patch)) if options.concat_arrays => {
            for item in patch {
                if !current.contains(&item) {
                    current.push(item);
                }
            }
            Value::Array(current)
        }
        (Value::Object(current), Value::Object(patch)) if options.deep_merge => {
            Value::Object(merge_maps(current, patch, options))
        }
        (_, patch) => patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn base() -> Value {
        json!({"indexed": [1, 2], "associative": {"a": 1, "b": [2, 3]}})
    }

    fn patch() -> Value {
        json!({"indexed": [3, 4], "associative": {"b": [4, 5], "c": 6}})
    }

    #[test]
    fn deep_merge_with_concatenation() {
        let merged = merge_values(base(), patch(), MergeOptions::deep_concat());
        assert_eq!(
            merged,
            json!({"indexed": [1, 2, 3, 4], "associative": {"a": 1, "b": [2, 3, 4, 5], "c": 6}})
        );
    }

    #[test]
    fn deep_merge_without_concatenation() {
        let options = MergeOptions {
            deep_merge: true,
            concat_arrays: false,
        };
        let merged = merge_values(base(), patch(), options);
        assert_eq!(
            merged,
            json!({"indexed": [3, 4], "associative": {"a": 1, "b": [4, 5], "c": 6}})
        );
    }

    #[test]
    fn shallow_merge_with_concatenation() {
        let options = MergeOptions {
            deep_merge: false,
            concat_arrays: true,
        };
        let merged = merge_values(base(), patch(), options);
        assert_eq!(
            merged,
            json!({"indexed": [1, 2, 3, 4], "associative": {"b": [4, 5], "c": 6}})
        );
    }

    #[test]
    fn shallow_merge_without_concatenation() {
        let merged = merge_values(base(), patch(), MergeOptions::shallow());
        assert_eq!(merged, patch());
    }

    #[test]
    fn empty_current_takes_patch() {
        let merged = merge_values(
            json!({"indexed": [], "associative": {}}),
            json!({"indexed": [1, 2], "associative": {"a": 1}}),
            MergeOptions::deep_concat(),
        );
        assert_eq!(merged, json!({"indexed": [1, 2], "associative": {"a": 1}}));
    }

    #[test]
    fn mismatched_types_and_nulls_take_patch() {
        let merged = merge_values(
            json!({"a": null, "b": [1, 2], "c": 1}),
            json!({"a": [3, 4], "b": null, "c": [5]}),
            MergeOptions::deep_concat(),
        );
        assert_eq!(merged, json!({"a": [3, 4], "b": null, "c": [5]}));
    }

    #[test]
    fn concatenation_skips_values_already_present() {
        let merged = merge_values(
            json!({"ids": [1, 2]}),
            json!({"ids": [2, 3, 3]}),
            MergeOptions::deep_concat(),
        );
        assert_eq!(merged, json!({"ids": [1, 2, 3]}));
    }

    fn small_map() -> impl Strategy<Value = Map<String, Value>> {
        prop::collection::btree_map("[a-d]", 0i64..5, 0..4).prop_map(|m| {
            m.into_iter()
                .map(|(k, v)| (k, json!([v])))
                .collect::<Map<String, Value>>()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: patches to disjoint keys can be grouped either way under deep+concat.
        #[test]
        fn deep_concat_is_associative_for_disjoint_keys(
            a in small_map(),
            b in small_map(),
            c in small_map(),
        ) {
            let namespaced = |prefix: &str, m: &Map<String, Value>| {
                Value::Object(m.iter().map(|(k, v)| (format!("{prefix}{k}"), v.clone())).collect())
            };
            let (a, b, c) = (namespaced("a_", &a), namespaced("b_", &b), namespaced("c_", &c));
            let opts = MergeOptions::deep_concat();

            let left = merge_values(merge_values(a.clone(), b.clone(), opts), c.clone(), opts);
            let right = merge_values(a, merge_values(b, c, opts), opts);
            prop_assert_eq!(left, right);
        }

        /// Property: a shallow merge keeps the most recent patch's value for every overlapping key.
        #[test]
        fn shallow_merge_keeps_latest_patch(
            patches in prop::collection::vec(small_map(), 1..5),
        ) {
            let mut state = json!({});
            for patch in &patches {
                state = merge_values(state, Value::Object(patch.clone()), MergeOptions::shallow());
            }

            let state = state.as_object().cloned().unwrap_or_default();
            for (key, value) in &state {
                let latest = patches.iter().rev().find_map(|p| p.get(key)).unwrap();
                prop_assert_eq!(value, latest);
            }
        }
    }
}
