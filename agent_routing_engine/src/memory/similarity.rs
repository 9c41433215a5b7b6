//! Deterministic similarity measures over JSON parameters and contexts.
//!
//! * [`FuzzyMatcher`] decides whether two parameter sets are near-duplicates
//!   (short-term layer lookups).
//! * [`parameter_similarity`] grades how close two parameter sets are, in [0, 1]
//!   (nearest-neighbor parameter optimization).
//! * [`ContextFeatures`] flattens a context into categorical tokens compared with
//!   Jaccard overlap (agent scoring and neighbor selection).

use serde_json::Value;
use std::collections::BTreeSet;

use crate::settings::FuzzyConfig;

/// Near-duplicate matcher for parameter sets.
#[derive(Debug, Clone, Copy)]
pub struct FuzzyMatcher {
    numeric_epsilon: f64,
    string_similarity: f64,
}

impl FuzzyMatcher {
    pub fn new(numeric_epsilon: f64, string_similarity: f64) -> Self {
        Self {
            numeric_epsilon,
            string_similarity,
        }
    }

    pub fn from_config(config: &FuzzyConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.numeric_epsilon, config.string_similarity))
    }

    /// Returns the match strength in (0, 1] when `a` and `b` are near-duplicates.
    pub fn matches(&self, a: &Value, b: &Value) -> Option<f64> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let (x, y) = (x.as_f64()?, y.as_f64()?);
                let diff = (x - y).abs();
                if diff <= self.numeric_epsilon {
                    if self.numeric_epsilon > 0.0 {
                        Some(1.0 - 0.5 * diff / self.numeric_epsilon)
                    } else {
                        Some(1.0)
                    }
                } else {
                    None
                }
            }
            (Value::String(x), Value::String(y)) => {
                let similarity = string_similarity(x, y);
                (similarity >= self.string_similarity).then_some(similarity)
            }
            (Value::Array(xs), Value::Array(ys)) => {
                if xs.len() != ys.len() {
                    return None;
                }
                xs.iter()
                    .zip(ys)
                    .try_fold(1.0_f64, |acc, (x, y)| self.matches(x, y).map(|s| acc.min(s)))
            }
            (Value::Object(xs), Value::Object(ys)) => {
                if xs.len() != ys.len() {
                    return None;
                }
                xs.iter().try_fold(1.0_f64, |acc, (key, x)| {
                    let y = ys.get(key)?;
                    self.matches(x, y).map(|s| acc.min(s))
                })
            }
            (x, y) => (x == y).then_some(1.0),
        }
    }
}

/// Trim, lowercase and collapse internal whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized Levenshtein similarity of the normalized forms.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_text(a), normalize_text(b));
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// Graded similarity between two parameter values, in [0, 1].
pub fn parameter_similarity(a: &Value, b: &Value) -> f64 {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => {
                let scale = x.abs().max(y.abs()).max(1.0);
                (1.0 - (x - y).abs() / scale).clamp(0.0, 1.0)
            }
            _ => 0.0,
        },
        (Value::String(x), Value::String(y)) => string_similarity(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            let len = xs.len().max(ys.len());
            if len == 0 {
                return 1.0;
            }
            let total: f64 = xs.iter().zip(ys).map(|(x, y)| parameter_similarity(x, y)).sum();
            total / len as f64
        }
        (Value::Object(xs), Value::Object(ys)) => {
            let keys: BTreeSet<&String> = xs.keys().chain(ys.keys()).collect();
            if keys.is_empty() {
                return 1.0;
            }
            let total: f64 = keys
                .iter()
                .map(|key| match (xs.get(*key), ys.get(*key)) {
                    (Some(x), Some(y)) => parameter_similarity(x, y),
                    _ => 0.0,
                })
                .sum();
            total / keys.len() as f64
        }
        (x, y) => {
            if x == y {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Categorical view of an execution context: one `path=value` token per scalar leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextFeatures(BTreeSet<String>);

impl ContextFeatures {
    pub fn from_value(value: Option<&Value>) -> Self {
        let mut features = BTreeSet::new();
        if let Some(value) = value {
            flatten("", value, &mut features);
        }
        Self(features)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Jaccard overlap, in [0, 1].
    pub fn jaccard(&self, other: &ContextFeatures) -> f64 {
        if self.0.is_empty() && other.0.is_empty() {
            return 1.0;
        }
        let intersection = self.0.intersection(&other.0).count();
        let union = self.0.union(&other.0).count();
        intersection as f64 / union as f64
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        Value::Array(items) => {
            let path = format!("{}[]", prefix);
            for item in items {
                flatten(&path, item, out);
            }
        }
        Value::String(s) => {
            out.insert(format!("{}={}", prefix, normalize_text(s)));
        }
        Value::Null => {}
        other => {
            out.insert(format!("{}={}", prefix, other));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fuzzy_numbers_within_epsilon() {
        let matcher = FuzzyMatcher::new(0.01, 0.9);
        assert!(matcher.matches(&json!({"x": 1.0}), &json!({"x": 1.005})).is_some());
        assert!(matcher.matches(&json!({"x": 1.0}), &json!({"x": 1.02})).is_none());
        assert!(matcher.matches(&json!({"x": 1}), &json!({"x": 2})).is_none());
    }

    #[test]
    fn test_fuzzy_strings_normalized() {
        let matcher = FuzzyMatcher::new(0.0, 0.9);
        assert_eq!(
            matcher.matches(&json!({"q": "  ATGC  gene "}), &json!({"q": "atgc gene"})),
            Some(1.0)
        );
        assert!(matcher.matches(&json!({"q": "sequence"}), &json!({"q": "protein"})).is_none());
    }

    #[test]
    fn test_fuzzy_requires_same_shape() {
        let matcher = FuzzyMatcher::new(0.1, 0.9);
        assert!(matcher.matches(&json!({"x": 1}), &json!({"x": 1, "y": 2})).is_none());
        assert!(matcher.matches(&json!([1, 2]), &json!([1])).is_none());
        assert!(matcher.matches(&json!(true), &json!(false)).is_none());
    }

    #[test]
    fn test_parameter_similarity_grades() {
        let same = parameter_similarity(&json!({"a": 1, "b": "x"}), &json!({"a": 1, "b": "x"}));
        assert!((same - 1.0).abs() < 1e-9);

        let partial = parameter_similarity(&json!({"a": 1}), &json!({"a": 1, "b": 2}));
        assert!((partial - 0.5).abs() < 1e-9);

        let disjoint = parameter_similarity(&json!({"a": 1}), &json!({"b": 1}));
        assert_eq!(disjoint, 0.0);
    }

    #[test]
    fn test_context_features_jaccard() {
        let a = ContextFeatures::from_value(Some(&json!({"view": "Track", "organism": "ecoli"})));
        let b = ContextFeatures::from_value(Some(&json!({"view": "track", "organism": "yeast"})));
        assert_eq!(a.len(), 2);
        assert!((a.jaccard(&b) - 1.0 / 3.0).abs() < 1e-9);
        assert!((a.jaccard(&a) - 1.0).abs() < 1e-9);
        assert!(ContextFeatures::from_value(None).is_empty());
    }
}
