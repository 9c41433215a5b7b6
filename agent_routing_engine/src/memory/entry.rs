//! Memory entries, keys and layer identifiers.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime};

/// The four memory tiers, in lookup order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    ShortTerm,
    MediumTerm,
    LongTerm,
    Semantic,
}

impl LayerKind {
    pub const LOOKUP_ORDER: [LayerKind; 4] = [
        LayerKind::ShortTerm,
        LayerKind::MediumTerm,
        LayerKind::LongTerm,
        LayerKind::Semantic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::MediumTerm => "medium_term",
            Self::LongTerm => "long_term",
            Self::Semantic => "semantic",
        }
    }

    /// The next longer-lived layer, target of promotion.
    pub fn promotes_to(&self) -> Option<LayerKind> {
        match self {
            Self::ShortTerm => Some(Self::MediumTerm),
            Self::MediumTerm => Some(Self::LongTerm),
            Self::LongTerm => Some(Self::Semantic),
            Self::Semantic => None,
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content hash of a function name and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryKey(String);

impl MemoryKey {
    pub fn for_call(function_name: &str, parameters: &Value) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(function_name.as_bytes());
        hasher.update(&[0]);
        let mut canonical = String::new();
        write_canonical(parameters, &mut canonical);
        hasher.update(canonical.as_bytes());
        Self(format!("call:{}", hasher.finalize().to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for MemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize with object keys sorted regardless of the map implementation.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Observable lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Created,
    Fresh,
    Stale,
}

/// A cached tool call result.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub key: MemoryKey,
    pub function_name: String,
    pub parameters: Value,
    pub value: Value,
    pub context: Option<Value>,
    pub layer: LayerKind,
    pub agent_name: String,
    pub exec_time_ms: u64,
    pub created_at: SystemTime,
    pub last_accessed_at: SystemTime,
    pub access_count: u64,
    pub ttl: Option<Duration>,
}

impl MemoryEntry {
    pub fn new(
        function_name: impl Into<String>,
        parameters: Value,
        value: Value,
        agent_name: impl Into<String>,
        now: SystemTime,
    ) -> Self {
        let function_name = function_name.into();
        Self {
            key: MemoryKey::for_call(&function_name, &parameters),
            function_name,
            parameters,
            value,
            context: None,
            layer: LayerKind::ShortTerm,
            agent_name: agent_name.into(),
            exec_time_ms: 0,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            ttl: None,
        }
    }

    pub fn with_context(mut self, context: Option<Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_exec_time(mut self, exec_time_ms: u64) -> Self {
        self.exec_time_ms = exec_time_ms;
        self
    }

    /// Re-home the entry into `layer`; the copy starts a fresh lifetime there.
    pub fn placed_in(mut self, layer: LayerKind, ttl: Option<Duration>, now: SystemTime) -> Self {
        self.layer = layer;
        self.ttl = ttl;
        self.created_at = now;
        self.last_accessed_at = now;
        self.access_count = 0;
        self
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.ttl.map(|ttl| self.created_at + ttl)
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        match self.expires_at() {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }

    pub fn state(&self, now: SystemTime) -> EntryState {
        if !self.is_fresh(now) {
            EntryState::Stale
        } else if self.access_count == 0 {
            EntryState::Created
        } else {
            EntryState::Fresh
        }
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or_default()
    }

    pub fn touch(&mut self, now: SystemTime) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }
}

/// A fresh lookup result.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub key: MemoryKey,
    pub value: Value,
    pub layer: LayerKind,
    #[serde(with = "duration_ms")]
    pub age: Duration,
    pub agent_name: String,
    pub access_count: u64,
    /// True when the short-term layer matched a near-duplicate rather than the exact key.
    pub fuzzy: bool,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_stable_and_order_insensitive() {
        let a = MemoryKey::for_call("f", &json!({"x": 1, "y": "a"}));
        let b = MemoryKey::for_call("f", &json!({"y": "a", "x": 1}));
        let c = MemoryKey::for_call("g", &json!({"x": 1, "y": "a"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("call:"));
    }

    #[test]
    fn test_entry_freshness_boundary() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let entry = MemoryEntry::new("f", json!({}), json!(1), "a", now).placed_in(
            LayerKind::ShortTerm,
            Some(Duration::from_secs(10)),
            now,
        );
        assert!(entry.is_fresh(now + Duration::from_secs(9)));
        assert!(!entry.is_fresh(now + Duration::from_secs(10)));
        assert_eq!(entry.state(now + Duration::from_secs(11)), EntryState::Stale);
        assert_eq!(entry.state(now), EntryState::Created);
    }

    #[test]
    fn test_touch_moves_to_fresh() {
        let now = SystemTime::UNIX_EPOCH;
        let mut entry = MemoryEntry::new("f", json!({}), json!(1), "a", now);
        entry.touch(now + Duration::from_secs(1));
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.state(now), EntryState::Fresh);
        assert_eq!(entry.last_accessed_at, now + Duration::from_secs(1));
    }

    #[test]
    fn test_promotion_chain_ends_at_semantic() {
        assert_eq!(LayerKind::ShortTerm.promotes_to(), Some(LayerKind::MediumTerm));
        assert_eq!(LayerKind::LongTerm.promotes_to(), Some(LayerKind::Semantic));
        assert_eq!(LayerKind::Semantic.promotes_to(), None);
    }
}
