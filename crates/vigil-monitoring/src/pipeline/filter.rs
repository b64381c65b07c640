//! Payload sanitization.
//!
//! Host-supplied capture data is untrusted: it may carry credentials and it
//! may be arbitrarily large or deep. The filter redacts sensitive keys,
//! truncates oversized strings, and prunes past a depth cap before anything
//! is queued.

use serde_json::Value;

/// Replacement for values under sensitive keys.
pub const REDACTED: &str = "[redacted]";
/// Suffix appended to truncated strings.
pub const TRUNCATED_SUFFIX: &str = "…[truncated]";

/// Sanitizer configuration.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Case-insensitive substrings; any object key containing one has its
    /// value redacted.
    pub sensitive_keys: Vec<String>,
    /// Strings longer than this (in characters) are truncated.
    pub max_string_len: usize,
    /// Nesting depth beyond which values are pruned.
    pub max_depth: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            sensitive_keys: [
                "password",
                "passwd",
                "secret",
                "token",
                "api_key",
                "apikey",
                "auth",
                "credential",
                "private_key",
                "session",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_string_len: 2048,
            max_depth: 8,
        }
    }
}

impl FilterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensitive_key(mut self, key: impl Into<String>) -> Self {
        self.sensitive_keys.push(key.into().to_lowercase());
        self
    }

    pub fn with_max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = len.max(1);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }
}

/// Strips credentials and bounds payload size before queueing.
#[derive(Debug, Clone, Default)]
pub struct DataFilter {
    config: FilterConfig,
}

impl DataFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Sanitize a payload tree.
    pub fn sanitize(&self, value: Value) -> Value {
        self.sanitize_at(value, 0)
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.config.sensitive_keys.iter().any(|s| key.contains(s))
    }

    fn sanitize_at(&self, value: Value, depth: usize) -> Value {
        if depth >= self.config.max_depth {
            return Value::String(REDACTED.to_string());
        }
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, val) in map {
                    if self.is_sensitive(&key) {
                        out.insert(key, Value::String(REDACTED.to_string()));
                    } else {
                        out.insert(key, self.sanitize_at(val, depth + 1));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.sanitize_at(v, depth + 1))
                    .collect(),
            ),
            Value::String(s) => {
                if s.chars().count() > self.config.max_string_len {
                    let truncated: String = s.chars().take(self.config.max_string_len).collect();
                    Value::String(format!("{truncated}{TRUNCATED_SUFFIX}"))
                } else {
                    Value::String(s)
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_sensitive_keys_case_insensitively() {
        let filter = DataFilter::default();
        let out = filter.sanitize(json!({
            "user": "alice",
            "Password": "hunter2",
            "API_KEY": "abc123",
            "nested": { "auth_token": "xyz" }
        }));

        assert_eq!(out["user"], "alice");
        assert_eq!(out["Password"], REDACTED);
        assert_eq!(out["API_KEY"], REDACTED);
        assert_eq!(out["nested"]["auth_token"], REDACTED);
    }

    #[test]
    fn truncates_oversized_strings() {
        let filter = DataFilter::new(FilterConfig::new().with_max_string_len(5));
        let out = filter.sanitize(json!({ "note": "abcdefghij" }));
        assert_eq!(out["note"], format!("abcde{TRUNCATED_SUFFIX}"));

        // Short strings pass through untouched.
        let out = filter.sanitize(json!({ "note": "abc" }));
        assert_eq!(out["note"], "abc");
    }

    #[test]
    fn prunes_beyond_the_depth_cap() {
        let filter = DataFilter::new(FilterConfig::new().with_max_depth(2));
        let out = filter.sanitize(json!({ "a": { "b": { "c": 1 } } }));
        assert_eq!(out["a"]["b"], REDACTED);
    }

    #[test]
    fn scalars_and_arrays_pass_through() {
        let filter = DataFilter::default();
        let out = filter.sanitize(json!({ "n": 42, "flag": true, "xs": [1, 2, 3] }));
        assert_eq!(out, json!({ "n": 42, "flag": true, "xs": [1, 2, 3] }));
    }
}
