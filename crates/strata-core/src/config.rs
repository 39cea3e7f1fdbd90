//! Call-scoped configuration.
//!
//! A small string-keyed store with typed getters and caller-supplied
//! defaults. The metastore core consumes only a handful of keys (e.g. the
//! task lease timeout); backends may stash their own keys here as well.

use serde_json::Value;
use std::collections::BTreeMap;

/// String-keyed configuration values with typed access.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationStore {
    values: BTreeMap<String, Value>,
}

impl ConfigurationStore {
    /// Creates an empty configuration store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a configuration value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Returns an integer value, or `default` when absent or mistyped.
    #[must_use]
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    /// Returns a boolean value, or `default` when absent or mistyped.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Returns a string value, or `default` when absent or mistyped.
    #[must_use]
    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
    }
}
