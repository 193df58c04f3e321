//! Feature-flag cache
//!
//! Holds the last-seen flag map in memory, hydrated from the persisted decide
//! response on construction and replaced wholesale on each successful refresh.
//! A failed refresh or unparseable response leaves the previous cache intact.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::store::Store;
use crate::transport::Transport;

/// A decoded flag variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    /// Boolean flag (enabled / disabled)
    Bool(bool),
    /// Multivariate flag carrying a string label
    Text(String),
}

/// In-memory flag-key → variant cache
pub struct FlagCache {
    flags: RwLock<HashMap<String, FlagValue>>,
}

impl FlagCache {
    /// Build a cache hydrated from the blob persisted in the store.
    pub fn from_store(store: &Store) -> Self {
        let cache = Self {
            flags: RwLock::new(HashMap::new()),
        };

        match store.feature_flags() {
            Ok(Some(blob)) if !blob.is_empty() && blob != "{}" => {
                cache.replace_from_response(&blob);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "failed to load cached feature flags");
            }
        }

        cache
    }

    /// Refresh the cache from the decide endpoint.
    ///
    /// On a 2xx response the whole cache is replaced and the raw blob is
    /// persisted. Returns false on transport or parse failure, leaving the
    /// cache unchanged.
    pub fn reload(
        &self,
        transport: &Transport,
        store: &Store,
        distinct_id: &str,
        properties: &Value,
    ) -> bool {
        let response = transport.post_decide(distinct_id, properties);
        if !response.success || response.body.is_empty() {
            return false;
        }

        if !self.replace_from_response(&response.body) {
            return false;
        }

        if let Err(err) = store.set_feature_flags(&response.body) {
            tracing::error!(error = %err, "failed to persist feature flags");
        }
        true
    }

    /// True iff the flag resolves to boolean true or a non-empty variant label.
    pub fn is_enabled(&self, key: &str) -> bool {
        match self.flags.read().unwrap().get(key) {
            Some(FlagValue::Bool(b)) => *b,
            Some(FlagValue::Text(s)) => !s.is_empty(),
            None => false,
        }
    }

    /// String form of the flag value; empty string if absent.
    pub fn get(&self, key: &str) -> String {
        match self.flags.read().unwrap().get(key) {
            Some(FlagValue::Bool(b)) => b.to_string(),
            Some(FlagValue::Text(s)) => s.clone(),
            None => String::new(),
        }
    }

    /// Flag payload lookup. Payload decoding is a declared extension point;
    /// this currently always returns the empty string.
    pub fn payload(&self, _key: &str) -> String {
        String::new()
    }

    /// Parse a full decide response body and replace the cache.
    ///
    /// Returns false (cache untouched) if the body is not JSON or carries no
    /// `featureFlags` object.
    fn replace_from_response(&self, body: &str) -> bool {
        let parsed: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "decide response is not valid JSON");
                return false;
            }
        };

        let Some(flags_obj) = parsed.get("featureFlags").and_then(Value::as_object) else {
            tracing::warn!("decide response has no featureFlags object");
            return false;
        };

        let mut next = HashMap::with_capacity(flags_obj.len());
        for (key, value) in flags_obj {
            match value {
                Value::Bool(b) => {
                    next.insert(key.clone(), FlagValue::Bool(*b));
                }
                Value::String(s) => {
                    next.insert(key.clone(), FlagValue::Text(s.clone()));
                }
                // Flag variants are booleans or string labels; anything else
                // in the response is not a flag value.
                _ => {
                    tracing::debug!(key = %key, "skipping non-scalar flag value");
                }
            }
        }

        *self.flags.write().unwrap() = next;
        true
    }
}
