//! Masking and stripping of sensitive fields before payloads are logged
//! or stored.
//!
//! The filter keeps a case-insensitive deny-list of field names that is
//! extensible at runtime. Two operations walk a JSON tree: [`SensitiveFilter::mask`]
//! replaces matching values with partially-obscured strings, and
//! [`SensitiveFilter::strip_for_log`] omits matching fields entirely.

use dashmap::DashSet;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Field names treated as sensitive out of the box (matched case-insensitively).
const DEFAULT_DENY_LIST: &[&str] = &[
    "password",
    "passwd",
    "token",
    "api_key",
    "apikey",
    "secret",
    "cvv",
    "pin",
    "ssn",
    "credit_card",
    "card_number",
    "bearer_token",
    "access_token",
    "refresh_token",
    "private_key",
    "salt",
    "authorization",
];

/// A runtime-extensible deny-list filter over nested JSON payloads.
///
/// Cloning is cheap; clones share the same deny-list.
///
/// # Example
///
/// ```rust
/// use axum_idem::SensitiveFilter;
/// use serde_json::json;
///
/// let filter = SensitiveFilter::new();
/// let masked = filter.mask(&json!({"user": "ann", "password": "hunter2!"}));
/// assert_eq!(masked["user"], "ann");
/// assert_eq!(masked["password"], "hu****2!");
/// ```
#[derive(Clone)]
pub struct SensitiveFilter {
    names: Arc<DashSet<String>>,
}

impl SensitiveFilter {
    /// Creates a filter seeded with the default deny-list.
    pub fn new() -> Self {
        let names = DashSet::new();
        for name in DEFAULT_DENY_LIST {
            names.insert((*name).to_string());
        }
        Self {
            names: Arc::new(names),
        }
    }

    /// Creates an empty filter with no deny-listed names.
    pub fn empty() -> Self {
        Self {
            names: Arc::new(DashSet::new()),
        }
    }

    /// Returns true iff the field name is on the deny-list (case-insensitive).
    pub fn is_sensitive(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_lowercase())
    }

    /// Adds a field name to the deny-list.
    pub fn add(&self, name: &str) {
        self.names.insert(name.to_ascii_lowercase());
    }

    /// Removes a field name from the deny-list. Returns true iff it was present.
    pub fn remove(&self, name: &str) -> bool {
        self.names.remove(&name.to_ascii_lowercase()).is_some()
    }

    /// Recursively replaces sensitive fields with partially-obscured values.
    ///
    /// Strings of length ≤ 4 become all asterisks; longer strings keep their
    /// first and last two characters. Numbers, booleans, and nulls become
    /// `"***"`.
    pub fn mask(&self, data: &Value) -> Value {
        match data {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    if self.is_sensitive(k) {
                        out.insert(k.clone(), mask_value(v));
                    } else {
                        out.insert(k.clone(), self.mask(v));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask(v)).collect()),
            other => other.clone(),
        }
    }

    /// Recursively removes sensitive fields, for payloads headed to logs.
    pub fn strip_for_log(&self, data: &Value) -> Value {
        match data {
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    if !self.is_sensitive(k) {
                        out.insert(k.clone(), self.strip_for_log(v));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.strip_for_log(v)).collect())
            }
            other => other.clone(),
        }
    }
}

impl Default for SensitiveFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SensitiveFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensitiveFilter")
            .field("names", &self.names.len())
            .finish()
    }
}

/// Obscures a single sensitive value.
fn mask_value(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            if chars.len() <= 4 {
                Value::String("*".repeat(chars.len()))
            } else {
                let head: String = chars[..2].iter().collect();
                let tail: String = chars[chars.len() - 2..].iter().collect();
                Value::String(format!("{head}{}{tail}", "*".repeat(chars.len() - 4)))
            }
        }
        Value::Object(_) | Value::Array(_) => Value::String("***".to_string()),
        _ => Value::String("***".to_string()),
    }
}
