//! Branch conditions for routing nodes

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Patterns compiled so far, shared by every node that matches text
pub(super) fn pattern_cache() -> &'static Mutex<HashMap<String, Regex>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Regex>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Compile `pattern` once per process
pub(crate) fn compiled_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut cache = pattern_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Condition for a routing branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BranchCondition {
    /// Value equals expected
    Equals { value: Value },

    /// Value is in set of options
    In { values: Vec<Value> },

    /// String value matches regex pattern
    Matches { pattern: String },

    /// Value is truthy (non-null, non-empty, non-false, non-zero)
    IsTruthy,

    IsFalsy,

    /// Always true (catch-all branches)
    Always,
}

impl BranchCondition {
    /// Reject patterns that can never compile
    pub fn check(&self) -> Result<(), String> {
        if let BranchCondition::Matches { pattern } = self {
            compiled_pattern(pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
        }
        Ok(())
    }

    pub fn evaluate(&self, value: &Value) -> bool {
        match self {
            BranchCondition::Equals { value: expected } => value == expected,
            BranchCondition::In { values } => values.contains(value),
            BranchCondition::Matches { pattern } => match (value.as_str(), compiled_pattern(pattern)) {
                (Some(text), Ok(re)) => re.is_match(text),
                _ => false,
            },
            BranchCondition::IsTruthy => is_truthy(value),
            BranchCondition::IsFalsy => !is_truthy(value),
            BranchCondition::Always => true,
        }
    }
}

/// Truthiness used by routing and loop continue conditions
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
        Value::Null => false,
    }
}

/// Resolve a JSON pointer (`/a/b`) or a dotted path (`a.b`) against a value.
/// An empty path selects the value itself.
pub fn select<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    if path.starts_with('/') {
        return value.pointer(path);
    }
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
