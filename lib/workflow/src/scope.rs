//! Data visible to a step: the trigger payload and upstream outputs.
//!
//! Strings of the form `$trigger.a.b` or `$upstream.<node>.a.b` are
//! references into the scope. Any other value is a literal.

use serde_json::Value as JsonValue;
use serde_json::map::Map;
use std::fmt;

const TRIGGER_PREFIX: &str = "$trigger";
const UPSTREAM_PREFIX: &str = "$upstream.";

/// A reference named an upstream node that has produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingUpstream {
    pub node: String,
}

impl fmt::Display for MissingUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no output recorded for upstream node '{}'", self.node)
    }
}

impl std::error::Error for MissingUpstream {}

/// Read-only view used to resolve references.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub trigger: &'a JsonValue,
    /// Outputs keyed by node name. Skipped nodes map to `null`.
    pub upstream: &'a Map<String, JsonValue>,
}

impl<'a> Scope<'a> {
    #[must_use]
    pub fn new(trigger: &'a JsonValue, upstream: &'a Map<String, JsonValue>) -> Self {
        Self { trigger, upstream }
    }

    /// Resolves every reference inside `value`, recursing into arrays and
    /// objects.
    ///
    /// # Errors
    ///
    /// Returns `MissingUpstream` when a reference names a node with no
    /// recorded output.
    pub fn resolve(&self, value: &JsonValue) -> Result<JsonValue, MissingUpstream> {
        match value {
            JsonValue::String(s) => self.resolve_str(s),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            JsonValue::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v)?);
                }
                Ok(JsonValue::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, s: &str) -> Result<JsonValue, MissingUpstream> {
        if let Some(rest) = s.strip_prefix(TRIGGER_PREFIX) {
            if rest.is_empty() {
                return Ok(self.trigger.clone());
            }
            if let Some(path) = rest.strip_prefix('.') {
                return Ok(lookup(self.trigger, path));
            }
        }

        if let Some(rest) = s.strip_prefix(UPSTREAM_PREFIX) {
            let (node, path) = rest.split_once('.').unwrap_or((rest, ""));
            let output = self.upstream.get(node).ok_or_else(|| MissingUpstream {
                node: node.to_string(),
            })?;
            return Ok(lookup(output, path));
        }

        Ok(JsonValue::String(s.to_string()))
    }
}

/// Follows a dotted path. Numeric segments index into arrays. Missing
/// segments yield `null`.
fn lookup(root: &JsonValue, path: &str) -> JsonValue {
    if path.is_empty() {
        return root.clone();
    }
    let mut current = root;
    for segment in path.split('.') {
        let next = match current {
            JsonValue::Object(map) => map.get(segment),
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return JsonValue::Null,
        }
    }
    current.clone()
}
