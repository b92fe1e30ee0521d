//! Condition evaluation for branch nodes.

use crate::scope::{MissingUpstream, Scope};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    /// The left operand matches the regular expression on the right.
    Matches,
    IsEmpty,
    IsNotEmpty,
}

impl Operator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::GreaterThanOrEqual => "greater_than_or_equal",
            Self::LessThan => "less_than",
            Self::LessThanOrEqual => "less_than_or_equal",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::Matches => "matches",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
        }
    }
}

/// Errors from evaluating a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// The operands cannot be ordered.
    NotComparable {
        operator: Operator,
        left: String,
        right: String,
    },
    /// The pattern of a `matches` condition is not a valid regex.
    InvalidPattern { pattern: String, reason: String },
    /// An operand referenced a node with no output.
    MissingUpstream(MissingUpstream),
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotComparable {
                operator,
                left,
                right,
            } => write!(
                f,
                "cannot apply '{}' to {left} and {right}",
                operator.as_str()
            ),
            Self::InvalidPattern { pattern, reason } => {
                write!(f, "invalid pattern '{pattern}': {reason}")
            }
            Self::MissingUpstream(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConditionError {}

impl From<MissingUpstream> for ConditionError {
    fn from(e: MissingUpstream) -> Self {
        Self::MissingUpstream(e)
    }
}

/// `left <operator> right`. Operands may be literals or scope references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub left: JsonValue,
    pub operator: Operator,
    /// Ignored by `is_empty` and `is_not_empty`.
    #[serde(default)]
    pub right: JsonValue,
}

impl Condition {
    #[must_use]
    pub fn new(left: JsonValue, operator: Operator, right: JsonValue) -> Self {
        Self {
            left,
            operator,
            right,
        }
    }

    /// Resolves the operands against `scope` and applies the operator.
    ///
    /// # Errors
    ///
    /// Returns an error for incomparable operands, a bad pattern, or a
    /// reference to a node without output.
    pub fn evaluate(&self, scope: &Scope<'_>) -> Result<bool, ConditionError> {
        let left = scope.resolve(&self.left)?;
        let right = scope.resolve(&self.right)?;
        apply(self.operator, &left, &right)
    }
}

fn apply(operator: Operator, left: &JsonValue, right: &JsonValue) -> Result<bool, ConditionError> {
    match operator {
        Operator::Equals => Ok(loosely_equal(left, right)),
        Operator::NotEquals => Ok(!loosely_equal(left, right)),
        Operator::GreaterThan => Ok(compare(operator, left, right)? == Ordering::Greater),
        Operator::GreaterThanOrEqual => Ok(compare(operator, left, right)? != Ordering::Less),
        Operator::LessThan => Ok(compare(operator, left, right)? == Ordering::Less),
        Operator::LessThanOrEqual => Ok(compare(operator, left, right)? != Ordering::Greater),
        Operator::Contains => Ok(contains(left, right)),
        Operator::NotContains => Ok(!contains(left, right)),
        Operator::Matches => matches_pattern(left, right),
        Operator::IsEmpty => Ok(is_empty(left)),
        Operator::IsNotEmpty => Ok(!is_empty(left)),
    }
}

/// Numbers, and strings holding numbers, compare numerically.
fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(left: &JsonValue, right: &JsonValue) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}

fn compare(
    operator: Operator,
    left: &JsonValue,
    right: &JsonValue,
) -> Result<Ordering, ConditionError> {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right))
        && let Some(ordering) = l.partial_cmp(&r)
    {
        return Ok(ordering);
    }
    if let (JsonValue::String(l), JsonValue::String(r)) = (left, right) {
        return Ok(l.cmp(r));
    }
    Err(ConditionError::NotComparable {
        operator,
        left: left.to_string(),
        right: right.to_string(),
    })
}

fn text_of(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn contains(haystack: &JsonValue, needle: &JsonValue) -> bool {
    match haystack {
        JsonValue::String(s) => s.contains(&text_of(needle)),
        JsonValue::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        JsonValue::Object(map) => map.contains_key(&text_of(needle)),
        _ => false,
    }
}

fn matches_pattern(value: &JsonValue, pattern: &JsonValue) -> Result<bool, ConditionError> {
    let pattern = text_of(pattern);
    let regex = Regex::new(&pattern).map_err(|e| ConditionError::InvalidPattern {
        pattern: pattern.clone(),
        reason: e.to_string(),
    })?;
    Ok(regex.is_match(&text_of(value)))
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serde_json::map::Map;

    fn eval(left: JsonValue, operator: Operator, right: JsonValue) -> Result<bool, ConditionError> {
        let trigger = json!({"count": 5, "tags": ["a", "b"], "name": "flowgate"});
        let upstream = Map::new();
        Condition::new(left, operator, right).evaluate(&Scope::new(&trigger, &upstream))
    }

    #[test]
    fn numeric_comparisons() {
        assert_eq!(eval(json!(5), Operator::GreaterThan, json!(3)), Ok(true));
        assert_eq!(eval(json!(3), Operator::GreaterThan, json!(5)), Ok(false));
        assert_eq!(eval(json!("5"), Operator::GreaterThanOrEqual, json!(5)), Ok(true));
        assert_eq!(eval(json!(2.5), Operator::LessThan, json!(3)), Ok(true));
        assert_eq!(eval(json!(3), Operator::LessThanOrEqual, json!(3.0)), Ok(true));
    }

    #[test]
    fn references_resolve_before_comparison() {
        assert_eq!(
            eval(json!("$trigger.count"), Operator::GreaterThan, json!(3)),
            Ok(true)
        );
        assert_eq!(
            eval(json!("$trigger.count"), Operator::Equals, json!("5")),
            Ok(true)
        );
    }

    #[test]
    fn string_ordering_is_lexicographic() {
        assert_eq!(eval(json!("apple"), Operator::LessThan, json!("banana")), Ok(true));
    }

    #[test]
    fn incomparable_operands_error() {
        let err = eval(json!({"a": 1}), Operator::GreaterThan, json!(1)).unwrap_err();
        assert!(matches!(err, ConditionError::NotComparable { .. }));
    }

    #[test]
    fn containment() {
        assert_eq!(eval(json!("$trigger.tags"), Operator::Contains, json!("b")), Ok(true));
        assert_eq!(eval(json!("$trigger.name"), Operator::Contains, json!("gate")), Ok(true));
        assert_eq!(eval(json!({"k": 1}), Operator::Contains, json!("k")), Ok(true));
        assert_eq!(eval(json!("$trigger.tags"), Operator::NotContains, json!("z")), Ok(true));
    }

    #[test]
    fn regex_match() {
        assert_eq!(
            eval(json!("order-1234"), Operator::Matches, json!(r"^order-\d+$")),
            Ok(true)
        );
        let err = eval(json!("x"), Operator::Matches, json!("(")).unwrap_err();
        assert!(matches!(err, ConditionError::InvalidPattern { .. }));
    }

    #[test]
    fn emptiness() {
        assert_eq!(eval(json!(""), Operator::IsEmpty, JsonValue::Null), Ok(true));
        assert_eq!(eval(json!([]), Operator::IsEmpty, JsonValue::Null), Ok(true));
        assert_eq!(eval(json!("$trigger.absent"), Operator::IsEmpty, JsonValue::Null), Ok(true));
        assert_eq!(eval(json!(0), Operator::IsNotEmpty, JsonValue::Null), Ok(true));
    }

    #[test]
    fn equality_does_not_coerce_non_numbers() {
        assert_eq!(eval(json!(true), Operator::Equals, json!("true")), Ok(false));
        assert_eq!(eval(json!("a"), Operator::NotEquals, json!("b")), Ok(true));
    }

    #[test]
    fn deserializes_from_json() {
        let condition: Condition = serde_json::from_value(json!({
            "left": "$trigger.count",
            "operator": "greater_than",
            "right": 3
        }))
        .expect("deserialize");
        assert_eq!(condition.operator, Operator::GreaterThan);
    }
}
