//! Edge types for workflow graphs.
//!
//! An edge is a dependency: the target runs only after the source reaches a
//! terminal state. Edges leaving a condition node carry the branch label
//! that makes them live.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two outcomes of a condition node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    True,
    False,
}

impl Branch {
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
        }
    }

    /// Parses the label stored in a condition step's output.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "true" => Some(Self::True),
            "false" => Some(Self::False),
            _ => None,
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependency between two nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Set on edges leaving a condition node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

impl Edge {
    /// An unconditional dependency.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live only when the source condition evaluates to true.
    #[must_use]
    pub fn on_true() -> Self {
        Self {
            branch: Some(Branch::True),
        }
    }

    /// Live only when the source condition evaluates to false.
    #[must_use]
    pub fn on_false() -> Self {
        Self {
            branch: Some(Branch::False),
        }
    }

    /// Whether this edge carries execution given the source's emitted branch.
    #[must_use]
    pub fn follows(&self, emitted: Option<Branch>) -> bool {
        match self.branch {
            None => true,
            Some(label) => emitted == Some(label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconditional_edge_always_follows() {
        assert!(Edge::new().follows(None));
        assert!(Edge::new().follows(Some(Branch::False)));
    }

    #[test]
    fn labelled_edge_follows_matching_branch_only() {
        assert!(Edge::on_true().follows(Some(Branch::True)));
        assert!(!Edge::on_true().follows(Some(Branch::False)));
        assert!(!Edge::on_false().follows(None));
    }

    #[test]
    fn branch_labels_roundtrip_through_strings() {
        assert_eq!(Branch::parse(Branch::True.as_str()), Some(Branch::True));
        assert_eq!(Branch::parse("maybe"), None);
        assert_eq!(Branch::from_bool(false), Branch::False);
    }

    #[test]
    fn plain_edge_serializes_empty() {
        let json = serde_json::to_string(&Edge::new()).expect("serialize");
        assert_eq!(json, "{}");
    }
}
