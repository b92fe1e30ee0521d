//! Strongly-typed identifiers.
//!
//! Every identifier wraps a ULID, so ids sort by creation time. The display
//! form carries a short type prefix (`run_01H...`) which is accepted, but not
//! required, when parsing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an identifier from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The identifier type that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Prefix used by the display form.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = match s.split_once('_') {
                    Some((prefix, rest)) if prefix == $prefix => rest,
                    Some((other, _)) => {
                        return Err(ParseIdError {
                            id_type: stringify!($name),
                            reason: format!("unexpected prefix '{other}'"),
                        });
                    }
                    None => s,
                };

                Ulid::from_str(raw).map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    reason: e.to_string(),
                })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifies a workflow across all of its versions.
    WorkflowId,
    "wf"
);

define_id!(
    /// Identifies one immutable version of a workflow graph.
    WorkflowVersionId,
    "wfv"
);

define_id!(
    /// Identifies one execution of a workflow version.
    RunId,
    "run"
);

define_id!(
    /// Identifies one node execution within a run.
    StepId,
    "step"
);

define_id!(
    /// Identifies a node in a workflow graph.
    NodeId,
    "node"
);

define_id!(
    /// Identifies a trigger attached to a workflow.
    TriggerId,
    "trg"
);

define_id!(
    /// Ties together every event emitted for a single run.
    CorrelationId,
    "corr"
);
