//! Core identity types shared across the graph, scheduler, and checkpointer layers.
//!
//! # Key Types
//!
//! - [`NodeKind`]: identifies a node within a compiled graph
//! - [`NodeRole`]: the behavioural category of a node (`user` / `agent` / `prep`)
//! - [`ReducerKind`]: how concurrent writers to one state field merge

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a node within a workflow graph.
///
/// `Start` and `End` are virtual sentinels: they are never registered with
/// [`crate::graphs::GraphBuilder::add_node`] and never executed by the
/// scheduler, but they may appear as edge endpoints describing graph entry
/// and termination.
///
/// # Examples
///
/// ```rust
/// use stepgraph::types::NodeKind;
///
/// let processor = NodeKind::Custom("DataProcessor".to_string());
/// let encoded = processor.encode();
/// let decoded = NodeKind::decode(&encoded);
/// assert_eq!(processor, decoded);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Virtual entry sentinel; the initial frontier of every execution.
    Start,
    /// Virtual terminal sentinel; a branch reaching `End` is finished.
    End,
    /// A user-registered node, named uniquely within its graph.
    Custom(String),
}

impl NodeKind {
    /// Encode to the stable string form used by persistence and logging.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            NodeKind::Start => "Start".to_string(),
            NodeKind::End => "End".to_string(),
            NodeKind::Custom(s) => format!("Custom:{s}"),
        }
    }

    /// Decode the string form produced by [`Self::encode`].
    ///
    /// Unrecognized encodings round-trip as `Custom(s)` so that checkpoints
    /// written by a newer encoding remain loadable.
    pub fn decode(s: &str) -> Self {
        if s == "Start" {
            NodeKind::Start
        } else if s == "End" {
            NodeKind::End
        } else if let Some(rest) = s.strip_prefix("Custom:") {
            NodeKind::Custom(rest.to_string())
        } else {
            NodeKind::Custom(s.to_string())
        }
    }

    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    #[must_use]
    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }

    /// The node's bare name, without the `Custom:` persistence prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            NodeKind::Start => "Start",
            NodeKind::End => "End",
            NodeKind::Custom(s) => s.as_str(),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::End => write!(f, "End"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl From<&str> for NodeKind {
    fn from(s: &str) -> Self {
        match s {
            "Start" => NodeKind::Start,
            "End" => NodeKind::End,
            other => NodeKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        NodeKind::from(s.as_str())
    }
}

/// The behavioural category of a node (data model §3: `kind ∈ {user, agent, prep}`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// An ordinary user-authored function node.
    User,
    /// A node whose body delegates to an external agent provider (§4.G).
    Agent,
    /// A preparatory/plumbing node spliced in by the executor.
    Prep,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::User => write!(f, "user"),
            NodeRole::Agent => write!(f, "agent"),
            NodeRole::Prep => write!(f, "prep"),
        }
    }
}

/// Merge rule associated with a state field (§3 Channel).
///
/// `LastValue` is the default: the last writer in a super-step wins, and
/// more than one writer to the same field in one super-step is a fatal
/// `DuplicateWrite`. `Append` (a "Topic" channel) concatenates every
/// writer's contribution in ascending node-id order; concurrent writers
/// never conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerKind {
    LastValue,
    Append,
}

impl Default for ReducerKind {
    fn default() -> Self {
        ReducerKind::LastValue
    }
}

impl fmt::Display for ReducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReducerKind::LastValue => write!(f, "last_value"),
            ReducerKind::Append => write!(f, "append"),
        }
    }
}

/// Opaque identifier grouping a linear sequence of checkpoints.
pub type ThreadId = String;

/// Monotonically increasing super-step counter within one execution.
pub type StepNumber = u64;

/// Name of a field in the state schema.
pub type FieldName = String;
