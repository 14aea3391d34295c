//! Node and pipeline state machines.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: NodeState,
    pub event: NodeEvent,
}

/// Persisted state of one pipeline node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Parked on a pause gate, awaiting an external confirmation
    Paused,
    /// Gated out by a branch code; terminal, satisfies the chain
    Skipped,
}

/// Events driving node transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEvent {
    Start,
    Complete,
    Fail,
    /// Branch gate did not select this node
    Skip,
    /// Pause gate reached, todo created
    Park,
    /// Attached todo resolved with approval
    Confirm,
    /// Operator-triggered re-invocation of a failed node
    Retry,
}

impl NodeState {
    /// Check if this state satisfies the predecessor requirement of the
    /// next node in a sequential chain.
    pub fn satisfies_chain(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Apply an event, returning the target state.
    pub fn apply(self, event: NodeEvent) -> Result<NodeState, InvalidTransition> {
        let target = match (self, event) {
            (Self::Pending, NodeEvent::Start) => Self::Running,
            (Self::Pending, NodeEvent::Skip) => Self::Skipped,
            (Self::Pending, NodeEvent::Park) => Self::Paused,

            (Self::Running, NodeEvent::Complete) => Self::Succeeded,
            (Self::Running, NodeEvent::Fail) => Self::Failed,

            (Self::Paused, NodeEvent::Confirm) => Self::Succeeded,
            (Self::Paused, NodeEvent::Fail) => Self::Failed,

            // Manual retry re-arms the node with its stored kwargs.
            (Self::Failed, NodeEvent::Retry) => Self::Pending,

            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(target)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("invalid node state: {s}")),
        }
    }
}

/// State of a whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    /// Parked: a pause gate or a failed node awaiting manual retry
    Paused,
    Succeeded,
    Failed,
    Terminated,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PipelineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("invalid pipeline state: {s}")),
        }
    }
}
