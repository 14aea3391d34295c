//! Pipeline node arena types.
//!
//! A pipeline is a tree of nodes held in a flat arena and addressed by
//! generated ids, keeping the whole structure serializable for durability.
//! A node's payload is a single activity, an unordered parallel group, an
//! owned child chain (sub-pipeline), or a pause gate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::registry::StepCode;

/// Arena index of a node, stable across rebuilds of the same pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub(crate) fn offset(self, by: u32) -> Self {
        Self(self.0 + by)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declaration of one activity node: step code plus per-node kwargs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySpec {
    pub name: String,
    pub step: StepCode,
    pub kwargs: Value,
    /// When set, the node runs only if the most recent branch code reported
    /// on its chain equals this value; otherwise it is skipped.
    pub gate: Option<i32>,
    /// A best-effort node's failure is recorded but does not fail its chain
    /// or parallel group.
    pub best_effort: bool,
}

impl ActivitySpec {
    pub fn new(name: impl Into<String>, step: StepCode, kwargs: Value) -> Self {
        Self {
            name: name.into(),
            step,
            kwargs,
            gate: None,
            best_effort: false,
        }
    }

    pub fn gated(mut self, code: i32) -> Self {
        self.gate = Some(code);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    Activity(ActivitySpec),
    /// Unordered group: all children must complete before the next
    /// sequential node starts
    Parallel { children: Vec<NodeId> },
    /// Owned child chain executing as one node
    SubPipeline { chain: Vec<NodeId> },
    /// Human checkpoint: parks the pipeline until the attached todo resolves
    Pause,
}

impl NodeKind {
    pub(crate) fn offset_children(&mut self, by: u32) {
        match self {
            NodeKind::Parallel { children } => {
                for child in children {
                    *child = child.offset(by);
                }
            }
            NodeKind::SubPipeline { chain } => {
                for node in chain {
                    *node = node.offset(by);
                }
            }
            NodeKind::Activity(_) | NodeKind::Pause => {}
        }
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, NodeKind::Pause)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
}
