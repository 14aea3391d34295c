use std::fmt;

use crate::engine::store::StoreError;
use crate::gateway::RemoteError;
use crate::registry::ActivityError;
use crate::ticket::todo::TodoError;
use crate::topology::repository::TopologyError;

/// Top-level error type surfaced at the ticket boundary.
///
/// Component-internal errors stay in their own enums; this type is what a
/// caller driving tickets and checker runs has to match on.
#[derive(Debug)]
pub enum FlowError {
    /// A precondition failed before any pipeline was built. No state was
    /// created and the ticket submitter gets this synchronously.
    Precondition(String),
    /// Graph construction rejected the requested shape.
    Build(String),
    /// The topology repository reported an error.
    Topology(TopologyError),
    /// The durable pipeline store reported an error.
    Store(StoreError),
    /// An activity failed during execution.
    Activity(ActivityError),
    /// A remote command could not be dispatched.
    Remote(RemoteError),
    /// Todo resolution was rejected.
    Todo(TodoError),
    /// The referenced ticket, flow, or node does not exist.
    NotFound(String),
    Configuration(String),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Precondition(msg) => write!(f, "Precondition error: {msg}"),
            FlowError::Build(msg) => write!(f, "Pipeline build error: {msg}"),
            FlowError::Topology(err) => write!(f, "Topology error: {err}"),
            FlowError::Store(err) => write!(f, "Store error: {err}"),
            FlowError::Activity(err) => write!(f, "Activity error: {err}"),
            FlowError::Remote(err) => write!(f, "Remote command error: {err}"),
            FlowError::Todo(err) => write!(f, "Todo error: {err}"),
            FlowError::NotFound(msg) => write!(f, "Not found: {msg}"),
            FlowError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<TopologyError> for FlowError {
    fn from(err: TopologyError) -> Self {
        FlowError::Topology(err)
    }
}

impl From<StoreError> for FlowError {
    fn from(err: StoreError) -> Self {
        FlowError::Store(err)
    }
}

impl From<ActivityError> for FlowError {
    fn from(err: ActivityError) -> Self {
        FlowError::Activity(err)
    }
}

impl From<RemoteError> for FlowError {
    fn from(err: RemoteError) -> Self {
        FlowError::Remote(err)
    }
}

impl From<TodoError> for FlowError {
    fn from(err: TodoError) -> Self {
        FlowError::Todo(err)
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
