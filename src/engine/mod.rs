//! # Pipeline Execution Engine
//!
//! State machines, the versioned trans-data context, the durable node store,
//! and the engine that drives a pipeline through them. Flow controllers
//! build pipelines; this module runs them.

pub mod context;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod pg_store;
pub mod states;
pub mod store;

pub use context::{ContextError, TransData};
pub use engine::{PipelineEngine, RunOutcome};
pub use pg_store::PgPipelineStore;
pub use states::{InvalidTransition, NodeEvent, NodeState, PipelineState};
pub use store::{MemoryPipelineStore, NodeRecord, PipelineStore, StoreError};
