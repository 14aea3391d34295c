//! # Pipeline Graphs
//!
//! Arena-backed activity DAGs and the builders that assemble them. Execution
//! lives in [`crate::engine`]; flow controllers in [`crate::flows`] are the
//! only producers of pipelines.

pub mod builder;
pub mod node;

pub use builder::{BuildError, ParallelChild, Pipeline, PipelineBuilder, SubPipeline, SubPipelineBuilder};
pub use node::{ActivitySpec, Node, NodeId, NodeKind};
