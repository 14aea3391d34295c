//! # Pipeline Builders
//!
//! Construct directed acyclic activity graphs: strict sequential chains,
//! unordered parallel groups, and nested sub-pipelines merged in as single
//! nodes. A built [`Pipeline`] is immutable — dynamic behavior is expressed
//! through branch gates declared at build time, never by editing the graph
//! after submission.

use serde_json::Value;
use thiserror::Error;

use super::node::{ActivitySpec, Node, NodeId, NodeKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("parallel group must have at least one child")]
    EmptyParallelGroup,

    #[error("pause nodes are not allowed inside parallel groups")]
    PauseInParallel,

    #[error("pipeline has no nodes")]
    EmptyPipeline,
}

/// A fully-built child graph, ready to be nested into a parent builder.
#[derive(Debug, Clone)]
pub struct SubPipeline {
    nodes: Vec<Node>,
    chain: Vec<NodeId>,
    contains_pause: bool,
}

/// One child of a parallel group.
pub enum ParallelChild {
    Activity(ActivitySpec),
    Sub { name: String, sub: SubPipeline },
}

impl ParallelChild {
    pub fn sub(name: impl Into<String>, sub: SubPipeline) -> Self {
        Self::Sub {
            name: name.into(),
            sub,
        }
    }
}

#[derive(Debug, Default)]
struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    fn alloc(&mut self, name: String, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { id, name, kind });
        id
    }

    /// Merge a child graph into this arena, remapping its node ids, and
    /// return the remapped chain.
    fn merge(&mut self, sub: SubPipeline) -> Vec<NodeId> {
        let offset = self.nodes.len() as u32;
        for mut node in sub.nodes {
            node.id = node.id.offset(offset);
            node.kind.offset_children(offset);
            self.nodes.push(node);
        }
        sub.chain.into_iter().map(|id| id.offset(offset)).collect()
    }
}

/// Builder for a nested sub-pipeline. Same chain semantics as the top-level
/// builder, without root identity or global payload.
#[derive(Debug, Default)]
pub struct SubPipelineBuilder {
    graph: Graph,
    chain: Vec<NodeId>,
    contains_pause: bool,
}

impl SubPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_activity(&mut self, spec: ActivitySpec) -> NodeId {
        let name = spec.name.clone();
        let id = self.graph.alloc(name, NodeKind::Activity(spec));
        self.chain.push(id);
        id
    }

    pub fn add_pause(&mut self, name: impl Into<String>) -> NodeId {
        self.contains_pause = true;
        let id = self.graph.alloc(name.into(), NodeKind::Pause);
        self.chain.push(id);
        id
    }

    pub fn add_parallel(&mut self, children: Vec<ParallelChild>) -> Result<NodeId, BuildError> {
        let ids = add_parallel_children(&mut self.graph, children)?;
        let id = self
            .graph
            .alloc("parallel".to_string(), NodeKind::Parallel { children: ids });
        self.chain.push(id);
        Ok(id)
    }

    pub fn add_parallel_acts(&mut self, acts: Vec<ActivitySpec>) -> Result<NodeId, BuildError> {
        self.add_parallel(acts.into_iter().map(ParallelChild::Activity).collect())
    }

    pub fn add_sub_pipeline(&mut self, name: impl Into<String>, sub: SubPipeline) -> NodeId {
        self.contains_pause |= sub.contains_pause;
        let chain = self.graph.merge(sub);
        let id = self.graph.alloc(name.into(), NodeKind::SubPipeline { chain });
        self.chain.push(id);
        id
    }

    pub fn add_parallel_sub_pipelines(
        &mut self,
        subs: Vec<(String, SubPipeline)>,
    ) -> Result<NodeId, BuildError> {
        self.add_parallel(
            subs.into_iter()
                .map(|(name, sub)| ParallelChild::Sub { name, sub })
                .collect(),
        )
    }

    pub fn build_sub(self) -> SubPipeline {
        SubPipeline {
            nodes: self.graph.nodes,
            chain: self.chain,
            contains_pause: self.contains_pause,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

fn add_parallel_children(
    graph: &mut Graph,
    children: Vec<ParallelChild>,
) -> Result<Vec<NodeId>, BuildError> {
    if children.is_empty() {
        return Err(BuildError::EmptyParallelGroup);
    }
    let mut ids = Vec::with_capacity(children.len());
    for child in children {
        match child {
            ParallelChild::Activity(spec) => {
                let name = spec.name.clone();
                ids.push(graph.alloc(name, NodeKind::Activity(spec)));
            }
            ParallelChild::Sub { name, sub } => {
                // A parked child would leave the group join waiting on a
                // human with siblings already dispatched.
                if sub.contains_pause {
                    return Err(BuildError::PauseInParallel);
                }
                let chain = graph.merge(sub);
                ids.push(graph.alloc(name, NodeKind::SubPipeline { chain }));
            }
        }
    }
    Ok(ids)
}

/// Top-level pipeline builder carrying the root id and the global ticket
/// payload every activity sees.
pub struct PipelineBuilder {
    root_id: String,
    data: Value,
    graph: Graph,
    chain: Vec<NodeId>,
    cleanup: Vec<NodeId>,
}

impl PipelineBuilder {
    pub fn new(root_id: impl Into<String>, data: Value) -> Self {
        Self {
            root_id: root_id.into(),
            data,
            graph: Graph::default(),
            chain: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    pub fn add_activity(&mut self, spec: ActivitySpec) -> NodeId {
        let name = spec.name.clone();
        let id = self.graph.alloc(name, NodeKind::Activity(spec));
        self.chain.push(id);
        id
    }

    pub fn add_pause(&mut self, name: impl Into<String>) -> NodeId {
        let id = self.graph.alloc(name.into(), NodeKind::Pause);
        self.chain.push(id);
        id
    }

    pub fn add_parallel(&mut self, children: Vec<ParallelChild>) -> Result<NodeId, BuildError> {
        let ids = add_parallel_children(&mut self.graph, children)?;
        let id = self
            .graph
            .alloc("parallel".to_string(), NodeKind::Parallel { children: ids });
        self.chain.push(id);
        Ok(id)
    }

    pub fn add_parallel_acts(&mut self, acts: Vec<ActivitySpec>) -> Result<NodeId, BuildError> {
        self.add_parallel(acts.into_iter().map(ParallelChild::Activity).collect())
    }

    pub fn add_sub_pipeline(&mut self, name: impl Into<String>, sub: SubPipeline) -> NodeId {
        let chain = self.graph.merge(sub);
        let id = self.graph.alloc(name.into(), NodeKind::SubPipeline { chain });
        self.chain.push(id);
        id
    }

    pub fn add_parallel_sub_pipelines(
        &mut self,
        subs: Vec<(String, SubPipeline)>,
    ) -> Result<NodeId, BuildError> {
        self.add_parallel(
            subs.into_iter()
                .map(|(name, sub)| ParallelChild::Sub { name, sub })
                .collect(),
        )
    }

    /// Register a best-effort compensating activity executed when the
    /// pipeline is terminated (ephemeral grants cleanup and the like).
    pub fn add_cleanup_activity(&mut self, spec: ActivitySpec) -> NodeId {
        let name = spec.name.clone();
        let id = self
            .graph
            .alloc(name, NodeKind::Activity(spec.best_effort()));
        self.cleanup.push(id);
        id
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        if self.chain.is_empty() {
            return Err(BuildError::EmptyPipeline);
        }
        Ok(Pipeline {
            root_id: self.root_id,
            data: self.data,
            nodes: self.graph.nodes,
            chain: self.chain,
            cleanup: self.cleanup,
        })
    }
}

/// An immutable, fully-built activity graph. No structural mutation is
/// possible once a pipeline is handed to the engine.
#[derive(Debug, Clone)]
pub struct Pipeline {
    root_id: String,
    data: Value,
    nodes: Vec<Node>,
    chain: Vec<NodeId>,
    cleanup: Vec<NodeId>,
}

impl Pipeline {
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn chain(&self) -> &[NodeId] {
        &self.chain
    }

    pub fn cleanup(&self) -> &[NodeId] {
        &self.cleanup
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Activity nodes in arena order, for inspection and tests.
    pub fn activity_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Activity(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StepCode;
    use serde_json::json;

    fn spec(name: &str) -> ActivitySpec {
        ActivitySpec::new(name, StepCode::DbMeta, json!({}))
    }

    #[test]
    fn test_sequential_chain_preserves_order() {
        let mut builder = PipelineBuilder::new("root-1", json!({}));
        let a = builder.add_activity(spec("first"));
        let b = builder.add_activity(spec("second"));
        let pipeline = builder.build().unwrap();
        assert_eq!(pipeline.chain(), &[a, b]);
        assert!(a < b);
    }

    #[test]
    fn test_sub_pipeline_merge_remaps_ids() {
        let mut sub = SubPipelineBuilder::new();
        let inner_first = sub.add_activity(spec("inner-first"));
        sub.add_activity(spec("inner-second"));
        assert_eq!(inner_first, NodeId(0));

        let mut builder = PipelineBuilder::new("root-1", json!({}));
        builder.add_activity(spec("outer"));
        let sub_id = builder.add_sub_pipeline("nested", sub.build_sub());
        let pipeline = builder.build().unwrap();

        let NodeKind::SubPipeline { chain } = &pipeline.node(sub_id).kind else {
            panic!("expected sub-pipeline node");
        };
        // Inner ids were shifted past the outer activity's id.
        assert_eq!(chain.len(), 2);
        assert!(chain.iter().all(|id| *id != NodeId(0)));
        assert_eq!(pipeline.node(chain[0]).name, "inner-first");
    }

    #[test]
    fn test_empty_parallel_group_rejected() {
        let mut builder = PipelineBuilder::new("root-1", json!({}));
        assert_eq!(
            builder.add_parallel(vec![]).unwrap_err(),
            BuildError::EmptyParallelGroup
        );
    }

    #[test]
    fn test_pause_inside_parallel_rejected() {
        let mut sub = SubPipelineBuilder::new();
        sub.add_pause("confirm");
        let mut builder = PipelineBuilder::new("root-1", json!({}));
        let err = builder
            .add_parallel(vec![ParallelChild::sub("child", sub.build_sub())])
            .unwrap_err();
        assert_eq!(err, BuildError::PauseInParallel);
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let builder = PipelineBuilder::new("root-1", json!({}));
        assert_eq!(builder.build().unwrap_err(), BuildError::EmptyPipeline);
    }
}
