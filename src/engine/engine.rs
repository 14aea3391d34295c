//! # Pipeline Engine
//!
//! Executes a built [`Pipeline`]: schedules nodes whose predecessors are
//! complete, dispatches parallel groups concurrently, persists every node
//! transition, and parks the run on pause gates and failed nodes.
//!
//! ## Execution contract
//!
//! - A node transitions `PENDING → RUNNING → {SUCCEEDED | FAILED}`; a failed
//!   node halts its chain and waits for an operator-triggered retry. There is
//!   no automatic retry: remote side effects are not assumed idempotent, so
//!   re-execution is always an explicit operator action.
//! - `RUNNING` is persisted before an activity executes and `SUCCEEDED` only
//!   after it returns, giving at-least-once semantics across crash recovery.
//!   Activities must check-then-act where they are not naturally idempotent.
//! - Termination is cooperative: it is observed between nodes, never recalls
//!   a command already dispatched to a remote system, and triggers the
//!   pipeline's registered cleanup activities best-effort.
//! - `run` is resume-safe: records in the store short-circuit completed
//!   nodes, so calling it again after a park, retry, or restart re-executes
//!   only unfinished work.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{FlowError, Result};
use crate::pipeline::{ActivitySpec, Node, NodeId, NodeKind, Pipeline};
use crate::registry::{ActivityInput, Services, StepRegistry};
use crate::ticket::{Ticket, TodoStatus, TodoType};

use super::context::TransData;
use super::states::{NodeEvent, NodeState, PipelineState};
use super::store::{NodeRecord, PipelineStore};

/// Terminal outcome of one `run` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded,
    Failed {
        /// Node the run halted at; absent when the run as a whole timed out
        node_id: Option<NodeId>,
        error: String,
    },
    /// Parked on a pause gate until the todo resolves
    Paused { node_id: NodeId, todo_id: u64 },
    Terminated,
}

enum ChainOutcome {
    Completed,
    Failed { node: NodeId, error: String },
    Paused { node: NodeId, todo_id: u64 },
    Terminated,
}

enum NodeOutcome {
    Completed { branch_code: Option<i32> },
    Skipped,
    Failed { error: String },
}

enum ChildOutcome {
    Ok,
    Failed { node: NodeId, error: String },
    Terminated,
}

pub struct PipelineEngine {
    registry: Arc<StepRegistry>,
    store: Arc<dyn PipelineStore>,
    services: Arc<Services>,
}

impl PipelineEngine {
    pub fn new(
        registry: Arc<StepRegistry>,
        store: Arc<dyn PipelineStore>,
        services: Arc<Services>,
    ) -> Self {
        Self {
            registry,
            store,
            services,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Execute the pipeline until it completes, fails, parks, or is
    /// terminated. Safe to call again on the same pipeline to resume.
    pub async fn run(&self, pipeline: &Pipeline, ticket: &Ticket) -> Result<RunOutcome> {
        let root_id = pipeline.root_id();
        match self.store.get_pipeline_state(root_id).await? {
            Some(PipelineState::Terminated) => return Ok(RunOutcome::Terminated),
            Some(PipelineState::Succeeded) => return Ok(RunOutcome::Succeeded),
            _ => {}
        }
        self.store
            .set_pipeline_state(root_id, PipelineState::Running)
            .await?;
        info!(root_id = %root_id, nodes = pipeline.node_count(), "pipeline run started");

        let trans = Mutex::new(TransData::new());
        self.replay_trans(pipeline, &trans).await?;

        let budget = std::time::Duration::from_secs(
            self.services.config.execution.max_pipeline_duration_secs,
        );
        let outcome = match tokio::time::timeout(
            budget,
            self.run_chain(pipeline, ticket, pipeline.chain(), &trans),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                let error = format!("pipeline exceeded {}s budget", budget.as_secs());
                error!(root_id = %root_id, %error, "pipeline run timed out");
                self.store
                    .set_pipeline_state(root_id, PipelineState::Failed)
                    .await?;
                return Ok(RunOutcome::Failed {
                    node_id: None,
                    error,
                });
            }
        };

        match outcome {
            ChainOutcome::Completed => {
                self.store
                    .set_pipeline_state(root_id, PipelineState::Succeeded)
                    .await?;
                info!(root_id = %root_id, "pipeline run succeeded");
                Ok(RunOutcome::Succeeded)
            }
            ChainOutcome::Failed { node, error } => {
                self.store
                    .set_pipeline_state(root_id, PipelineState::Failed)
                    .await?;
                error!(root_id = %root_id, node_id = %node, %error, "pipeline run failed");
                Ok(RunOutcome::Failed {
                    node_id: Some(node),
                    error,
                })
            }
            ChainOutcome::Paused { node, todo_id } => {
                self.store
                    .set_pipeline_state(root_id, PipelineState::Paused)
                    .await?;
                info!(root_id = %root_id, node_id = %node, todo_id, "pipeline parked");
                Ok(RunOutcome::Paused {
                    node_id: node,
                    todo_id,
                })
            }
            ChainOutcome::Terminated => {
                self.store
                    .set_pipeline_state(root_id, PipelineState::Terminated)
                    .await?;
                self.run_cleanup(pipeline).await?;
                Ok(RunOutcome::Terminated)
            }
        }
    }

    /// Continue a parked pipeline. Identical to [`Self::run`]; provided for
    /// call-site clarity.
    pub async fn resume(&self, pipeline: &Pipeline, ticket: &Ticket) -> Result<RunOutcome> {
        self.run(pipeline, ticket).await
    }

    /// Re-arm a failed node with its stored kwargs and resume the pipeline.
    pub async fn retry_node(
        &self,
        pipeline: &Pipeline,
        ticket: &Ticket,
        node_id: NodeId,
        operator: &str,
    ) -> Result<RunOutcome> {
        let root_id = pipeline.root_id();
        let mut record = self
            .store
            .get_node(root_id, node_id.0)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("node {node_id} of {root_id}")))?;

        record.state = record
            .state
            .apply(NodeEvent::Retry)
            .map_err(|e| FlowError::Precondition(e.to_string()))?;
        record.error = None;
        record.retried_by = Some(operator.to_string());
        record.updated_at = chrono::Utc::now();
        self.store.upsert_node(record).await?;
        info!(root_id = %root_id, node_id = %node_id, operator = %operator, "node re-armed for retry");

        self.run(pipeline, ticket).await
    }

    /// Mark the pipeline terminated and run registered cleanup activities.
    ///
    /// Already-dispatched remote commands are not recalled; termination only
    /// prevents further scheduling.
    pub async fn terminate(&self, pipeline: &Pipeline, operator: &str) -> Result<()> {
        let root_id = pipeline.root_id();
        self.store
            .set_pipeline_state(root_id, PipelineState::Terminated)
            .await?;
        info!(root_id = %root_id, operator = %operator, "pipeline terminated");
        self.run_cleanup(pipeline).await
    }

    async fn is_terminated(&self, root_id: &str) -> Result<bool> {
        Ok(matches!(
            self.store.get_pipeline_state(root_id).await?,
            Some(PipelineState::Terminated)
        ))
    }

    /// Replay trans-data writes of completed nodes so resumed consumers see
    /// the same context the original run produced.
    async fn replay_trans(&self, pipeline: &Pipeline, trans: &Mutex<TransData>) -> Result<()> {
        let records = self.store.list_nodes(pipeline.root_id()).await?;
        let mut guard = trans.lock();
        for record in records {
            if record.state == NodeState::Succeeded {
                for (key, value) in record.trans_writes {
                    // Accepted when first produced; owners do not change.
                    let _ = guard.write(key, value, NodeId(record.node_id));
                }
            }
        }
        Ok(())
    }

    fn run_chain<'a>(
        &'a self,
        pipeline: &'a Pipeline,
        ticket: &'a Ticket,
        chain: &'a [NodeId],
        trans: &'a Mutex<TransData>,
    ) -> BoxFuture<'a, Result<ChainOutcome>> {
        Box::pin(async move {
            let mut last_code: Option<i32> = None;
            for &node_id in chain {
                if self.is_terminated(pipeline.root_id()).await? {
                    self.mark_terminated_node(pipeline, node_id).await?;
                    return Ok(ChainOutcome::Terminated);
                }
                let node = pipeline.node(node_id);
                match &node.kind {
                    NodeKind::Activity(spec) => {
                        match self
                            .run_activity_node(pipeline, node, spec, trans, last_code)
                            .await?
                        {
                            NodeOutcome::Completed { branch_code } => {
                                if branch_code.is_some() {
                                    last_code = branch_code;
                                }
                            }
                            NodeOutcome::Skipped => {}
                            NodeOutcome::Failed { error } => {
                                if spec.best_effort {
                                    warn!(
                                        root_id = %pipeline.root_id(),
                                        node_id = %node_id,
                                        %error,
                                        "best-effort node failed, continuing"
                                    );
                                } else {
                                    return Ok(ChainOutcome::Failed {
                                        node: node_id,
                                        error,
                                    });
                                }
                            }
                        }
                    }
                    NodeKind::Pause => match self.run_pause_node(pipeline, ticket, node).await? {
                        PauseOutcome::Confirmed => {}
                        PauseOutcome::Parked { todo_id } => {
                            return Ok(ChainOutcome::Paused {
                                node: node_id,
                                todo_id,
                            })
                        }
                        PauseOutcome::Terminated => return Ok(ChainOutcome::Terminated),
                    },
                    NodeKind::Parallel { children } => {
                        match self
                            .run_parallel_group(pipeline, ticket, node, children, trans)
                            .await?
                        {
                            ChainOutcome::Completed => {}
                            other => return Ok(other),
                        }
                    }
                    NodeKind::SubPipeline { chain: sub_chain } => {
                        match self
                            .run_sub_node(pipeline, ticket, node, sub_chain, trans)
                            .await?
                        {
                            ChainOutcome::Completed => {}
                            other => return Ok(other),
                        }
                    }
                }
            }
            Ok(ChainOutcome::Completed)
        })
    }

    /// Record the node a terminated pipeline halted in front of.
    async fn mark_terminated_node(&self, pipeline: &Pipeline, node_id: NodeId) -> Result<()> {
        let root_id = pipeline.root_id();
        let node = pipeline.node(node_id);
        let mut record = match self.store.get_node(root_id, node_id.0).await? {
            Some(record) if record.state.is_terminal() => return Ok(()),
            Some(record) => record,
            None => NodeRecord::new(root_id, node_id.0, &node.name),
        };
        record.state = NodeState::Failed;
        record.error = Some("pipeline terminated".to_string());
        record.updated_at = chrono::Utc::now();
        self.store.upsert_node(record).await
        .map_err(FlowError::from)
    }

    async fn run_activity_node(
        &self,
        pipeline: &Pipeline,
        node: &Node,
        spec: &ActivitySpec,
        trans: &Mutex<TransData>,
        last_code: Option<i32>,
    ) -> Result<NodeOutcome> {
        let root_id = pipeline.root_id();
        let existing = self.store.get_node(root_id, node.id.0).await?;

        if let Some(record) = &existing {
            match record.state {
                NodeState::Succeeded => {
                    return Ok(NodeOutcome::Completed {
                        branch_code: record.branch_code,
                    })
                }
                NodeState::Skipped => return Ok(NodeOutcome::Skipped),
                // Still parked from an earlier run; halts the chain again
                // until an operator re-arms it.
                NodeState::Failed => {
                    return Ok(NodeOutcome::Failed {
                        error: record.error.clone().unwrap_or_default(),
                    })
                }
                NodeState::Pending | NodeState::Running | NodeState::Paused => {}
            }
        }

        if let Some(gate) = spec.gate {
            if last_code != Some(gate) {
                let mut record = existing
                    .unwrap_or_else(|| NodeRecord::new(root_id, node.id.0, &node.name));
                record.state = NodeState::Skipped;
                record.updated_at = chrono::Utc::now();
                self.store.upsert_node(record).await?;
                info!(root_id = %root_id, node_id = %node.id, gate, "node gated out");
                return Ok(NodeOutcome::Skipped);
            }
        }

        // Reuse kwargs stored by a previous attempt so retries see the exact
        // inputs the failed run computed.
        let kwargs = match &existing {
            Some(record) if !record.kwargs.is_null() => record.kwargs.clone(),
            _ => spec.kwargs.clone(),
        };

        let mut record =
            existing.unwrap_or_else(|| NodeRecord::new(root_id, node.id.0, &node.name));
        record.state = NodeState::Running;
        record.kwargs = kwargs.clone();
        record.error = None;
        record.updated_at = chrono::Utc::now();
        self.store.upsert_node(record.clone()).await?;

        let input = ActivityInput {
            root_id: root_id.to_string(),
            node_id: node.id.0,
            node_name: node.name.clone(),
            global: pipeline.data().clone(),
            kwargs,
            trans: trans.lock().snapshot(),
        };

        let Some(activity) = self.registry.resolve(spec.step) else {
            let error = format!("no activity registered for step {}", spec.step);
            record.state = NodeState::Failed;
            record.error = Some(error.clone());
            record.updated_at = chrono::Utc::now();
            self.store.upsert_node(record).await?;
            return Ok(NodeOutcome::Failed { error });
        };

        if self.services.config.execution.log_transitions {
            info!(root_id = %root_id, node_id = %node.id, step = %spec.step, name = %node.name, "node running");
        }

        match activity.execute(input, &self.services).await {
            Ok(output) => {
                let conflict = {
                    let mut guard = trans.lock();
                    let mut conflict = None;
                    for (key, value) in &output.trans_writes {
                        if let Err(e) = guard.write(key.clone(), value.clone(), node.id) {
                            conflict = Some(e);
                            break;
                        }
                    }
                    conflict
                };
                if let Some(conflict) = conflict {
                    let error = conflict.to_string();
                    record.state = NodeState::Failed;
                    record.error = Some(error.clone());
                    record.updated_at = chrono::Utc::now();
                    self.store.upsert_node(record).await?;
                    return Ok(NodeOutcome::Failed { error });
                }

                record.state = NodeState::Succeeded;
                record.outputs = output.outputs;
                record.trans_writes = output.trans_writes;
                record.branch_code = output.branch_code;
                record.updated_at = chrono::Utc::now();
                self.store.upsert_node(record).await?;
                Ok(NodeOutcome::Completed {
                    branch_code: output.branch_code,
                })
            }
            Err(err) => {
                let error = err.to_string();
                error!(root_id = %root_id, node_id = %node.id, step = %spec.step, %error, "node failed");
                record.state = NodeState::Failed;
                record.error = Some(error.clone());
                record.updated_at = chrono::Utc::now();
                self.store.upsert_node(record).await?;
                Ok(NodeOutcome::Failed { error })
            }
        }
    }

    async fn run_pause_node(
        &self,
        pipeline: &Pipeline,
        ticket: &Ticket,
        node: &Node,
    ) -> Result<PauseOutcome> {
        let root_id = pipeline.root_id();
        let existing = self.store.get_node(root_id, node.id.0).await?;

        if let Some(record) = &existing {
            match record.state {
                NodeState::Succeeded => return Ok(PauseOutcome::Confirmed),
                NodeState::Paused => {
                    if let Some(todo_id) =
                        record.outputs.get("todo_id").and_then(|v| v.as_u64())
                    {
                        if let Ok(todo) = self.services.todos.get(todo_id) {
                            match todo.status {
                                TodoStatus::DoneSuccess => {
                                    let mut record = record.clone();
                                    record.state = NodeState::Succeeded;
                                    record.updated_at = chrono::Utc::now();
                                    self.store.upsert_node(record).await?;
                                    info!(root_id = %root_id, node_id = %node.id, todo_id, "pause gate confirmed");
                                    return Ok(PauseOutcome::Confirmed);
                                }
                                TodoStatus::DoneFailed => {
                                    let mut record = record.clone();
                                    record.state = NodeState::Failed;
                                    record.error =
                                        Some("terminated at pause gate".to_string());
                                    record.updated_at = chrono::Utc::now();
                                    self.store.upsert_node(record).await?;
                                    self.store
                                        .set_pipeline_state(root_id, PipelineState::Terminated)
                                        .await?;
                                    return Ok(PauseOutcome::Terminated);
                                }
                                TodoStatus::Todo => {
                                    return Ok(PauseOutcome::Parked { todo_id })
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let todo = self.services.todos.create(
            &node.name,
            root_id,
            &ticket.uid,
            Some(node.id.0),
            TodoType::InnerApprove,
            vec![ticket.created_by.clone()],
            json!({ "node_name": node.name }),
        );
        let mut record = existing
            .unwrap_or_else(|| NodeRecord::new(root_id, node.id.0, &node.name));
        record.state = NodeState::Paused;
        record.outputs = json!({ "todo_id": todo.id });
        record.updated_at = chrono::Utc::now();
        self.store.upsert_node(record).await?;
        info!(root_id = %root_id, node_id = %node.id, todo_id = todo.id, "pause gate reached");
        Ok(PauseOutcome::Parked { todo_id: todo.id })
    }

    async fn run_parallel_group(
        &self,
        pipeline: &Pipeline,
        ticket: &Ticket,
        node: &Node,
        children: &[NodeId],
        trans: &Mutex<TransData>,
    ) -> Result<ChainOutcome> {
        let root_id = pipeline.root_id();
        let existing = self.store.get_node(root_id, node.id.0).await?;
        if let Some(record) = &existing {
            if record.state == NodeState::Succeeded {
                return Ok(ChainOutcome::Completed);
            }
        }

        let mut record = existing
            .unwrap_or_else(|| NodeRecord::new(root_id, node.id.0, &node.name));
        record.state = NodeState::Running;
        record.updated_at = chrono::Utc::now();
        self.store.upsert_node(record.clone()).await?;

        let cap = self
            .services
            .config
            .execution
            .max_parallel_children
            .max(1);
        let results: Vec<Result<ChildOutcome>> = stream::iter(children.iter().copied())
            .map(|child_id| self.run_group_child(pipeline, ticket, child_id, trans))
            .buffer_unordered(cap)
            .collect()
            .await;

        let mut failures: Vec<String> = Vec::new();
        let mut terminated = false;
        for result in results {
            match result? {
                ChildOutcome::Ok => {}
                ChildOutcome::Failed {
                    node: child,
                    error,
                } => failures.push(format!("{}: {error}", pipeline.node(child).name)),
                ChildOutcome::Terminated => terminated = true,
            }
        }

        if terminated {
            return Ok(ChainOutcome::Terminated);
        }
        if !failures.is_empty() {
            let error = failures.join("; ");
            record.state = NodeState::Failed;
            record.error = Some(error.clone());
            record.updated_at = chrono::Utc::now();
            self.store.upsert_node(record).await?;
            return Ok(ChainOutcome::Failed {
                node: node.id,
                error,
            });
        }

        record.state = NodeState::Succeeded;
        record.error = None;
        record.updated_at = chrono::Utc::now();
        self.store.upsert_node(record).await?;
        Ok(ChainOutcome::Completed)
    }

    async fn run_group_child(
        &self,
        pipeline: &Pipeline,
        ticket: &Ticket,
        child_id: NodeId,
        trans: &Mutex<TransData>,
    ) -> Result<ChildOutcome> {
        let node = pipeline.node(child_id);
        match &node.kind {
            NodeKind::Activity(spec) => {
                // Parallel siblings never observe each other's branch codes.
                match self
                    .run_activity_node(pipeline, node, spec, trans, None)
                    .await?
                {
                    NodeOutcome::Completed { .. } | NodeOutcome::Skipped => Ok(ChildOutcome::Ok),
                    NodeOutcome::Failed { error } => {
                        if spec.best_effort {
                            warn!(
                                root_id = %pipeline.root_id(),
                                node_id = %child_id,
                                %error,
                                "best-effort group child failed, continuing"
                            );
                            Ok(ChildOutcome::Ok)
                        } else {
                            Ok(ChildOutcome::Failed {
                                node: child_id,
                                error,
                            })
                        }
                    }
                }
            }
            NodeKind::SubPipeline { chain } => {
                match self
                    .run_sub_node(pipeline, ticket, node, chain, trans)
                    .await?
                {
                    ChainOutcome::Completed => Ok(ChildOutcome::Ok),
                    ChainOutcome::Failed { node, error } => {
                        Ok(ChildOutcome::Failed { node, error })
                    }
                    ChainOutcome::Terminated => Ok(ChildOutcome::Terminated),
                    // Builders reject pauses under parallel groups.
                    ChainOutcome::Paused { node, .. } => Ok(ChildOutcome::Failed {
                        node,
                        error: "pause gate inside parallel group".to_string(),
                    }),
                }
            }
            NodeKind::Parallel { .. } | NodeKind::Pause => Ok(ChildOutcome::Failed {
                node: child_id,
                error: "unsupported parallel child kind".to_string(),
            }),
        }
    }

    async fn run_sub_node(
        &self,
        pipeline: &Pipeline,
        ticket: &Ticket,
        node: &Node,
        sub_chain: &[NodeId],
        trans: &Mutex<TransData>,
    ) -> Result<ChainOutcome> {
        let root_id = pipeline.root_id();
        let existing = self.store.get_node(root_id, node.id.0).await?;
        if let Some(record) = &existing {
            if record.state == NodeState::Succeeded {
                return Ok(ChainOutcome::Completed);
            }
        }

        let mut record = existing
            .unwrap_or_else(|| NodeRecord::new(root_id, node.id.0, &node.name));
        record.state = NodeState::Running;
        record.updated_at = chrono::Utc::now();
        self.store.upsert_node(record.clone()).await?;

        let outcome = self.run_chain(pipeline, ticket, sub_chain, trans).await?;
        match &outcome {
            ChainOutcome::Completed => {
                record.state = NodeState::Succeeded;
                record.error = None;
            }
            ChainOutcome::Failed { node: child, error } => {
                record.state = NodeState::Failed;
                record.error = Some(format!(
                    "sub-pipeline failed at {}: {error}",
                    pipeline.node(*child).name
                ));
            }
            ChainOutcome::Paused { .. } => {
                record.state = NodeState::Paused;
            }
            ChainOutcome::Terminated => return Ok(outcome),
        }
        record.updated_at = chrono::Utc::now();
        self.store.upsert_node(record).await?;
        Ok(outcome)
    }

    /// Best-effort compensation chain for terminated pipelines.
    async fn run_cleanup(&self, pipeline: &Pipeline) -> Result<()> {
        if pipeline.cleanup().is_empty() {
            return Ok(());
        }
        let trans = Mutex::new(TransData::new());
        self.replay_trans(pipeline, &trans).await?;
        for &node_id in pipeline.cleanup() {
            let node = pipeline.node(node_id);
            if let NodeKind::Activity(spec) = &node.kind {
                if let NodeOutcome::Failed { error } = self
                    .run_activity_node(pipeline, node, spec, &trans, None)
                    .await?
                {
                    warn!(
                        root_id = %pipeline.root_id(),
                        node_id = %node_id,
                        %error,
                        "cleanup activity failed"
                    );
                }
            }
        }
        Ok(())
    }
}

enum PauseOutcome {
    Confirmed,
    Parked { todo_id: u64 },
    Terminated,
}
