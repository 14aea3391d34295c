//! Pipeline engine integration tests: scheduling order, parallel-group
//! failure semantics, manual retry, pause gates, termination, and
//! at-least-once replay.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use dbflow_core::engine::{NodeState, PipelineState, PipelineStore, RunOutcome};
use dbflow_core::pipeline::{ActivitySpec, NodeId, PipelineBuilder, SubPipelineBuilder};
use dbflow_core::registry::{
    Activity, ActivityError, ActivityInput, ActivityOutput, Services, StepCode, StepRegistry,
};
use dbflow_core::testing::TestHarness;
use dbflow_core::ticket::{Ticket, TicketType, TodoAction};

/// Scripted activity: records execution order by node name, fails nodes a
/// configured number of times, and emits configured branch codes.
#[derive(Default)]
struct Scripted {
    log: Mutex<Vec<String>>,
    fail_counts: Mutex<HashMap<String, usize>>,
    branch_codes: Mutex<HashMap<String, i32>>,
}

impl Scripted {
    fn log_entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn executions_of(&self, name: &str) -> usize {
        self.log.lock().iter().filter(|n| n.as_str() == name).count()
    }

    fn fail_times(&self, name: &str, times: usize) {
        self.fail_counts.lock().insert(name.to_string(), times);
    }

    fn branch(&self, name: &str, code: i32) {
        self.branch_codes.lock().insert(name.to_string(), code);
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.log.lock().iter().position(|n| n == name)
    }
}

struct ScriptedActivity(Arc<Scripted>);

#[async_trait]
impl Activity for ScriptedActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        _services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        self.0.log.lock().push(input.node_name.clone());

        let should_fail = {
            let mut fails = self.0.fail_counts.lock();
            match fails.get_mut(&input.node_name) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(ActivityError::execution(format!(
                "scripted failure of {}",
                input.node_name
            )));
        }

        let mut output = ActivityOutput::ok();
        if let Some(code) = self.0.branch_codes.lock().get(&input.node_name) {
            output = output.with_branch(*code);
        }
        Ok(output)
    }
}

fn scripted_harness() -> (TestHarness, Arc<Scripted>) {
    let scripted = Arc::new(Scripted::default());
    let registry = StepRegistry::builder()
        .register(StepCode::DbMeta, Arc::new(ScriptedActivity(scripted.clone())))
        .build();
    (TestHarness::with_registry(Arc::new(registry)), scripted)
}

fn act(name: &str) -> ActivitySpec {
    ActivitySpec::new(name, StepCode::DbMeta, json!({}))
}

fn ticket() -> Ticket {
    Ticket::new("t-1", "admin", 100, TicketType::ClearMachine, json!([]))
}

#[tokio::test]
async fn test_chain_runs_in_submission_order() {
    let (harness, scripted) = scripted_harness();
    let mut builder = PipelineBuilder::new("root-order", json!({}));
    builder.add_activity(act("first"));
    builder.add_activity(act("second"));
    builder.add_activity(act("third"));
    let pipeline = builder.build().unwrap();

    let outcome = harness.engine.run(&pipeline, &ticket()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
    assert_eq!(scripted.log_entries(), vec!["first", "second", "third"]);
    assert_eq!(
        harness
            .store_pipeline_state("root-order")
            .await,
        Some(PipelineState::Succeeded)
    );
}

#[tokio::test]
async fn test_predecessors_succeed_before_node_runs() {
    let (harness, scripted) = scripted_harness();
    let mut builder = PipelineBuilder::new("root-topo", json!({}));
    builder.add_activity(act("prepare"));
    builder
        .add_parallel_acts(vec![act("fan-1"), act("fan-2"), act("fan-3")])
        .unwrap();
    builder.add_activity(act("join"));
    let pipeline = builder.build().unwrap();

    harness.engine.run(&pipeline, &ticket()).await.unwrap();

    let prepare = scripted.index_of("prepare").unwrap();
    let join = scripted.index_of("join").unwrap();
    for fan in ["fan-1", "fan-2", "fan-3"] {
        let idx = scripted.index_of(fan).unwrap();
        assert!(prepare < idx, "prepare must precede {fan}");
        assert!(idx < join, "{fan} must precede join");
    }
}

#[tokio::test]
async fn test_parallel_failure_fails_group_but_not_siblings() {
    let (harness, scripted) = scripted_harness();
    scripted.fail_times("bad", 1);

    let mut builder = PipelineBuilder::new("root-group", json!({}));
    builder
        .add_parallel_acts(vec![act("good-1"), act("bad"), act("good-2")])
        .unwrap();
    builder.add_activity(act("after"));
    let pipeline = builder.build().unwrap();

    let outcome = harness.engine.run(&pipeline, &ticket()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));

    // Siblings already dispatched run to completion.
    assert_eq!(scripted.executions_of("good-1"), 1);
    assert_eq!(scripted.executions_of("good-2"), 1);
    // The chain halts at the failed group.
    assert_eq!(scripted.executions_of("after"), 0);
}

#[tokio::test]
async fn test_best_effort_failure_does_not_fail_group() {
    let (harness, scripted) = scripted_harness();
    scripted.fail_times("lossy", 1);

    let mut builder = PipelineBuilder::new("root-best-effort", json!({}));
    builder
        .add_parallel_acts(vec![act("solid"), act("lossy").best_effort()])
        .unwrap();
    builder.add_activity(act("after"));
    let pipeline = builder.build().unwrap();

    let outcome = harness.engine.run(&pipeline, &ticket()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
    assert_eq!(scripted.executions_of("after"), 1);
}

#[tokio::test]
async fn test_retry_reruns_only_failed_node_and_downstream() {
    let (harness, scripted) = scripted_harness();
    scripted.fail_times("flaky", 1);

    let mut builder = PipelineBuilder::new("root-retry", json!({}));
    builder.add_activity(act("done-work"));
    let flaky_id = builder.add_activity(act("flaky"));
    builder.add_activity(act("downstream"));
    let pipeline = builder.build().unwrap();
    let ticket = ticket();

    let outcome = harness.engine.run(&pipeline, &ticket).await.unwrap();
    let RunOutcome::Failed { node_id, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(node_id, Some(flaky_id));
    assert_eq!(scripted.executions_of("downstream"), 0);

    // Without a retry, resuming halts at the same parked node.
    let parked = harness.engine.resume(&pipeline, &ticket).await.unwrap();
    assert!(matches!(parked, RunOutcome::Failed { .. }));
    assert_eq!(scripted.executions_of("flaky"), 1);

    let outcome = harness
        .engine
        .retry_node(&pipeline, &ticket, flaky_id, "operator")
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
    // Succeeded predecessors were not re-executed.
    assert_eq!(scripted.executions_of("done-work"), 1);
    assert_eq!(scripted.executions_of("flaky"), 2);
    assert_eq!(scripted.executions_of("downstream"), 1);
}

#[tokio::test]
async fn test_retry_rejected_for_non_failed_node() {
    let (harness, _scripted) = scripted_harness();
    let mut builder = PipelineBuilder::new("root-retry-guard", json!({}));
    let node = builder.add_activity(act("fine"));
    let pipeline = builder.build().unwrap();
    let ticket = ticket();

    harness.engine.run(&pipeline, &ticket).await.unwrap();
    let err = harness
        .engine
        .retry_node(&pipeline, &ticket, node, "operator")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid transition"));
}

#[tokio::test]
async fn test_pause_gate_parks_until_confirmed() {
    let (harness, scripted) = scripted_harness();
    let mut builder = PipelineBuilder::new("root-pause", json!({}));
    builder.add_activity(act("before-gate"));
    builder.add_pause("confirm cutover");
    builder.add_activity(act("after-gate"));
    let pipeline = builder.build().unwrap();
    let ticket = ticket();

    let outcome = harness.engine.run(&pipeline, &ticket).await.unwrap();
    let RunOutcome::Paused { todo_id, .. } = outcome else {
        panic!("expected pause, got {outcome:?}");
    };
    assert_eq!(scripted.executions_of("after-gate"), 0);

    // Resuming without resolution parks again on the same todo.
    let parked = harness.engine.resume(&pipeline, &ticket).await.unwrap();
    assert!(matches!(parked, RunOutcome::Paused { todo_id: t, .. } if t == todo_id));

    harness
        .todos
        .resolve(todo_id, "admin", TodoAction::Approve, json!({}))
        .unwrap();
    let outcome = harness.engine.resume(&pipeline, &ticket).await.unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
    assert_eq!(scripted.executions_of("after-gate"), 1);
    assert_eq!(scripted.executions_of("before-gate"), 1);
}

#[tokio::test]
async fn test_pause_gate_terminate_resolution_terminates_pipeline() {
    let (harness, scripted) = scripted_harness();
    let mut builder = PipelineBuilder::new("root-pause-term", json!({}));
    builder.add_pause("confirm");
    builder.add_activity(act("never"));
    let pipeline = builder.build().unwrap();
    let ticket = ticket();

    let RunOutcome::Paused { todo_id, .. } = harness.engine.run(&pipeline, &ticket).await.unwrap()
    else {
        panic!("expected pause");
    };
    harness
        .todos
        .resolve(todo_id, "admin", TodoAction::Terminate, json!({}))
        .unwrap();

    let outcome = harness.engine.resume(&pipeline, &ticket).await.unwrap();
    assert_eq!(outcome, RunOutcome::Terminated);
    assert_eq!(scripted.executions_of("never"), 0);
}

#[tokio::test]
async fn test_terminate_runs_cleanup_and_stops_scheduling() {
    let (harness, scripted) = scripted_harness();
    let mut builder = PipelineBuilder::new("root-term", json!({}));
    builder.add_activity(act("main-work"));
    builder.add_cleanup_activity(act("drop-grants"));
    let pipeline = builder.build().unwrap();
    let ticket = ticket();

    harness.engine.terminate(&pipeline, "operator").await.unwrap();
    assert_eq!(scripted.executions_of("drop-grants"), 1);

    let outcome = harness.engine.run(&pipeline, &ticket).await.unwrap();
    assert_eq!(outcome, RunOutcome::Terminated);
    assert_eq!(scripted.executions_of("main-work"), 0);
}

#[tokio::test]
async fn test_branch_codes_gate_chain_nodes() {
    let (harness, scripted) = scripted_harness();
    scripted.branch("classify", 2);

    let mut builder = PipelineBuilder::new("root-branch", json!({}));
    builder.add_activity(act("classify"));
    let fix_one = builder.add_activity(act("fix-one").gated(1));
    let fix_two = builder.add_activity(act("fix-two").gated(2));
    let fix_three = builder.add_activity(act("fix-three").gated(3));
    builder.add_activity(act("wrap-up"));
    let pipeline = builder.build().unwrap();

    let outcome = harness.engine.run(&pipeline, &ticket()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
    assert_eq!(scripted.executions_of("fix-one"), 0);
    assert_eq!(scripted.executions_of("fix-two"), 1);
    assert_eq!(scripted.executions_of("fix-three"), 0);
    assert_eq!(scripted.executions_of("wrap-up"), 1);

    assert_eq!(
        harness.node_state("root-branch", fix_one).await,
        Some(NodeState::Skipped)
    );
    assert_eq!(
        harness.node_state("root-branch", fix_two).await,
        Some(NodeState::Succeeded)
    );
    assert_eq!(
        harness.node_state("root-branch", fix_three).await,
        Some(NodeState::Skipped)
    );
}

#[tokio::test]
async fn test_sub_pipeline_failure_propagates_as_node_failure() {
    let (harness, scripted) = scripted_harness();
    scripted.fail_times("inner-bad", 1);

    let mut sub = SubPipelineBuilder::new();
    sub.add_activity(act("inner-ok"));
    sub.add_activity(act("inner-bad"));
    let mut builder = PipelineBuilder::new("root-sub", json!({}));
    builder.add_sub_pipeline("nested work", sub.build_sub());
    builder.add_activity(act("after-sub"));
    let pipeline = builder.build().unwrap();

    let outcome = harness.engine.run(&pipeline, &ticket()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    assert_eq!(scripted.executions_of("after-sub"), 0);
}

#[tokio::test]
async fn test_crash_replay_executes_node_again() {
    let (harness, scripted) = scripted_harness();
    let mut builder = PipelineBuilder::new("root-replay", json!({}));
    let node = builder.add_activity(act("at-least-once"));
    let pipeline = builder.build().unwrap();
    let ticket = ticket();

    harness.engine.run(&pipeline, &ticket).await.unwrap();
    assert_eq!(scripted.executions_of("at-least-once"), 1);

    // Simulate a crash after dispatch but before SUCCEEDED persisted.
    harness.force_node_state("root-replay", node, NodeState::Running).await;
    harness
        .force_pipeline_state("root-replay", PipelineState::Running)
        .await;

    let outcome = harness.engine.run(&pipeline, &ticket).await.unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
    assert_eq!(scripted.executions_of("at-least-once"), 2);
}

mod group_state_property {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// A parallel group's terminal state is FAILED iff at least one
        /// child failed.
        #[test]
        fn group_failed_iff_any_child_failed(failures in proptest::collection::vec(any::<bool>(), 1..6)) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let (harness, scripted) = scripted_harness();
                let mut acts = Vec::new();
                for (idx, fails) in failures.iter().enumerate() {
                    let name = format!("child-{idx}");
                    if *fails {
                        scripted.fail_times(&name, 1);
                    }
                    acts.push(act(&name));
                }
                let mut builder = PipelineBuilder::new("root-prop", json!({}));
                let group = builder.add_parallel_acts(acts).unwrap();
                let pipeline = builder.build().unwrap();

                harness.engine.run(&pipeline, &ticket()).await.unwrap();
                let group_state = harness.node_state("root-prop", group).await.unwrap();
                if failures.iter().any(|f| *f) {
                    assert_eq!(group_state, NodeState::Failed);
                } else {
                    assert_eq!(group_state, NodeState::Succeeded);
                }
            });
        }
    }
}

/// Store-peeking helpers for assertions.
trait StorePeek {
    async fn node_state(&self, root_id: &str, node: NodeId) -> Option<NodeState>;
    async fn store_pipeline_state(&self, root_id: &str) -> Option<PipelineState>;
    async fn force_node_state(&self, root_id: &str, node: NodeId, state: NodeState);
    async fn force_pipeline_state(&self, root_id: &str, state: PipelineState);
}

impl StorePeek for TestHarness {
    async fn node_state(&self, root_id: &str, node: NodeId) -> Option<NodeState> {
        self.store
            .get_node(root_id, node.0)
            .await
            .unwrap()
            .map(|r| r.state)
    }

    async fn store_pipeline_state(&self, root_id: &str) -> Option<PipelineState> {
        self.store.get_pipeline_state(root_id).await.unwrap()
    }

    async fn force_node_state(&self, root_id: &str, node: NodeId, state: NodeState) {
        let mut record = self
            .store
            .get_node(root_id, node.0)
            .await
            .unwrap()
            .expect("node record exists");
        record.state = state;
        self.store.upsert_node(record).await.unwrap();
    }

    async fn force_pipeline_state(&self, root_id: &str, state: PipelineState) {
        self.store.set_pipeline_state(root_id, state).await.unwrap();
    }
}
