//! # Flow Controllers
//!
//! One controller per operation family. A controller translates a validated
//! ticket payload into a pipeline: it resolves targets from the topology
//! repository, fails fast on preconditions before building anything, groups
//! work by its natural unit of parallelism, and interleaves metadata
//! mutation with remote work — metadata before destroy, metadata after
//! create.

pub mod authorize;
pub mod clear_machine;
pub mod pitr_restore;
pub mod slave_rebuild;
pub mod table_backup;
pub mod transfer_cluster;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::engine::{PipelineEngine, RunOutcome};
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::registry::Services;
use crate::ticket::{Flow, FlowStatus, Ticket, TicketStatus, TicketType, TodoType};
use crate::topology::DbType;

pub use authorize::AuthorizeRulesFlow;
pub use clear_machine::ClearMachineFlow;
pub use pitr_restore::MongoPitrRestoreFlow;
pub use slave_rebuild::SqlserverSlaveRebuildFlow;
pub use table_backup::DbTableBackupFlow;
pub use transfer_cluster::TransferClusterFlow;

/// Flow-specific planning logic: build the pipeline for one ticket.
#[async_trait]
pub trait FlowController: Send + Sync {
    async fn build(
        &self,
        ticket: &Ticket,
        services: &Services,
        root_id: &str,
    ) -> Result<Pipeline>;
}

/// Resolve the controller for a ticket type.
pub fn controller_for(ticket_type: TicketType) -> Box<dyn FlowController> {
    match ticket_type {
        TicketType::ClearMachine => Box::new(ClearMachineFlow),
        TicketType::DbTableBackup => Box::new(DbTableBackupFlow),
        TicketType::MongoPitrRestore => Box::new(MongoPitrRestoreFlow),
        TicketType::AuthorizeRules => Box::new(AuthorizeRulesFlow),
        TicketType::TransferCluster => Box::new(TransferClusterFlow),
        TicketType::SqlserverSlaveRebuild => Box::new(SqlserverSlaveRebuildFlow),
    }
}

/// The actuator media package pushed to hosts before remote execution.
pub(crate) fn db_actuator_package(db_type: DbType) -> Vec<String> {
    vec![format!("{db_type}-dbactuator.tar.gz")]
}

/// Default install path for pushed media.
pub(crate) const MEDIA_TARGET_PATH: &str = "/data/install";

/// Result of driving one ticket through its flow.
#[derive(Debug)]
pub struct TicketRun {
    /// The built pipeline; callers keep it for retry/resume/terminate
    pub pipeline: Pipeline,
    pub flow: Flow,
    pub outcome: RunOutcome,
}

/// Build and execute the flow for a ticket, updating ticket and flow status
/// and creating a recovery todo when the flow fails.
///
/// Precondition errors surface before any flow or pipeline state exists.
pub async fn run_ticket(
    engine: &PipelineEngine,
    ticket: &mut Ticket,
) -> Result<TicketRun> {
    let root_id = format!(
        "{}-{}",
        ticket.ticket_type.to_string().to_lowercase(),
        Uuid::new_v4().simple()
    );
    let controller = controller_for(ticket.ticket_type);
    let pipeline = controller
        .build(ticket, engine.services(), &root_id)
        .await?;

    let mut flow = Flow::new(root_id, &ticket.uid);
    flow.update_status(FlowStatus::Running);
    ticket.status = TicketStatus::Running;

    let outcome = engine.run(&pipeline, ticket).await?;
    let status = match &outcome {
        RunOutcome::Succeeded => FlowStatus::Succeeded,
        RunOutcome::Failed { .. } => FlowStatus::Failed,
        RunOutcome::Paused { .. } => FlowStatus::Paused,
        RunOutcome::Terminated => FlowStatus::Terminated,
    };
    flow.update_status(status);

    if let RunOutcome::Failed { node_id, error } = &outcome {
        // Recovery (retry vs terminate vs replenish) is an operator
        // decision, never guessed by the engine.
        engine.services().todos.create(
            format!("flow {} failed: {error}", flow.root_id),
            &flow.root_id,
            &ticket.uid,
            node_id.map(|n| n.0),
            TodoType::InnerFailed,
            vec![ticket.created_by.clone()],
            json!({ "error": error }),
        );
    }

    ticket.status = crate::ticket::ticket_status_from_flows(&[flow.status]);
    Ok(TicketRun {
        pipeline,
        flow,
        outcome,
    })
}
