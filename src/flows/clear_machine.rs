//! Clear-machine flow: recycle hosts by deleting their metadata bindings and
//! then wiping them at the OS level.
//!
//! Ordering is the whole point: metadata is the source of truth, so the
//! bindings for every instance on a machine are deleted before the
//! destructive script runs, and the script never runs when the metadata step
//! failed — a wiped host with live metadata is a stale-metadata hazard.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::FlowController;
use crate::error::{FlowError, Result};
use crate::pipeline::{ActivitySpec, Pipeline, PipelineBuilder, SubPipelineBuilder};
use crate::registry::{Services, StepCode};
use crate::ticket::Ticket;
use crate::topology::{DbType, MutationBatch, MutationOp};

#[derive(Debug, Deserialize)]
struct ClearHost {
    ip: String,
    cloud_id: i64,
}

#[derive(Debug, Deserialize)]
struct ClearMachineInfo {
    db_type: DbType,
    #[serde(default = "default_os")]
    os_name: String,
    clear_hosts: Vec<ClearHost>,
}

fn default_os() -> String {
    "linux".to_string()
}

pub struct ClearMachineFlow;

#[async_trait]
impl FlowController for ClearMachineFlow {
    async fn build(
        &self,
        ticket: &Ticket,
        services: &Services,
        root_id: &str,
    ) -> Result<Pipeline> {
        let info: ClearMachineInfo = serde_json::from_value(ticket.infos.clone())
            .map_err(|e| FlowError::Precondition(format!("clear-machine payload: {e}")))?;
        if info.clear_hosts.is_empty() {
            return Err(FlowError::Precondition("no hosts to clear".to_string()));
        }

        // Every referenced machine must exist before anything is built.
        for host in &info.clear_hosts {
            let view = services.repository.machine_view(&host.ip).await?;
            info!(
                ip = %host.ip,
                instances = view.instance_count(),
                "machine resolved for cleanup"
            );
        }

        let data = json!({
            "uid": ticket.uid,
            "created_by": ticket.created_by,
            "biz_id": ticket.biz_id,
            "ticket_type": ticket.ticket_type,
            "db_type": info.db_type,
            "os_name": info.os_name,
        });
        let mut builder = PipelineBuilder::new(root_id, data);

        // One unit per host: a failed unit must not block the others, and
        // within a unit the wipe never precedes the metadata removal.
        let mut units = Vec::with_capacity(info.clear_hosts.len());
        for host in &info.clear_hosts {
            let mut unit = SubPipelineBuilder::new();
            unit.add_activity(ActivitySpec::new(
                format!("clear metadata of {}", host.ip),
                StepCode::DbMeta,
                serde_json::to_value(MutationBatch::single(MutationOp::ClearMachine {
                    ip: host.ip.clone(),
                }))
                .map_err(|e| FlowError::Build(e.to_string()))?,
            ));
            unit.add_activity(ActivitySpec::new(
                format!("wipe machine {}", host.ip),
                StepCode::ClearMachineExecute,
                json!({ "exec_ips": [host.ip], "cloud_id": host.cloud_id }),
            ));
            units.push((format!("clear machine {}", host.ip), unit.build_sub()));
        }
        builder
            .add_parallel_sub_pipelines(units)
            .map_err(|e| FlowError::Build(e.to_string()))?;

        builder.build().map_err(|e| FlowError::Build(e.to_string()))
    }
}
