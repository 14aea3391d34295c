//! SQLServer slave-rebuild flow.
//!
//! A check activity classifies each slave into a fix code; the repair
//! branches are all registered at build time and gated on the reported code,
//! so the graph never changes after submission. The code precedence
//! (group missing, group abnormal, databases unsynced, healthy) is part of
//! the contract: later checks assume the earlier ones passed.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::FlowController;
use crate::error::{FlowError, Result};
use crate::pipeline::{ActivitySpec, Pipeline, PipelineBuilder, SubPipelineBuilder};
use crate::registry::activities::sqlserver::{
    FIX_DBS_NOT_SYNCED, FIX_GROUP_ABNORMAL, FIX_GROUP_MISSING,
};
use crate::registry::{Services, StepCode};
use crate::ticket::Ticket;

#[derive(Debug, Deserialize)]
struct RebuildInfo {
    cluster_id: i64,
    fix_slave_ip: String,
}

pub struct SqlserverSlaveRebuildFlow;

#[async_trait]
impl FlowController for SqlserverSlaveRebuildFlow {
    async fn build(
        &self,
        ticket: &Ticket,
        services: &Services,
        root_id: &str,
    ) -> Result<Pipeline> {
        let infos: Vec<RebuildInfo> = serde_json::from_value(ticket.infos.clone())
            .map_err(|e| FlowError::Precondition(format!("rebuild payload: {e}")))?;
        if infos.is_empty() {
            return Err(FlowError::Precondition("no slaves to rebuild".to_string()));
        }

        let mut units = Vec::with_capacity(infos.len());
        for info in &infos {
            let cluster = services.repository.get_cluster(info.cluster_id).await?;
            if cluster.masters().is_empty() {
                return Err(FlowError::Precondition(format!(
                    "cluster {} has no master instance",
                    cluster.immute_domain
                )));
            }
            if !cluster
                .storages
                .iter()
                .any(|s| s.machine.ip == info.fix_slave_ip)
            {
                return Err(FlowError::Precondition(format!(
                    "slave {} is not part of cluster {}",
                    info.fix_slave_ip, cluster.immute_domain
                )));
            }

            let target = json!({
                "cluster_id": info.cluster_id,
                "fix_slave_ip": info.fix_slave_ip,
            });
            let mut unit = SubPipelineBuilder::new();
            unit.add_activity(ActivitySpec::new(
                format!("check sync state of {}", info.fix_slave_ip),
                StepCode::CheckSlaveSyncStatus,
                target.clone(),
            ));
            unit.add_activity(
                ActivitySpec::new(
                    "build availability group",
                    StepCode::SqlserverBuildSyncGroup,
                    target.clone(),
                )
                .gated(FIX_GROUP_MISSING),
            );
            unit.add_activity(
                ActivitySpec::new(
                    "rebuild availability group",
                    StepCode::SqlserverBuildSyncGroup,
                    json!({
                        "cluster_id": info.cluster_id,
                        "fix_slave_ip": info.fix_slave_ip,
                        "rebuild": true,
                    }),
                )
                .gated(FIX_GROUP_ABNORMAL),
            );
            unit.add_activity(
                ActivitySpec::new(
                    "re-establish database sync",
                    StepCode::SqlserverRepairSync,
                    target,
                )
                .gated(FIX_DBS_NOT_SYNCED),
            );
            // Fix code 4 (healthy) gates every repair branch out.

            units.push((
                format!(
                    "rebuild slave {} of {}",
                    info.fix_slave_ip, cluster.immute_domain
                ),
                unit.build_sub(),
            ));
        }

        let data = json!({
            "uid": ticket.uid,
            "created_by": ticket.created_by,
            "biz_id": ticket.biz_id,
            "ticket_type": ticket.ticket_type,
        });
        let mut builder = PipelineBuilder::new(root_id, data);
        builder
            .add_parallel_sub_pipelines(units)
            .map_err(|e| FlowError::Build(e.to_string()))?;
        builder.build().map_err(|e| FlowError::Build(e.to_string()))
    }
}
