//! SQLServer activities for the slave-rebuild flow.
//!
//! The sync-status check classifies the slave into a fix code; the repair
//! activities are registered behind branch gates keyed on those codes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{first_column_strings, require_all_ok};
use crate::gateway::{AddressResult, CommandKind, RemoteCommand};
use crate::registry::{Activity, ActivityError, ActivityInput, ActivityOutput, Services, StepCode};
use crate::topology::ClusterSnapshot;

/// Fix codes, in check precedence order. Later checks assume earlier ones
/// passed, so the order must not be rearranged.
pub const FIX_GROUP_MISSING: i32 = 1;
pub const FIX_GROUP_ABNORMAL: i32 = 2;
pub const FIX_DBS_NOT_SYNCED: i32 = 3;
pub const FIX_HEALTHY: i32 = 4;

const GROUP_QUERY: &str = "SELECT name FROM sys.availability_groups";
const GROUP_HEALTH_QUERY: &str =
    "SELECT synchronization_health_desc FROM sys.dm_hadr_availability_group_states";
const NO_SYNC_QUERY: &str = "SELECT d.name FROM sys.databases d \
     LEFT JOIN sys.dm_hadr_database_replica_states s ON d.database_id = s.database_id \
     WHERE s.database_id IS NULL AND d.database_id > 4";
const ALL_DBS_QUERY: &str = "SELECT name FROM sys.databases WHERE database_id > 4";
const RESTORING_DBS_QUERY: &str =
    "SELECT name FROM sys.databases WHERE state_desc = 'RESTORING'";
const RESUME_SYNC_CMD: &str = "EXEC dbo.sp_resume_db_sync";

#[derive(Debug, Deserialize)]
struct SyncCheckKwargs {
    cluster_id: i64,
    fix_slave_ip: String,
}

struct SyncProbe<'a> {
    services: &'a Services,
    cluster: ClusterSnapshot,
}

impl<'a> SyncProbe<'a> {
    async fn query(
        &self,
        address: String,
        command: &str,
    ) -> Result<Vec<AddressResult>, ActivityError> {
        let results = self
            .services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![address],
                commands: vec![command.to_string()],
                cloud_id: self.cluster.cloud_id,
                force_continue_on_error: false,
                timeout: self.services.config.sql_timeout(),
                kind: CommandKind::Sql,
            })
            .await?;
        require_all_ok(&results)?;
        Ok(results)
    }

    async fn query_strings(
        &self,
        address: String,
        command: &str,
    ) -> Result<Vec<String>, ActivityError> {
        Ok(first_column_strings(&self.query(address, command).await?))
    }
}

/// Classify the slave being rebuilt into a fix code:
///
/// 1. availability group missing
/// 2. availability group unhealthy
/// 3. databases still unsynced after one resume attempt
/// 4. fully synced, healthy
pub struct CheckSlaveSyncStatusActivity;

#[async_trait]
impl Activity for CheckSlaveSyncStatusActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: SyncCheckKwargs = input.parse_kwargs(StepCode::CheckSlaveSyncStatus)?;
        let cluster = services.repository.get_cluster(kwargs.cluster_id).await?;
        let master = cluster
            .masters()
            .into_iter()
            .next()
            .ok_or_else(|| {
                ActivityError::execution(format!(
                    "cluster {} has no master instance",
                    cluster.immute_domain
                ))
            })?
            .ip_port();
        let fix_slave = cluster
            .storages
            .iter()
            .find(|s| s.machine.ip == kwargs.fix_slave_ip)
            .ok_or_else(|| {
                ActivityError::execution(format!(
                    "slave {} not found in cluster {}",
                    kwargs.fix_slave_ip, cluster.immute_domain
                ))
            })?
            .ip_port();

        let probe = SyncProbe { services, cluster };

        let sync_dbs = probe.query_strings(master.clone(), ALL_DBS_QUERY).await?;
        let restoring = probe
            .query_strings(fix_slave.clone(), RESTORING_DBS_QUERY)
            .await?;
        let mut clean_dbs = sync_dbs.clone();
        for db in restoring {
            if !clean_dbs.contains(&db) {
                clean_dbs.push(db);
            }
        }
        let db_context = ActivityOutput::ok()
            .write_trans(format!("sync_dbs:{}", kwargs.cluster_id), json!(sync_dbs))
            .write_trans(format!("clean_dbs:{}", kwargs.cluster_id), json!(clean_dbs));

        // 1. availability group configured at all?
        let groups = probe.query_strings(master.clone(), GROUP_QUERY).await?;
        if groups.is_empty() {
            info!(root_id = %input.root_id, "availability group missing");
            return Ok(db_context
                .with_outputs(json!({ "fix_number": FIX_GROUP_MISSING }))
                .with_branch(FIX_GROUP_MISSING));
        }

        // 2. group healthy?
        let health = probe
            .query_strings(master.clone(), GROUP_HEALTH_QUERY)
            .await?;
        if health.iter().any(|h| h != "HEALTHY") {
            info!(root_id = %input.root_id, "availability group unhealthy");
            return Ok(db_context
                .with_outputs(json!({ "fix_number": FIX_GROUP_ABNORMAL }))
                .with_branch(FIX_GROUP_ABNORMAL));
        }

        // 3. unsynced databases get one resume attempt before deciding.
        let unsynced = probe.query_strings(master.clone(), NO_SYNC_QUERY).await?;
        if !unsynced.is_empty() {
            probe.query(fix_slave.clone(), RESUME_SYNC_CMD).await?;
            info!(root_id = %input.root_id, "resume attempted, re-checking sync state");
            let still_unsynced = probe.query_strings(master, NO_SYNC_QUERY).await?;
            if !still_unsynced.is_empty() {
                return Ok(db_context
                    .with_outputs(json!({
                        "fix_number": FIX_DBS_NOT_SYNCED,
                        "unsynced": still_unsynced,
                    }))
                    .with_branch(FIX_DBS_NOT_SYNCED));
            }
        }

        info!(root_id = %input.root_id, "slave sync state healthy");
        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "fix_number": FIX_HEALTHY }))
            .with_branch(FIX_HEALTHY))
    }
}

#[derive(Debug, Deserialize)]
struct SyncRepairKwargs {
    cluster_id: i64,
    fix_slave_ip: String,
    #[serde(default)]
    rebuild: bool,
}

/// Create (or tear down and re-create) the availability group covering the
/// cluster's databases.
pub struct SqlserverBuildSyncGroupActivity;

#[async_trait]
impl Activity for SqlserverBuildSyncGroupActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: SyncRepairKwargs = input.parse_kwargs(StepCode::SqlserverBuildSyncGroup)?;
        let cluster = services.repository.get_cluster(kwargs.cluster_id).await?;
        let master = cluster
            .masters()
            .into_iter()
            .next()
            .ok_or_else(|| ActivityError::execution("no master instance"))?
            .ip_port();
        let sync_dbs: Vec<String> = input
            .trans_value(&format!("sync_dbs:{}", kwargs.cluster_id))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ActivityError::execution(format!("sync_dbs: {e}")))?
            .unwrap_or_default();

        let mut commands = Vec::new();
        if kwargs.rebuild {
            commands.push("EXEC dbo.sp_drop_availability_group".to_string());
        }
        commands.push(format!(
            "EXEC dbo.sp_build_availability_group @slave = '{}', @dbs = '{}'",
            kwargs.fix_slave_ip,
            sync_dbs.join(","),
        ));

        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![master],
                commands,
                cloud_id: cluster.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.script_timeout(),
                kind: CommandKind::Sql,
            })
            .await?;
        require_all_ok(&results)?;
        Ok(ActivityOutput::ok().with_outputs(json!({ "rebuilt": kwargs.rebuild })))
    }
}

/// Re-establish synchronization for databases the check found unsynced.
pub struct SqlserverRepairSyncActivity;

#[async_trait]
impl Activity for SqlserverRepairSyncActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: SyncRepairKwargs = input.parse_kwargs(StepCode::SqlserverRepairSync)?;
        let cluster = services.repository.get_cluster(kwargs.cluster_id).await?;
        let fix_slave = cluster
            .storages
            .iter()
            .find(|s| s.machine.ip == kwargs.fix_slave_ip)
            .ok_or_else(|| ActivityError::execution("fix slave not found"))?
            .ip_port();
        let clean_dbs: Vec<String> = input
            .trans_value(&format!("clean_dbs:{}", kwargs.cluster_id))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ActivityError::execution(format!("clean_dbs: {e}")))?
            .unwrap_or_default();

        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![fix_slave],
                commands: vec![format!(
                    "EXEC dbo.sp_rebuild_db_sync @dbs = '{}'",
                    clean_dbs.join(","),
                )],
                cloud_id: cluster.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.script_timeout(),
                kind: CommandKind::Sql,
            })
            .await?;
        require_all_ok(&results)?;
        Ok(ActivityOutput::ok().with_outputs(json!({ "dbs": clean_dbs.len() })))
    }
}
