//! MongoDB activities backing the point-in-time restore flow: per-process
//! instance operations, backup-record discovery, file download, restore
//! replay, and cluster-identity rebuild.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::info;

use super::require_all_ok;
use crate::gateway::{CommandKind, RemoteCommand};
use crate::registry::{Activity, ActivityError, ActivityInput, ActivityOutput, Services, StepCode};

/// Operation against one MongoDB process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MongoOp {
    StopDbmon,
    Stop,
    Start,
    /// Step a replica-set member down to a non-voting secondary
    Demote,
    StopMongos,
    StartMongos,
    CheckEmptyData,
}

impl fmt::Display for MongoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StopDbmon => "stop_dbmon",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Demote => "demote",
            Self::StopMongos => "stop_mongos",
            Self::StartMongos => "start_mongos",
            Self::CheckEmptyData => "check_empty_data",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Deserialize)]
struct MongoInstanceOpKwargs {
    ip: String,
    #[serde(default)]
    port: Option<u16>,
    cloud_id: i64,
    op: MongoOp,
    file_path: String,
}

/// Run one actuator operation against one MongoDB process (or host, for
/// host-scoped ops like stopping the monitor daemon).
pub struct MongoInstanceOpActivity;

#[async_trait]
impl Activity for MongoInstanceOpActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: MongoInstanceOpKwargs = input.parse_kwargs(StepCode::MongoInstanceOp)?;
        let mut command = format!(
            "{}/dbactuator mongodb {} --ip {}",
            kwargs.file_path, kwargs.op, kwargs.ip
        );
        if let Some(port) = kwargs.port {
            command.push_str(&format!(" --port {port}"));
        }
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.ip.clone()],
                commands: vec![command],
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.script_timeout(),
                kind: CommandKind::Script {
                    account: "root".to_string(),
                    os_name: "shell".to_string(),
                },
            })
            .await?;
        require_all_ok(&results)?;
        Ok(ActivityOutput::ok().with_outputs(json!({ "ip": kwargs.ip, "op": kwargs.op })))
    }
}

#[derive(Debug, Deserialize)]
struct FetchBackupRecordKwargs {
    src_cluster_id: i64,
    set_name: String,
    dst_time: String,
    backup_api_address: String,
    cloud_id: i64,
}

/// Resolve the backup file list for one shard up to the restore target time.
///
/// The file list is written into trans-data under `backup_files:<set>` for
/// the shard's download step.
pub struct MongoFetchBackupRecordActivity;

#[async_trait]
impl Activity for MongoFetchBackupRecordActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: FetchBackupRecordKwargs = input.parse_kwargs(StepCode::MongoFetchBackupRecord)?;
        let command = format!(
            "bkstore list-backups --cluster-id {} --set {} --until '{}'",
            kwargs.src_cluster_id, kwargs.set_name, kwargs.dst_time
        );
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.backup_api_address],
                commands: vec![command],
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.sql_timeout(),
                kind: CommandKind::Script {
                    account: "root".to_string(),
                    os_name: "shell".to_string(),
                },
            })
            .await?;
        require_all_ok(&results)?;

        let files = super::first_column_strings(&results);
        if files.is_empty() {
            return Err(ActivityError::execution(format!(
                "no backup records for set {} before {}",
                kwargs.set_name, kwargs.dst_time
            )));
        }
        info!(set_name = %kwargs.set_name, files = files.len(), "backup records resolved");
        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "files": files }))
            .write_trans(
                format!("backup_files:{}:{}", kwargs.src_cluster_id, kwargs.set_name),
                json!(files),
            ))
    }
}

#[derive(Debug, Deserialize)]
struct DownloadBackupKwargs {
    src_cluster_id: i64,
    dest_ip: String,
    dest_dir: String,
    set_name: String,
    cloud_id: i64,
}

/// Download the shard's backup files onto its execution node.
pub struct MongoDownloadBackupActivity;

#[async_trait]
impl Activity for MongoDownloadBackupActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: DownloadBackupKwargs = input.parse_kwargs(StepCode::MongoDownloadBackup)?;
        let key = format!("backup_files:{}:{}", kwargs.src_cluster_id, kwargs.set_name);
        let files: Vec<String> = input
            .trans_value(&key)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ActivityError::execution(format!("{key}: {e}")))?
            .ok_or_else(|| {
                ActivityError::execution(format!("backup file list missing for {}", kwargs.set_name))
            })?;

        let mut commands = vec![format!("mkdir -p {}", kwargs.dest_dir)];
        commands.extend(
            files
                .iter()
                .map(|file| format!("bkstore fetch --dest {} {file}", kwargs.dest_dir)),
        );
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.dest_ip.clone()],
                commands,
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.script_timeout(),
                kind: CommandKind::Script {
                    account: "root".to_string(),
                    os_name: "shell".to_string(),
                },
            })
            .await?;
        require_all_ok(&results)?;
        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "dest_ip": kwargs.dest_ip, "files": files.len() })))
    }
}

#[derive(Debug, Deserialize)]
struct PitrRestoreKwargs {
    ip: String,
    port: u16,
    set_name: String,
    dst_time: String,
    apply_oplog: bool,
    dest_dir: String,
    cloud_id: i64,
    file_path: String,
}

/// Replay the downloaded backup (and oplog, when requested) on the shard's
/// execution node up to the restore target time.
pub struct MongoPitrRestoreActivity;

#[async_trait]
impl Activity for MongoPitrRestoreActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: PitrRestoreKwargs = input.parse_kwargs(StepCode::MongoPitrRestore)?;
        let command = format!(
            "{}/dbactuator mongodb pitr-restore --ip {} --port {} --set {} \
             --recover-dir {} --dst-time '{}' --apply-oplog {}",
            kwargs.file_path,
            kwargs.ip,
            kwargs.port,
            kwargs.set_name,
            kwargs.dest_dir,
            kwargs.dst_time,
            kwargs.apply_oplog,
        );
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.ip.clone()],
                commands: vec![command],
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.script_timeout(),
                kind: CommandKind::Script {
                    account: "root".to_string(),
                    os_name: "shell".to_string(),
                },
            })
            .await?;
        require_all_ok(&results)?;
        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "set_name": kwargs.set_name, "dst_time": kwargs.dst_time })))
    }
}

#[derive(Debug, Deserialize)]
struct PitrRebuildKwargs {
    ip: String,
    port: u16,
    set_name: String,
    /// Config-server rebuild updates routing metadata; data-shard rebuild
    /// re-inserts the shard identity document
    is_config: bool,
    cloud_id: i64,
    file_path: String,
}

/// Rebuild cluster identity on a restored shard. For the config-server set
/// this rewrites `config.shards` and stops the balancer; for a data shard it
/// restarts the member standalone and re-inserts the shard identity.
pub struct MongoPitrRebuildActivity;

#[async_trait]
impl Activity for MongoPitrRebuildActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: PitrRebuildKwargs = input.parse_kwargs(StepCode::MongoPitrRebuild)?;
        let command = format!(
            "{}/dbactuator mongodb pitr-rebuild --ip {} --port {} --set {} --role {}",
            kwargs.file_path,
            kwargs.ip,
            kwargs.port,
            kwargs.set_name,
            if kwargs.is_config { "configsvr" } else { "shardsvr" },
        );
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.ip.clone()],
                commands: vec![command],
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.script_timeout(),
                kind: CommandKind::Script {
                    account: "root".to_string(),
                    os_name: "shell".to_string(),
                },
            })
            .await?;
        require_all_ok(&results)?;
        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "set_name": kwargs.set_name, "is_config": kwargs.is_config })))
    }
}
