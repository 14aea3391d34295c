//! Activities shared across database families: machine cleanup, metadata
//! mutation, temporary job accounts, and business-transfer leaf actions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{require_all_ok, temp_account_for};
use crate::gateway::{CommandKind, RemoteCommand};
use crate::registry::{Activity, ActivityError, ActivityInput, ActivityOutput, Services, StepCode};
use crate::topology::{DbType, InstanceStatus, MutationBatch, MutationOp};

/// OS account the cleanup script runs under, per database family.
fn cleanup_account(db_type: DbType) -> &'static str {
    match db_type {
        DbType::Mysql => "mysql",
        DbType::Sqlserver => "mssql",
        DbType::Mongodb => "mongodb",
        DbType::Redis => "redis",
        DbType::Hdfs => "hadoop",
    }
}

/// Cleanup script per database family. Stops the service processes and
/// moves data directories aside; machine recycling happens upstream.
fn cleanup_script(db_type: DbType) -> &'static str {
    match db_type {
        DbType::Mysql => {
            "systemctl stop mysqld proxy || true\n\
             mv /data/mysqldata /data/mysqldata.bak.$$\n\
             crontab -u mysql -r || true"
        }
        DbType::Sqlserver => {
            "Stop-Service -Name MSSQLSERVER -Force\n\
             Rename-Item -Path D:\\gamedb -NewName gamedb.bak"
        }
        DbType::Mongodb => {
            "systemctl stop mongod mongos || true\n\
             mv /data/mongodata /data/mongodata.bak.$$\n\
             crontab -u mongodb -r || true"
        }
        DbType::Redis => {
            "systemctl stop redis-server || true\n\
             mv /data/redis /data/redis.bak.$$"
        }
        DbType::Hdfs => {
            "systemctl stop hadoop-hdfs-datanode || true\n\
             mv /data/hadoopdata /data/hadoopdata.bak.$$"
        }
    }
}

fn script_language(os_name: &str) -> &'static str {
    match os_name {
        "windows" => "powershell",
        _ => "shell",
    }
}

#[derive(Debug, Deserialize)]
struct ClearMachineKwargs {
    exec_ips: Vec<String>,
    cloud_id: i64,
    #[serde(default)]
    job_timeout_secs: Option<u64>,
}

/// Run the destructive machine-cleanup script on the target hosts.
pub struct ClearMachineExecuteActivity;

#[async_trait]
impl Activity for ClearMachineExecuteActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: ClearMachineKwargs = input.parse_kwargs(StepCode::ClearMachineExecute)?;
        if kwargs.exec_ips.is_empty() {
            return Err(ActivityError::execution(
                "no target ips resolved for machine cleanup",
            ));
        }

        let db_type: DbType = input
            .global
            .get("db_type")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ActivityError::BadKwargs {
                step: StepCode::ClearMachineExecute,
                message: format!("db_type: {e}"),
            })?
            .unwrap_or(DbType::Mysql);
        let os_name = input.global_str("os_name").unwrap_or("linux").to_string();

        let timeout = kwargs
            .job_timeout_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| services.config.script_timeout());

        crate::logging::log_remote_dispatch(
            &input.root_id,
            &input.node_id.to_string(),
            &kwargs.exec_ips,
            kwargs.cloud_id,
        );
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: kwargs.exec_ips.clone(),
                commands: vec![cleanup_script(db_type).to_string()],
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout,
                kind: CommandKind::Script {
                    account: cleanup_account(db_type).to_string(),
                    os_name: script_language(&os_name).to_string(),
                },
            })
            .await?;
        require_all_ok(&results)?;

        Ok(ActivityOutput::ok().with_outputs(json!({ "exec_ips": kwargs.exec_ips })))
    }
}

/// Apply a metadata mutation batch through the topology repository.
///
/// Repository transaction failures are fatal to the node; the repository
/// guarantees no partially-applied batch is left behind.
pub struct DbMetaActivity;

#[async_trait]
impl Activity for DbMetaActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let batch: MutationBatch = input.parse_kwargs(StepCode::DbMeta)?;
        if batch.is_empty() {
            return Err(ActivityError::execution("empty metadata mutation batch"));
        }
        let applied = batch.ops.len();
        services.repository.mutate(batch).await?;
        info!(root_id = %input.root_id, applied, "metadata batch applied");
        Ok(ActivityOutput::ok().with_outputs(json!({ "applied": applied })))
    }
}

#[derive(Debug, Deserialize)]
struct TempAccountKwargs {
    cluster_ids: Vec<i64>,
}

/// Provision the per-ticket temporary admin account on every instance of the
/// target clusters. `CREATE USER IF NOT EXISTS` keeps the step replayable.
pub struct AddTempAccountActivity;

#[async_trait]
impl Activity for AddTempAccountActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: TempAccountKwargs = input.parse_kwargs(StepCode::AddTempAccount)?;
        let user = temp_account_for(&input.root_id);
        let mut err_count = 0usize;
        let mut provisioned = 0usize;

        for cluster_id in &kwargs.cluster_ids {
            let cluster = services.repository.get_cluster(*cluster_id).await?;
            let instances: Vec<(String, InstanceStatus)> = cluster
                .storages
                .iter()
                .map(|s| (s.ip_port(), s.status))
                .chain(cluster.proxies.iter().map(|p| (p.ip_port(), p.status)))
                .collect();

            for (address, status) in instances {
                let host = address.split(':').next().unwrap_or("").to_string();
                let commands = vec![
                    format!("CREATE USER IF NOT EXISTS `{user}`@`localhost` IDENTIFIED BY '{}';", input.root_id),
                    format!("CREATE USER IF NOT EXISTS `{user}`@`{host}` IDENTIFIED BY '{}';", input.root_id),
                    format!("GRANT ALL PRIVILEGES ON *.* TO `{user}`@`localhost`;"),
                    format!("GRANT ALL PRIVILEGES ON *.* TO `{user}`@`{host}`;"),
                ];
                let results = services
                    .gateway
                    .execute(RemoteCommand {
                        addresses: vec![address.clone()],
                        commands,
                        cloud_id: cluster.cloud_id,
                        force_continue_on_error: false,
                        timeout: services.config.sql_timeout(),
                        kind: CommandKind::Sql,
                    })
                    .await?;
                match require_all_ok(&results) {
                    Ok(()) => provisioned += 1,
                    Err(err) => {
                        if status == InstanceStatus::Running {
                            warn!(%address, %err, "temp account creation failed on running instance");
                            err_count += 1;
                        } else {
                            warn!(%address, status = %status, "instance not running, skipping temp account");
                        }
                    }
                }
            }
        }

        if err_count > 0 {
            return Err(ActivityError::execution(format!(
                "temp account creation failed on {err_count} running instances"
            )));
        }
        Ok(ActivityOutput::ok().with_outputs(json!({ "user": user, "instances": provisioned })))
    }
}

/// Parse a `major.minor.patch` version string for comparisons.
fn version_tuple(version: &str) -> (u32, u32) {
    let mut parts = version.split('.').filter_map(|p| p.parse::<u32>().ok());
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

/// Drop the per-ticket temporary admin account, cluster by cluster.
///
/// Statements run with binlog recording disabled for the session and the
/// batch is forced to completion so the trailing re-enable always executes.
/// `DROP USER IF EXISTS` makes replay after crash recovery a no-op.
pub struct DropTempAccountActivity;

#[async_trait]
impl Activity for DropTempAccountActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: TempAccountKwargs = input.parse_kwargs(StepCode::DropTempAccount)?;
        let user = temp_account_for(&input.root_id);
        let mut err_count = 0usize;

        for cluster_id in &kwargs.cluster_ids {
            let cluster = services.repository.get_cluster(*cluster_id).await?;
            let use_if_exists = version_tuple(&cluster.major_version) >= (5, 7);

            let instances: Vec<(String, InstanceStatus)> = cluster
                .storages
                .iter()
                .map(|s| (s.ip_port(), s.status))
                .chain(cluster.proxies.iter().map(|p| (p.ip_port(), p.status)))
                .collect();

            for (address, status) in instances {
                let host = address.split(':').next().unwrap_or("").to_string();
                let mut commands = vec!["set session sql_log_bin = 0 ;".to_string()];
                if use_if_exists {
                    commands.push(format!("drop user if exists `{user}`@`localhost`;"));
                    commands.push(format!("drop user if exists `{user}`@`{host}`;"));
                } else {
                    commands.push(format!("drop user `{user}`@`localhost`;"));
                    commands.push(format!("drop user `{user}`@`{host}`;"));
                }
                commands.push("set session sql_log_bin = 1 ;".to_string());

                let results = services
                    .gateway
                    .execute(RemoteCommand {
                        addresses: vec![address.clone()],
                        commands,
                        cloud_id: cluster.cloud_id,
                        // Middle statements may fail; the binlog re-enable
                        // must still run.
                        force_continue_on_error: true,
                        timeout: services.config.sql_timeout(),
                        kind: CommandKind::Sql,
                    })
                    .await?;
                if let Err(err) = require_all_ok(&results) {
                    if status == InstanceStatus::Running {
                        warn!(%address, %err, "temp account drop failed on running instance");
                        err_count += 1;
                    } else {
                        warn!(%address, status = %status, "instance not running, ignoring drop failure");
                    }
                }
            }
            info!(cluster = %cluster.immute_domain, user = %user, "temp account drop finished");
        }

        if err_count > 0 {
            return Err(ActivityError::execution(format!(
                "temp account drop failed on {err_count} running instances"
            )));
        }
        Ok(ActivityOutput::ok().with_outputs(json!({ "user": user })))
    }
}

#[derive(Debug, Deserialize)]
struct ClonePrivRulesKwargs {
    source_biz_id: i64,
    target_biz_id: i64,
    address: String,
    cloud_id: i64,
}

/// Copy account privilege rules to another business via the privilege
/// manager endpoint.
pub struct ClonePrivRulesActivity;

#[async_trait]
impl Activity for ClonePrivRulesActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: ClonePrivRulesKwargs = input.parse_kwargs(StepCode::ClonePrivRules)?;
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.address],
                commands: vec![format!(
                    "privctl clone-rules --source-biz {} --target-biz {}",
                    kwargs.source_biz_id, kwargs.target_biz_id
                )],
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
        Ok(ActivityOutput::ok())
    }
}

#[derive(Debug, Deserialize)]
struct TransferClusterMetaKwargs {
    cluster_ids: Vec<i64>,
    target_biz_id: i64,
}

/// Move cluster metadata (clusters and their entries) to another business.
pub struct TransferClusterMetaActivity;

#[async_trait]
impl Activity for TransferClusterMetaActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: TransferClusterMetaKwargs = input.parse_kwargs(StepCode::TransferClusterMeta)?;
        let mut batch = MutationBatch::new();
        for cluster_id in &kwargs.cluster_ids {
            batch.push(MutationOp::TransferClusterBiz {
                cluster_id: *cluster_id,
                target_biz_id: kwargs.target_biz_id,
            });
        }
        services.repository.mutate(batch).await?;
        info!(
            root_id = %input.root_id,
            clusters = kwargs.cluster_ids.len(),
            target_biz_id = kwargs.target_biz_id,
            "cluster metadata transferred"
        );
        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "clusters": kwargs.cluster_ids, "target_biz_id": kwargs.target_biz_id })))
    }
}

#[derive(Debug, Deserialize)]
struct UpdateDnsOwnershipKwargs {
    domains: Vec<String>,
    source_biz_id: i64,
    target_biz_id: i64,
    address: String,
    cloud_id: i64,
}

/// Repoint DNS record ownership to the target business on the DNS control
/// endpoint.
pub struct UpdateDnsOwnershipActivity;

#[async_trait]
impl Activity for UpdateDnsOwnershipActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: UpdateDnsOwnershipKwargs = input.parse_kwargs(StepCode::UpdateDnsOwnership)?;
        let commands = kwargs
            .domains
            .iter()
            .map(|domain| {
                format!(
                    "dnsctl transfer --domain {domain} --from-biz {} --to-biz {}",
                    kwargs.source_biz_id, kwargs.target_biz_id
                )
            })
            .collect();
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.address],
                commands,
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
        Ok(ActivityOutput::ok().with_outputs(json!({ "domains": kwargs.domains })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tuple_comparison() {
        assert!(version_tuple("5.7.26") >= (5, 7));
        assert!(version_tuple("8.0.30") >= (5, 7));
        assert!(version_tuple("5.6.1") < (5, 7));
        assert!(version_tuple("garbage") < (5, 7));
    }

    #[test]
    fn test_cleanup_script_covers_all_families() {
        for db_type in [
            DbType::Mysql,
            DbType::Sqlserver,
            DbType::Mongodb,
            DbType::Redis,
            DbType::Hdfs,
        ] {
            assert!(!cleanup_script(db_type).is_empty());
            assert!(!cleanup_account(db_type).is_empty());
        }
    }
}
