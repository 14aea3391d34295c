//! Library/table-scoped backup flow.
//!
//! Line items naming the same cluster are merged into one cluster
//! sub-pipeline so the actuator media is transferred once per cluster. Each
//! job builds its filter, validates it against real schema objects, executes
//! the backup, and links the produced artifact back to the ticket under a
//! generated backup id.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{db_actuator_package, FlowController, MEDIA_TARGET_PATH};
use crate::error::{FlowError, Result};
use crate::pipeline::{ActivitySpec, Pipeline, PipelineBuilder, SubPipelineBuilder};
use crate::registry::{Services, StepCode};
use crate::ticket::Ticket;
use crate::topology::{
    ClusterSnapshot, ClusterType, DbType, InstanceInnerRole, StorageInstance,
};

#[derive(Debug, Clone, Deserialize)]
struct BackupJob {
    cluster_id: i64,
    db_patterns: Vec<String>,
    ignore_dbs: Vec<String>,
    table_patterns: Vec<String>,
    ignore_tables: Vec<String>,
}

pub struct DbTableBackupFlow;

impl DbTableBackupFlow {
    /// The instance the backup runs on: the designated standby slave for HA
    /// clusters, any running+online storage otherwise.
    fn backup_instance<'a>(cluster: &'a ClusterSnapshot) -> Result<&'a StorageInstance> {
        let instance = if cluster.cluster_type == ClusterType::TendbHa {
            cluster.storages.iter().find(|s| {
                s.inner_role == InstanceInnerRole::Slave && s.is_stand_by && s.is_healthy()
            })
        } else {
            cluster.storages.iter().find(|s| s.is_healthy())
        };
        instance.ok_or_else(|| {
            FlowError::Precondition(format!(
                "cluster {} has no healthy backup instance",
                cluster.immute_domain
            ))
        })
    }
}

#[async_trait]
impl FlowController for DbTableBackupFlow {
    async fn build(
        &self,
        ticket: &Ticket,
        services: &Services,
        root_id: &str,
    ) -> Result<Pipeline> {
        let jobs: Vec<BackupJob> = serde_json::from_value(ticket.infos.clone())
            .map_err(|e| FlowError::Precondition(format!("backup payload: {e}")))?;
        if jobs.is_empty() {
            return Err(FlowError::Precondition("no backup jobs".to_string()));
        }

        // Merge duplicate cluster ids so media transfers once per cluster.
        let mut merged: Vec<(i64, Vec<BackupJob>)> = Vec::new();
        for job in jobs {
            match merged.iter_mut().find(|(id, _)| *id == job.cluster_id) {
                Some((_, bucket)) => bucket.push(job),
                None => merged.push((job.cluster_id, vec![job])),
            }
        }

        let mut clusters = Vec::with_capacity(merged.len());
        for (cluster_id, bucket) in merged {
            let cluster = services.repository.get_cluster(cluster_id).await?;
            // Validated before any pipeline exists.
            Self::backup_instance(&cluster)?;
            clusters.push((cluster, bucket));
        }
        let cluster_ids: Vec<i64> = clusters.iter().map(|(c, _)| c.id).collect();

        let data = json!({
            "uid": ticket.uid,
            "created_by": ticket.created_by,
            "biz_id": ticket.biz_id,
            "ticket_type": ticket.ticket_type,
        });
        let mut builder = PipelineBuilder::new(root_id, data);

        builder.add_activity(ActivitySpec::new(
            "provision ticket admin account",
            StepCode::AddTempAccount,
            json!({ "cluster_ids": cluster_ids }),
        ));

        let mut cluster_subs = Vec::with_capacity(clusters.len());
        for (cluster, bucket) in &clusters {
            let instance = Self::backup_instance(cluster)?;
            let mut cluster_sub = SubPipelineBuilder::new();

            cluster_sub.add_activity(ActivitySpec::new(
                "push actuator media",
                StepCode::TransFile,
                json!({
                    "exec_ips": [instance.machine.ip],
                    "cloud_id": cluster.cloud_id,
                    "file_list": db_actuator_package(DbType::Mysql),
                    "file_target_path": MEDIA_TARGET_PATH,
                }),
            ));

            for job in bucket {
                let backup_id = Uuid::new_v4().to_string();
                let mut job_sub = SubPipelineBuilder::new();
                job_sub.add_activity(ActivitySpec::new(
                    "build table filter",
                    StepCode::BuildTableFilter,
                    json!({
                        "ns": backup_id,
                        "db_patterns": job.db_patterns,
                        "ignore_dbs": job.ignore_dbs,
                        "table_patterns": job.table_patterns,
                        "ignore_tables": job.ignore_tables,
                    }),
                ));
                job_sub.add_activity(ActivitySpec::new(
                    "validate filter against schema",
                    StepCode::CheckTableFilter,
                    json!({
                        "ns": backup_id,
                        "address": instance.ip_port(),
                        "cloud_id": cluster.cloud_id,
                    }),
                ));
                job_sub.add_activity(ActivitySpec::new(
                    "execute table backup",
                    StepCode::ExecTableBackup,
                    json!({
                        "ns": backup_id,
                        "exec_ip": instance.machine.ip,
                        "port": instance.port,
                        "cloud_id": cluster.cloud_id,
                        "backup_id": backup_id,
                        "backup_type": "logical",
                        "backup_gsd": ["schema", "data"],
                        "custom_backup_dir": "backupDatabaseTable",
                        "role": instance.inner_role,
                    }),
                ));
                job_sub.add_activity(ActivitySpec::new(
                    "link backup artifact",
                    StepCode::LinkBackupId,
                    json!({ "ns": backup_id }),
                ));

                let sub_name = format!(
                    "include db: {:?}, exclude db: {:?}, include table: {:?}, exclude table: {:?}",
                    job.db_patterns, job.ignore_dbs, job.table_patterns, job.ignore_tables
                );
                cluster_sub.add_sub_pipeline(sub_name, job_sub.build_sub());
            }

            cluster_subs.push((
                format!("table backup of {}", cluster.immute_domain),
                cluster_sub.build_sub(),
            ));
        }
        builder
            .add_parallel_sub_pipelines(cluster_subs)
            .map_err(|e| FlowError::Build(e.to_string()))?;

        builder.add_activity(ActivitySpec::new(
            "drop ticket admin account",
            StepCode::DropTempAccount,
            json!({ "cluster_ids": cluster_ids }),
        ));
        // Also dropped best-effort when the pipeline is terminated mid-run.
        builder.add_cleanup_activity(ActivitySpec::new(
            "drop ticket admin account",
            StepCode::DropTempAccount,
            json!({ "cluster_ids": cluster_ids }),
        ));

        builder.build().map_err(|e| FlowError::Build(e.to_string()))
    }
}
