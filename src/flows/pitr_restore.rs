//! MongoDB point-in-time restore flow.
//!
//! The hardest fan-out shape in the system: per-shard restore work runs as
//! parallel sub-pipelines joined under one cluster sub-pipeline, joined in
//! turn under the top-level pipeline. Ordering invariants for sharded
//! clusters: the config-server rebuild strictly precedes the data-shard
//! rebuilds, and mongos routers restart strictly after every rebuild.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{db_actuator_package, FlowController, MEDIA_TARGET_PATH};
use crate::error::{FlowError, Result};
use crate::pipeline::{ActivitySpec, Pipeline, PipelineBuilder, SubPipeline, SubPipelineBuilder};
use crate::registry::{Services, StepCode};
use crate::ticket::Ticket;
use crate::topology::{ClusterSnapshot, DbType, MongoShard, StorageInstance};

/// Address of the backup-system control endpoint.
const BACKUP_API_ADDRESS: &str = "bkstore-api";

/// Restore staging directory; everything under it is disposable.
const RECOVER_DIR: &str = "/data/dbbak/recover_mg";

#[derive(Debug, Deserialize)]
struct RestoreInfo {
    src_cluster_id: i64,
    dst_cluster_id: i64,
    dst_time: String,
    apply_oplog: bool,
}

pub struct MongoPitrRestoreFlow;

impl MongoPitrRestoreFlow {
    /// Source and destination must have matching shard topology before any
    /// mutation happens.
    fn check_topology_match(src: &ClusterSnapshot, dst: &ClusterSnapshot) -> Result<()> {
        if src.is_sharded_cluster() != dst.is_sharded_cluster() {
            return Err(FlowError::Precondition(format!(
                "{} and {} have different topology kinds",
                src.immute_domain, dst.immute_domain
            )));
        }
        if src.data_shards().len() != dst.data_shards().len() {
            return Err(FlowError::Precondition(format!(
                "{} and {} have different shard counts",
                src.immute_domain, dst.immute_domain
            )));
        }
        if src.is_sharded_cluster() {
            for cluster in [src, dst] {
                let config = cluster.config_shard().ok_or_else(|| {
                    FlowError::Precondition(format!(
                        "{} has no config-server shard",
                        cluster.immute_domain
                    ))
                })?;
                if config.members.is_empty() {
                    return Err(FlowError::Precondition(format!(
                        "{} config shard has no member",
                        cluster.immute_domain
                    )));
                }
            }
        } else if src.data_shards().is_empty() {
            return Err(FlowError::Precondition(format!(
                "{} has no replica set",
                src.immute_domain
            )));
        }
        Ok(())
    }

    /// All shards of a cluster needing restore: data shards plus the
    /// config-server set for sharded clusters.
    fn restore_shards(cluster: &ClusterSnapshot) -> Vec<MongoShard<'_>> {
        let mut shards = cluster.data_shards();
        if cluster.is_sharded_cluster() {
            if let Some(config) = cluster.config_shard() {
                shards.push(config);
            }
        }
        shards
    }

    fn exec_node<'a>(
        cluster: &ClusterSnapshot,
        shard: &MongoShard<'a>,
    ) -> Result<&'a StorageInstance> {
        shard.exec_node().ok_or_else(|| {
            FlowError::Precondition(format!(
                "shard {} of {} has no member free of backup duty",
                shard.set_name, cluster.immute_domain
            ))
        })
    }

    fn instance_op(
        name: impl Into<String>,
        ip: &str,
        port: Option<u16>,
        cloud_id: i64,
        op: &str,
    ) -> ActivitySpec {
        ActivitySpec::new(
            name,
            StepCode::MongoInstanceOp,
            json!({
                "ip": ip,
                "port": port,
                "cloud_id": cloud_id,
                "op": op,
                "file_path": MEDIA_TARGET_PATH,
            }),
        )
    }

    /// One shard's restore chain: resolve records, download, replay.
    fn shard_restore_sub(
        info: &RestoreInfo,
        src_shard: &MongoShard<'_>,
        dst_shard: &MongoShard<'_>,
        exec_node: &StorageInstance,
        cloud_id: i64,
    ) -> SubPipeline {
        let mut sub = SubPipelineBuilder::new();
        sub.add_activity(ActivitySpec::new(
            format!("fetch backup records of {}", src_shard.set_name),
            StepCode::MongoFetchBackupRecord,
            json!({
                "src_cluster_id": info.src_cluster_id,
                "set_name": src_shard.set_name,
                "dst_time": info.dst_time,
                "backup_api_address": BACKUP_API_ADDRESS,
                "cloud_id": cloud_id,
            }),
        ));
        sub.add_activity(ActivitySpec::new(
            format!("download backup to {}", exec_node.machine.ip),
            StepCode::MongoDownloadBackup,
            json!({
                "src_cluster_id": info.src_cluster_id,
                "dest_ip": exec_node.machine.ip,
                "dest_dir": RECOVER_DIR,
                "set_name": src_shard.set_name,
                "cloud_id": cloud_id,
            }),
        ));
        sub.add_activity(ActivitySpec::new(
            format!("restore {} to {}", src_shard.set_name, dst_shard.set_name),
            StepCode::MongoPitrRestore,
            json!({
                "ip": exec_node.machine.ip,
                "port": exec_node.port,
                "set_name": dst_shard.set_name,
                "dst_time": info.dst_time,
                "apply_oplog": info.apply_oplog,
                "dest_dir": RECOVER_DIR,
                "cloud_id": cloud_id,
                "file_path": MEDIA_TARGET_PATH,
            }),
        ));
        sub.build_sub()
    }

    /// The full restore sub-pipeline for one destination cluster.
    fn cluster_sub(
        info: &RestoreInfo,
        src: &ClusterSnapshot,
        dst: &ClusterSnapshot,
    ) -> Result<SubPipeline> {
        let mut cluster_sub = SubPipelineBuilder::new();
        let cloud_id = dst.cloud_id;

        // Destination must not hold live data.
        let connect = dst
            .mongos()
            .first()
            .map(|m| m.machine.ip.clone())
            .or_else(|| dst.storages.first().map(|s| s.machine.ip.clone()))
            .ok_or_else(|| {
                FlowError::Precondition(format!("{} has no instance", dst.immute_domain))
            })?;
        cluster_sub.add_activity(Self::instance_op(
            "check destination is empty",
            &connect,
            None,
            cloud_id,
            "check_empty_data",
        ));

        // Monitoring daemons stop on every host first.
        let dbmon_acts: Vec<ActivitySpec> = dst
            .all_ips()
            .iter()
            .map(|ip| Self::instance_op(format!("stop dbmon {ip}"), ip, None, cloud_id, "stop_dbmon"))
            .collect();
        cluster_sub
            .add_parallel_acts(dbmon_acts)
            .map_err(|e| FlowError::Build(e.to_string()))?;

        // Sharded only: routers stop while data is rewritten underneath.
        if dst.is_sharded_cluster() {
            let mongos_acts: Vec<ActivitySpec> = dst
                .mongos()
                .iter()
                .map(|m| {
                    Self::instance_op(
                        format!("stop mongos {}", m.ip_port()),
                        &m.machine.ip,
                        Some(m.port),
                        cloud_id,
                        "stop_mongos",
                    )
                })
                .collect();
            if !mongos_acts.is_empty() {
                cluster_sub
                    .add_parallel_acts(mongos_acts)
                    .map_err(|e| FlowError::Build(e.to_string()))?;
            }
        }

        // Members not receiving restored data step down and stop.
        let dst_shards = Self::restore_shards(dst);
        let mut bystander_subs = Vec::new();
        for shard in &dst_shards {
            let exec_node = Self::exec_node(dst, shard)?;
            for member in &shard.members {
                if member.ip_port() == exec_node.ip_port() {
                    continue;
                }
                let mut member_sub = SubPipelineBuilder::new();
                member_sub.add_activity(Self::instance_op(
                    format!("demote {}", member.ip_port()),
                    &member.machine.ip,
                    Some(member.port),
                    cloud_id,
                    "demote",
                ));
                member_sub.add_activity(Self::instance_op(
                    format!("stop {}", member.ip_port()),
                    &member.machine.ip,
                    Some(member.port),
                    cloud_id,
                    "stop",
                ));
                bystander_subs.push((format!("park {}", member.ip_port()), member_sub.build_sub()));
            }
        }
        if !bystander_subs.is_empty() {
            cluster_sub
                .add_parallel_sub_pipelines(bystander_subs)
                .map_err(|e| FlowError::Build(e.to_string()))?;
        }

        // Per-shard restore, all shards in parallel under one join node.
        let src_shards = Self::restore_shards(src);
        let mut shard_subs = Vec::with_capacity(src_shards.len());
        for (src_shard, dst_shard) in src_shards.iter().zip(dst_shards.iter()) {
            let exec_node = Self::exec_node(dst, dst_shard)?;
            shard_subs.push((
                format!("restore {} to {}", src_shard.set_name, dst_shard.set_name),
                Self::shard_restore_sub(info, src_shard, dst_shard, exec_node, cloud_id),
            ));
        }
        let mut restore_sub = SubPipelineBuilder::new();
        restore_sub
            .add_parallel_sub_pipelines(shard_subs)
            .map_err(|e| FlowError::Build(e.to_string()))?;
        cluster_sub.add_sub_pipeline("restore_shards", restore_sub.build_sub());

        if dst.is_sharded_cluster() {
            // Config-server rebuild strictly precedes data-shard rebuilds.
            let config = dst
                .config_shard()
                .ok_or_else(|| FlowError::Precondition("config shard disappeared".to_string()))?;
            let config_exec = Self::exec_node(dst, &config)?;
            cluster_sub.add_activity(ActivitySpec::new(
                format!("rebuild config server {}", config.set_name),
                StepCode::MongoPitrRebuild,
                json!({
                    "ip": config_exec.machine.ip,
                    "port": config_exec.port,
                    "set_name": config.set_name,
                    "is_config": true,
                    "cloud_id": cloud_id,
                    "file_path": MEDIA_TARGET_PATH,
                }),
            ));

            let rebuild_acts: Vec<ActivitySpec> = dst
                .data_shards()
                .iter()
                .map(|shard| {
                    let exec_node = Self::exec_node(dst, shard)?;
                    Ok(ActivitySpec::new(
                        format!("rebuild shard {}", shard.set_name),
                        StepCode::MongoPitrRebuild,
                        json!({
                            "ip": exec_node.machine.ip,
                            "port": exec_node.port,
                            "set_name": shard.set_name,
                            "is_config": false,
                            "cloud_id": cloud_id,
                            "file_path": MEDIA_TARGET_PATH,
                        }),
                    ))
                })
                .collect::<Result<_>>()?;
            cluster_sub
                .add_parallel_acts(rebuild_acts)
                .map_err(|e| FlowError::Build(e.to_string()))?;

            // Routers come back only after every shard holds its identity.
            let start_acts: Vec<ActivitySpec> = dst
                .mongos()
                .iter()
                .map(|m| {
                    Self::instance_op(
                        format!("start mongos {}", m.ip_port()),
                        &m.machine.ip,
                        Some(m.port),
                        cloud_id,
                        "start_mongos",
                    )
                })
                .collect();
            if !start_acts.is_empty() {
                cluster_sub
                    .add_parallel_acts(start_acts)
                    .map_err(|e| FlowError::Build(e.to_string()))?;
            }
        }

        Ok(cluster_sub.build_sub())
    }
}

#[async_trait]
impl FlowController for MongoPitrRestoreFlow {
    async fn build(
        &self,
        ticket: &Ticket,
        services: &Services,
        root_id: &str,
    ) -> Result<Pipeline> {
        let infos: Vec<RestoreInfo> = serde_json::from_value(ticket.infos.clone())
            .map_err(|e| FlowError::Precondition(format!("restore payload: {e}")))?;
        if infos.is_empty() {
            return Err(FlowError::Precondition("no restore targets".to_string()));
        }

        let mut resolved = Vec::with_capacity(infos.len());
        let mut cloud_ids = Vec::new();
        let mut all_ips: Vec<String> = Vec::new();
        for info in &infos {
            if info.src_cluster_id <= 0 {
                return Err(FlowError::Precondition(
                    "source cluster id is required".to_string(),
                ));
            }
            let src = services.repository.get_cluster(info.src_cluster_id).await?;
            let dst = services.repository.get_cluster(info.dst_cluster_id).await?;
            Self::check_topology_match(&src, &dst)?;
            for shard in Self::restore_shards(&dst) {
                Self::exec_node(&dst, &shard)?;
            }
            cloud_ids.push(dst.cloud_id);
            all_ips.extend(dst.all_ips());
            resolved.push((src, dst));
        }
        cloud_ids.sort_unstable();
        cloud_ids.dedup();
        if cloud_ids.len() != 1 {
            return Err(FlowError::Precondition(
                "restore targets span different cloud regions".to_string(),
            ));
        }
        all_ips.sort();
        all_ips.dedup();

        let data = json!({
            "uid": ticket.uid,
            "created_by": ticket.created_by,
            "biz_id": ticket.biz_id,
            "ticket_type": ticket.ticket_type,
        });
        let mut builder = PipelineBuilder::new(root_id, data);

        builder.add_activity(ActivitySpec::new(
            format!("push actuator media to {} hosts", all_ips.len()),
            StepCode::TransFile,
            json!({
                "exec_ips": all_ips,
                "cloud_id": cloud_ids[0],
                "file_list": db_actuator_package(DbType::Mongodb),
                "file_target_path": MEDIA_TARGET_PATH,
            }),
        ));

        let mut cluster_subs = Vec::with_capacity(resolved.len());
        for (info, (src, dst)) in infos.iter().zip(resolved.iter()) {
            cluster_subs.push((
                format!("pitr cluster {}", dst.name),
                Self::cluster_sub(info, src, dst)?,
            ));
        }
        builder
            .add_parallel_sub_pipelines(cluster_subs)
            .map_err(|e| FlowError::Build(e.to_string()))?;

        builder.build().map_err(|e| FlowError::Build(e.to_string()))
    }
}
