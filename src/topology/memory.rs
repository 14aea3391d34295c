//! In-memory topology repository.
//!
//! Backs tests and embedded use. Mutation batches are applied on a working
//! copy and committed with a single swap, so a failed batch never leaves
//! partially-applied state behind.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::repository::{
    ClusterFilter, MachineView, MutationBatch, MutationOp, TopologyError, TopologyRepository,
};
use super::snapshot::ClusterSnapshot;

#[derive(Default)]
pub struct MemoryTopologyRepository {
    clusters: RwLock<HashMap<i64, ClusterSnapshot>>,
}

impl MemoryTopologyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cluster snapshot. Replaces any previous snapshot with the same id.
    pub fn insert_cluster(&self, cluster: ClusterSnapshot) {
        self.clusters.write().insert(cluster.id, cluster);
    }

    fn apply_op(
        clusters: &mut HashMap<i64, ClusterSnapshot>,
        op: &MutationOp,
    ) -> Result<(), TopologyError> {
        match op {
            MutationOp::ClearMachine { ip } => {
                let mut found = false;
                for cluster in clusters.values_mut() {
                    let before = cluster.storages.len() + cluster.proxies.len();
                    cluster.storages.retain(|s| &s.machine.ip != ip);
                    cluster.proxies.retain(|p| &p.machine.ip != ip);
                    if cluster.storages.len() + cluster.proxies.len() != before {
                        found = true;
                    }
                }
                if !found {
                    return Err(TopologyError::MachineNotFound { ip: ip.clone() });
                }
                Ok(())
            }
            MutationOp::TransferClusterBiz {
                cluster_id,
                target_biz_id,
            } => {
                let cluster = clusters.get_mut(cluster_id).ok_or(
                    TopologyError::ClusterNotFound {
                        cluster_id: *cluster_id,
                    },
                )?;
                cluster.biz_id = *target_biz_id;
                Ok(())
            }
            MutationOp::UpdateInstanceStatus {
                cluster_id,
                addr,
                status,
            } => {
                let cluster = clusters.get_mut(cluster_id).ok_or(
                    TopologyError::ClusterNotFound {
                        cluster_id: *cluster_id,
                    },
                )?;
                let storage = cluster
                    .storages
                    .iter_mut()
                    .find(|s| s.machine.ip == addr.ip && s.port == addr.port)
                    .ok_or(TopologyError::InstanceNotFound {
                        cluster_id: *cluster_id,
                        addr: addr.to_string(),
                    })?;
                storage.status = *status;
                Ok(())
            }
            MutationOp::UpdateInstancePhase {
                cluster_id,
                addr,
                phase,
            } => {
                let cluster = clusters.get_mut(cluster_id).ok_or(
                    TopologyError::ClusterNotFound {
                        cluster_id: *cluster_id,
                    },
                )?;
                let storage = cluster
                    .storages
                    .iter_mut()
                    .find(|s| s.machine.ip == addr.ip && s.port == addr.port)
                    .ok_or(TopologyError::InstanceNotFound {
                        cluster_id: *cluster_id,
                        addr: addr.to_string(),
                    })?;
                storage.phase = *phase;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TopologyRepository for MemoryTopologyRepository {
    async fn get_cluster(&self, id: i64) -> Result<ClusterSnapshot, TopologyError> {
        self.clusters
            .read()
            .get(&id)
            .cloned()
            .ok_or(TopologyError::ClusterNotFound { cluster_id: id })
    }

    async fn get_cluster_by_domain(&self, domain: &str) -> Result<ClusterSnapshot, TopologyError> {
        self.clusters
            .read()
            .values()
            .find(|c| c.immute_domain == domain)
            .cloned()
            .ok_or_else(|| TopologyError::DomainNotFound {
                domain: domain.to_string(),
            })
    }

    async fn list_clusters(
        &self,
        filter: &ClusterFilter,
    ) -> Result<Vec<ClusterSnapshot>, TopologyError> {
        let clusters = self.clusters.read();
        let mut out: Vec<ClusterSnapshot> = clusters
            .values()
            .filter(|c| {
                filter
                    .cluster_type
                    .map_or(true, |t| c.cluster_type == t)
            })
            .filter(|c| filter.biz_id.map_or(true, |b| c.biz_id == b))
            .filter(|c| {
                filter
                    .domains
                    .as_ref()
                    .map_or(true, |ds| ds.contains(&c.immute_domain))
            })
            .cloned()
            .collect();
        out.sort_by_key(|c| c.id);
        Ok(out)
    }

    async fn machine_view(&self, ip: &str) -> Result<MachineView, TopologyError> {
        let clusters = self.clusters.read();
        let mut machine = None;
        let mut storages = Vec::new();
        let mut proxies = Vec::new();
        for cluster in clusters.values() {
            for s in &cluster.storages {
                if s.machine.ip == ip {
                    machine.get_or_insert_with(|| s.machine.clone());
                    storages.push((cluster.id, s.addr()));
                }
            }
            for p in &cluster.proxies {
                if p.machine.ip == ip {
                    machine.get_or_insert_with(|| p.machine.clone());
                    proxies.push((cluster.id, p.addr()));
                }
            }
        }
        match machine {
            Some(machine) => Ok(MachineView {
                machine,
                storages,
                proxies,
            }),
            None => Err(TopologyError::MachineNotFound { ip: ip.to_string() }),
        }
    }

    async fn mutate(&self, batch: MutationBatch) -> Result<(), TopologyError> {
        let mut clusters = self.clusters.write();
        // Work on a copy; commit only if every op applies cleanly.
        let mut working = clusters.clone();
        for op in &batch.ops {
            Self::apply_op(&mut working, op)?;
        }
        *clusters = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use crate::topology::enums::InstancePhase;
    use crate::topology::snapshot::Addr;

    #[tokio::test]
    async fn test_atomic_batch_rolls_back_on_error() {
        let repo = MemoryTopologyRepository::new();
        repo.insert_cluster(fixtures::healthy_ha_cluster(1, "db.test.local"));

        let mut batch = MutationBatch::new();
        batch.push(MutationOp::UpdateInstancePhase {
            cluster_id: 1,
            addr: Addr::new("10.1.0.2", 20000),
            phase: InstancePhase::Offline,
        });
        // Second op references a machine that does not exist, failing the batch.
        batch.push(MutationOp::ClearMachine {
            ip: "192.0.2.99".to_string(),
        });

        assert!(repo.mutate(batch).await.is_err());

        let cluster = repo.get_cluster(1).await.unwrap();
        let slave = cluster
            .storages
            .iter()
            .find(|s| s.machine.ip == "10.1.0.2")
            .unwrap();
        assert_eq!(slave.phase, InstancePhase::Online);
    }

    #[tokio::test]
    async fn test_clear_machine_detaches_all_instances() {
        let repo = MemoryTopologyRepository::new();
        repo.insert_cluster(fixtures::healthy_ha_cluster(1, "db.test.local"));

        let view = repo.machine_view("10.1.0.1").await.unwrap();
        assert_eq!(view.instance_count(), 1);

        repo.mutate(MutationBatch::single(MutationOp::ClearMachine {
            ip: "10.1.0.1".to_string(),
        }))
        .await
        .unwrap();

        assert!(repo.machine_view("10.1.0.1").await.is_err());
        let cluster = repo.get_cluster(1).await.unwrap();
        assert!(cluster.storages.iter().all(|s| s.machine.ip != "10.1.0.1"));
    }
}
