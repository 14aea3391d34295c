//! Read-consistent topology snapshots.
//!
//! A [`ClusterSnapshot`] is the planning input for flow controllers and the
//! sole input of the invariant checker: the full nested view of one cluster
//! (instances, entries, replication edges) as of one repository read.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::enums::{
    ClusterEntryRole, ClusterEntryType, ClusterPhase, ClusterStatus, ClusterType,
    InstanceInnerRole, InstancePhase, InstanceStatus, MachineType,
};

/// A `host:port` process address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub ip: String,
    pub port: u16,
}

impl Addr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Physical or virtual host an instance runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub ip: String,
    pub cloud_id: i64,
    pub machine_type: MachineType,
    pub os_name: String,
}

/// One end of a replication edge, seen from the instance holding the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPeer {
    pub addr: Addr,
    /// Cluster the peer instance belongs to
    pub cluster_id: i64,
    pub cluster_domain: String,
}

/// Replica-set membership of a MongoDB storage instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMembership {
    pub set_name: String,
    /// Config-server replica set of a sharded cluster
    pub is_config: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInstance {
    pub machine: Machine,
    pub port: u16,
    pub inner_role: InstanceInnerRole,
    pub status: InstanceStatus,
    pub phase: InstancePhase,
    /// Designated standby replica of an HA pair
    pub is_stand_by: bool,
    /// Member currently serving as the live backup source (MongoDB)
    pub is_backup_node: bool,
    pub shard: Option<ShardMembership>,
    /// Every cluster id this instance is recorded as a member of
    pub cluster_ids: Vec<i64>,
    /// Replication edges where this instance is the ejector
    pub as_ejector: Vec<ReplicationPeer>,
    /// Replication edges where this instance is the receiver
    pub as_receiver: Vec<ReplicationPeer>,
}

impl StorageInstance {
    pub fn addr(&self) -> Addr {
        Addr::new(self.machine.ip.clone(), self.port)
    }

    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.machine.ip, self.port)
    }

    /// Running and online
    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Running && self.phase == InstancePhase::Online
    }
}

/// A storage instance as referenced from a proxy's backend list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    pub addr: Addr,
    pub inner_role: InstanceInnerRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInstance {
    pub machine: Machine,
    pub port: u16,
    pub admin_port: u16,
    pub status: InstanceStatus,
    pub phase: InstancePhase,
    pub cluster_ids: Vec<i64>,
    /// Backends this proxy routes to
    pub storages: Vec<StorageRef>,
}

impl ProxyInstance {
    pub fn addr(&self) -> Addr {
        Addr::new(self.machine.ip.clone(), self.port)
    }

    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.machine.ip, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Running && self.phase == InstancePhase::Online
    }
}

/// A named access point routing traffic to a role-tagged set of instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub entry: String,
    pub entry_type: ClusterEntryType,
    pub role: ClusterEntryRole,
    pub bind_proxies: Vec<Addr>,
    pub bind_storages: Vec<Addr>,
}

/// Full nested view of one cluster, read-consistent at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub id: i64,
    pub name: String,
    pub immute_domain: String,
    pub biz_id: i64,
    pub cloud_id: i64,
    pub cluster_type: ClusterType,
    pub status: ClusterStatus,
    pub phase: ClusterPhase,
    pub major_version: String,
    pub storages: Vec<StorageInstance>,
    pub proxies: Vec<ProxyInstance>,
    pub entries: Vec<ClusterEntry>,
}

impl ClusterSnapshot {
    pub fn masters(&self) -> Vec<&StorageInstance> {
        self.storages
            .iter()
            .filter(|s| s.inner_role == InstanceInnerRole::Master)
            .collect()
    }

    pub fn standby_slaves(&self) -> Vec<&StorageInstance> {
        self.storages
            .iter()
            .filter(|s| s.inner_role == InstanceInnerRole::Slave && s.is_stand_by)
            .collect()
    }

    /// The designated standby replica, if exactly one exists.
    pub fn standby_slave(&self) -> Option<&StorageInstance> {
        let slaves = self.standby_slaves();
        if slaves.len() == 1 {
            Some(slaves[0])
        } else {
            None
        }
    }

    pub fn healthy_proxy_count(&self) -> usize {
        self.proxies.iter().filter(|p| p.is_healthy()).count()
    }

    pub fn master_entries(&self) -> Vec<&ClusterEntry> {
        self.entries
            .iter()
            .filter(|e| e.role == ClusterEntryRole::MasterEntry)
            .collect()
    }

    pub fn slave_entries(&self) -> Vec<&ClusterEntry> {
        self.entries
            .iter()
            .filter(|e| e.role == ClusterEntryRole::SlaveEntry)
            .collect()
    }

    pub fn is_sharded_cluster(&self) -> bool {
        self.cluster_type.is_sharded_mongo()
    }

    /// Every distinct host ip participating in this cluster, sorted.
    pub fn all_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .storages
            .iter()
            .map(|s| s.machine.ip.clone())
            .chain(self.proxies.iter().map(|p| p.machine.ip.clone()))
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }

    /// Mongos routers of a sharded cluster (proxy processes on mongos machines).
    pub fn mongos(&self) -> Vec<&ProxyInstance> {
        self.proxies
            .iter()
            .filter(|p| p.machine.machine_type == MachineType::Mongos)
            .collect()
    }

    /// Data shards grouped by replica-set name, sorted by set name.
    ///
    /// The config-server set is excluded; fetch it with [`Self::config_shard`].
    pub fn data_shards(&self) -> Vec<MongoShard<'_>> {
        self.shards_where(false)
    }

    pub fn config_shard(&self) -> Option<MongoShard<'_>> {
        self.shards_where(true).into_iter().next()
    }

    fn shards_where(&self, is_config: bool) -> Vec<MongoShard<'_>> {
        let mut shards: Vec<MongoShard<'_>> = Vec::new();
        for storage in &self.storages {
            let Some(membership) = &storage.shard else {
                continue;
            };
            if membership.is_config != is_config {
                continue;
            }
            match shards.iter_mut().find(|s| s.set_name == membership.set_name) {
                Some(shard) => shard.members.push(storage),
                None => shards.push(MongoShard {
                    set_name: membership.set_name.clone(),
                    is_config,
                    members: vec![storage],
                }),
            }
        }
        shards.sort_by(|a, b| a.set_name.cmp(&b.set_name));
        shards
    }
}

/// One replica set of a MongoDB cluster, borrowed from a snapshot.
#[derive(Debug, Clone)]
pub struct MongoShard<'a> {
    pub set_name: String,
    pub is_config: bool,
    pub members: Vec<&'a StorageInstance>,
}

impl<'a> MongoShard<'a> {
    /// Members not serving as the live backup source.
    pub fn not_backup_nodes(&self) -> Vec<&'a StorageInstance> {
        self.members
            .iter()
            .filter(|m| !m.is_backup_node)
            .copied()
            .collect()
    }

    /// The member chosen to receive restored data: the first non-backup node.
    pub fn exec_node(&self) -> Option<&'a StorageInstance> {
        self.not_backup_nodes().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_display() {
        assert_eq!(Addr::new("1.1.1.1", 20000).to_string(), "1.1.1.1:20000");
    }
}
