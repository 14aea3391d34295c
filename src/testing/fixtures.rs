//! Synthetic cluster snapshots for tests.

use crate::topology::{
    Addr, ClusterEntry, ClusterEntryRole, ClusterEntryType, ClusterPhase, ClusterSnapshot,
    ClusterStatus, ClusterType, InstanceInnerRole, InstancePhase, InstanceStatus, Machine,
    MachineType, ProxyInstance, ReplicationPeer, ShardMembership, StorageInstance, StorageRef,
};

pub fn machine(ip: &str, machine_type: MachineType) -> Machine {
    Machine {
        ip: ip.to_string(),
        cloud_id: 0,
        machine_type,
        os_name: "linux".to_string(),
    }
}

pub fn storage(
    ip: &str,
    port: u16,
    inner_role: InstanceInnerRole,
    is_stand_by: bool,
) -> StorageInstance {
    StorageInstance {
        machine: machine(ip, MachineType::Backend),
        port,
        inner_role,
        status: InstanceStatus::Running,
        phase: InstancePhase::Online,
        is_stand_by,
        is_backup_node: false,
        shard: None,
        cluster_ids: Vec::new(),
        as_ejector: Vec::new(),
        as_receiver: Vec::new(),
    }
}

pub fn proxy(ip: &str, port: u16, master: &StorageInstance) -> ProxyInstance {
    ProxyInstance {
        machine: machine(ip, MachineType::Proxy),
        port,
        admin_port: port + 1000,
        status: InstanceStatus::Running,
        phase: InstancePhase::Online,
        cluster_ids: Vec::new(),
        storages: vec![StorageRef {
            addr: master.addr(),
            inner_role: master.inner_role,
        }],
    }
}

/// A healthy TenDB HA cluster: one running/online master, one running/online
/// standby slave replicating from it, two healthy proxies bound to the
/// master, and one master entry bound to both proxies.
///
/// Host ips embed the cluster id, so clusters seeded side by side never
/// share machines.
pub fn healthy_ha_cluster(id: i64, domain: &str) -> ClusterSnapshot {
    let ip = |host: u8| format!("10.{id}.0.{host}");
    let mut master = storage(&ip(1), 20000, InstanceInnerRole::Master, false);
    let mut slave = storage(&ip(2), 20000, InstanceInnerRole::Slave, true);
    master.cluster_ids = vec![id];
    slave.cluster_ids = vec![id];
    master.as_ejector = vec![ReplicationPeer {
        addr: slave.addr(),
        cluster_id: id,
        cluster_domain: domain.to_string(),
    }];
    slave.as_receiver = vec![ReplicationPeer {
        addr: master.addr(),
        cluster_id: id,
        cluster_domain: domain.to_string(),
    }];

    let proxy_a = proxy(&ip(3), 10000, &master);
    let proxy_b = proxy(&ip(4), 10000, &master);
    let entry = ClusterEntry {
        entry: domain.to_string(),
        entry_type: ClusterEntryType::Dns,
        role: ClusterEntryRole::MasterEntry,
        bind_proxies: vec![proxy_a.addr(), proxy_b.addr()],
        bind_storages: Vec::new(),
    };

    ClusterSnapshot {
        id,
        name: domain.split('.').next().unwrap_or(domain).to_string(),
        immute_domain: domain.to_string(),
        biz_id: 100,
        cloud_id: 0,
        cluster_type: ClusterType::TendbHa,
        status: ClusterStatus::Normal,
        phase: ClusterPhase::Online,
        major_version: "5.7.26".to_string(),
        storages: vec![master, slave],
        proxies: vec![proxy_a, proxy_b],
        entries: vec![entry],
    }
}

fn mongo_member(ip: &str, set_name: &str, is_config: bool, is_backup_node: bool) -> StorageInstance {
    StorageInstance {
        machine: machine(ip, MachineType::Mongodb),
        port: 27001,
        inner_role: InstanceInnerRole::Slave,
        status: InstanceStatus::Running,
        phase: InstancePhase::Online,
        is_stand_by: false,
        is_backup_node,
        shard: Some(ShardMembership {
            set_name: set_name.to_string(),
            is_config,
        }),
        cluster_ids: Vec::new(),
        as_ejector: Vec::new(),
        as_receiver: Vec::new(),
    }
}

/// A MongoDB cluster: `shard_count` data shards of three members each (one
/// carrying backup duty), plus — for sharded clusters — a config-server set
/// and two mongos routers.
pub fn mongo_cluster(id: i64, domain: &str, sharded: bool, shard_count: usize) -> ClusterSnapshot {
    let mut storages = Vec::new();
    let mut subnet = 10;
    for shard_idx in 0..shard_count {
        let set_name = format!("s{shard_idx}");
        for member_idx in 0..3 {
            storages.push(mongo_member(
                &format!("10.{id}.{subnet}.{}", member_idx + 1),
                &set_name,
                false,
                member_idx == 0,
            ));
        }
        subnet += 1;
    }

    let mut proxies = Vec::new();
    if sharded {
        for member_idx in 0..3 {
            storages.push(mongo_member(
                &format!("10.{id}.{subnet}.{}", member_idx + 1),
                "conf",
                true,
                member_idx == 0,
            ));
        }
        for mongos_idx in 0..2 {
            proxies.push(ProxyInstance {
                machine: machine(&format!("10.{id}.200.{}", mongos_idx + 1), MachineType::Mongos),
                port: 27017,
                admin_port: 28017,
                status: InstanceStatus::Running,
                phase: InstancePhase::Online,
                cluster_ids: vec![id],
                storages: Vec::new(),
            });
        }
    }

    ClusterSnapshot {
        id,
        name: domain.split('.').next().unwrap_or(domain).to_string(),
        immute_domain: domain.to_string(),
        biz_id: 100,
        cloud_id: 0,
        cluster_type: if sharded {
            ClusterType::MongoShardedCluster
        } else {
            ClusterType::MongoReplicaSet
        },
        status: ClusterStatus::Normal,
        phase: ClusterPhase::Online,
        major_version: "4.2.0".to_string(),
        storages,
        proxies,
        entries: Vec::new(),
    }
}

/// A healthy SQLServer HA cluster with one master and one rebuildable slave.
pub fn sqlserver_ha_cluster(id: i64, domain: &str) -> ClusterSnapshot {
    let mut cluster = healthy_ha_cluster(id, domain);
    cluster.cluster_type = ClusterType::SqlserverHa;
    cluster.major_version = "2017".to_string();
    cluster.proxies.clear();
    cluster.entries.clear();
    for storage in &mut cluster.storages {
        storage.port = 48322;
    }
    cluster
}

/// An extra cluster whose storage replicates FROM the given cluster's
/// master, creating a cross-cluster edge on the source side.
pub fn add_cross_cluster_replication(cluster: &mut ClusterSnapshot, other_id: i64, other_domain: &str) {
    let foreign = Addr::new("10.9.9.9", 20000);
    if let Some(master) = cluster
        .storages
        .iter_mut()
        .find(|s| s.inner_role == InstanceInnerRole::Master)
    {
        master.as_ejector.push(ReplicationPeer {
            addr: foreign,
            cluster_id: other_id,
            cluster_domain: other_domain.to_string(),
        });
    }
}
