//! Topology metadata enums.
//!
//! Value sets mirror the persisted metadata store; serialized forms are the
//! lowercase strings used in stored snapshots and reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment architecture of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    /// Highly-available relational pair (master + standby slave behind proxies)
    TendbHa,
    /// Single-node relational deployment
    TendbSingle,
    /// Sharded relational deployment fronted by spider nodes
    TendbCluster,
    SqlserverHa,
    MongoReplicaSet,
    MongoShardedCluster,
    RedisCluster,
    Hdfs,
}

impl ClusterType {
    /// Whether this type carries the one-master/one-standby HA invariants
    pub fn is_ha(&self) -> bool {
        matches!(self, Self::TendbHa | Self::SqlserverHa)
    }

    pub fn is_sharded_mongo(&self) -> bool {
        matches!(self, Self::MongoShardedCluster)
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TendbHa => "tendbha",
            Self::TendbSingle => "tendbsingle",
            Self::TendbCluster => "tendbcluster",
            Self::SqlserverHa => "sqlserver_ha",
            Self::MongoReplicaSet => "mongo_replica_set",
            Self::MongoShardedCluster => "mongo_sharded_cluster",
            Self::RedisCluster => "redis_cluster",
            Self::Hdfs => "hdfs",
        };
        write!(f, "{s}")
    }
}

/// Database family, used to pick remote accounts and cleanup scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
    Mysql,
    Sqlserver,
    Mongodb,
    Redis,
    Hdfs,
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mysql => "mysql",
            Self::Sqlserver => "sqlserver",
            Self::Mongodb => "mongodb",
            Self::Redis => "redis",
            Self::Hdfs => "hdfs",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Normal,
    Abnormal,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Abnormal => write!(f, "abnormal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    Online,
    Offline,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Unavailable,
    Restoring,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Restoring => write!(f, "restoring"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    Online,
    Offline,
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Role of a storage instance inside its own cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceInnerRole {
    Master,
    Slave,
    /// Sole storage of a single-node cluster
    Orphan,
}

impl fmt::Display for InstanceInnerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
            Self::Orphan => write!(f, "orphan"),
        }
    }
}

/// Machine flavor an instance process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineType {
    Backend,
    Proxy,
    Spider,
    Mongodb,
    Mongos,
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backend => "backend",
            Self::Proxy => "proxy",
            Self::Spider => "spider",
            Self::Mongodb => "mongodb",
            Self::Mongos => "mongos",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEntryType {
    Dns,
    Clb,
    Polaris,
}

impl fmt::Display for ClusterEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns => write!(f, "dns"),
            Self::Clb => write!(f, "clb"),
            Self::Polaris => write!(f, "polaris"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEntryRole {
    MasterEntry,
    SlaveEntry,
}

impl fmt::Display for ClusterEntryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MasterEntry => write!(f, "master_entry"),
            Self::SlaveEntry => write!(f, "slave_entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ha_classification() {
        assert!(ClusterType::TendbHa.is_ha());
        assert!(ClusterType::SqlserverHa.is_ha());
        assert!(!ClusterType::TendbSingle.is_ha());
        assert!(!ClusterType::MongoShardedCluster.is_ha());
    }

    #[test]
    fn test_serde_forms() {
        assert_eq!(
            serde_json::to_string(&InstanceStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&ClusterEntryRole::MasterEntry).unwrap(),
            "\"master_entry\""
        );
    }

    #[test]
    fn test_display_matches_lowercase() {
        assert_eq!(InstancePhase::Online.to_string(), "online");
        assert_eq!(ClusterStatus::Abnormal.to_string(), "abnormal");
    }
}
