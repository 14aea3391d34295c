//! # Topology Repository
//!
//! Narrow façade over the durable cluster/instance/machine metadata store.
//! Reads return immutable [`ClusterSnapshot`]s; writes go through
//! [`MutationBatch`]es that the backing store applies atomically. All
//! metadata mutation in the system funnels through this interface — flows
//! never write metadata behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::enums::{ClusterType, InstancePhase, InstanceStatus};
use super::snapshot::{Addr, ClusterSnapshot, Machine};

/// Errors surfaced by the metadata store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("cluster {cluster_id} does not exist")]
    ClusterNotFound { cluster_id: i64 },

    #[error("cluster with domain {domain} does not exist")]
    DomainNotFound { domain: String },

    #[error("machine {ip} does not exist")]
    MachineNotFound { ip: String },

    #[error("instance {addr} does not exist in cluster {cluster_id}")]
    InstanceNotFound { cluster_id: i64, addr: String },

    #[error("invalid mutation: {message}")]
    InvalidMutation { message: String },

    #[error("metadata transaction failed: {message}")]
    TransactionFailed { message: String },
}

/// One metadata mutation. Batched mutations apply atomically: either every
/// op in the batch is visible afterwards or none is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    /// Detach and delete every instance bound to the machine, then the
    /// machine record itself. Instance detachment always precedes machine
    /// deletion inside the transaction.
    ClearMachine { ip: String },

    /// Move a cluster (and its entries) to another business.
    TransferClusterBiz { cluster_id: i64, target_biz_id: i64 },

    UpdateInstanceStatus {
        cluster_id: i64,
        addr: Addr,
        status: InstanceStatus,
    },

    UpdateInstancePhase {
        cluster_id: i64,
        addr: Addr,
        phase: InstancePhase,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationBatch {
    pub ops: Vec<MutationOp>,
}

impl MutationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(op: MutationOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn push(&mut self, op: MutationOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Criteria for listing clusters (checker sweeps, transfer flows).
#[derive(Debug, Clone, Default)]
pub struct ClusterFilter {
    pub cluster_type: Option<ClusterType>,
    pub biz_id: Option<i64>,
    pub domains: Option<Vec<String>>,
}

/// A machine together with every instance bound to it, across clusters.
#[derive(Debug, Clone)]
pub struct MachineView {
    pub machine: Machine,
    /// (cluster id, address) of storage instances on this machine
    pub storages: Vec<(i64, Addr)>,
    /// (cluster id, address) of proxy instances on this machine
    pub proxies: Vec<(i64, Addr)>,
}

impl MachineView {
    pub fn instance_count(&self) -> usize {
        self.storages.len() + self.proxies.len()
    }
}

/// Read/write façade over cluster/instance/machine/entry metadata.
#[async_trait]
pub trait TopologyRepository: Send + Sync {
    /// Fetch one cluster with nested instances, entries, and replication
    /// edges, read-consistent at call time.
    async fn get_cluster(&self, id: i64) -> Result<ClusterSnapshot, TopologyError>;

    async fn get_cluster_by_domain(&self, domain: &str) -> Result<ClusterSnapshot, TopologyError>;

    async fn list_clusters(
        &self,
        filter: &ClusterFilter,
    ) -> Result<Vec<ClusterSnapshot>, TopologyError>;

    /// Everything bound to one machine, for detach-before-delete planning.
    async fn machine_view(&self, ip: &str) -> Result<MachineView, TopologyError>;

    /// Apply a mutation batch atomically. A failed batch leaves no trace.
    async fn mutate(&self, batch: MutationBatch) -> Result<(), TopologyError>;
}
