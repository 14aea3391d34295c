//! # Cluster Topology Metadata
//!
//! Snapshot types, metadata enums, and the repository façade that every flow
//! and the invariant checker read cluster state through. Mutation happens
//! only via [`repository::MutationBatch`]es — atomic from the pipeline's
//! point of view.

pub mod enums;
pub mod memory;
pub mod repository;
pub mod snapshot;

pub use enums::{
    ClusterEntryRole, ClusterEntryType, ClusterPhase, ClusterStatus, ClusterType, DbType,
    InstanceInnerRole, InstancePhase, InstanceStatus, MachineType,
};
pub use memory::MemoryTopologyRepository;
pub use repository::{
    ClusterFilter, MachineView, MutationBatch, MutationOp, TopologyError, TopologyRepository,
};
pub use snapshot::{
    Addr, ClusterEntry, ClusterSnapshot, Machine, MongoShard, ProxyInstance, ReplicationPeer,
    ShardMembership, StorageInstance, StorageRef,
};
