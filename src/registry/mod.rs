//! # Step Registry
//!
//! Catalog mapping step codes to executable activities. The code set is a
//! closed sum type, so a pipeline can only ever reference activities the
//! crate knows how to run; the registry itself is built once at startup and
//! immutable afterwards.

pub mod activities;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::gateway::{RemoteCommandGateway, RemoteError};
use crate::ticket::TodoStore;
use crate::topology::{TopologyError, TopologyRepository};

/// Closed set of step codes an activity node can carry.
///
/// Serialized forms are the stable codes recorded in persisted node rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCode {
    /// Push the actuator/media package to target hosts
    TransFile,
    /// Run the destructive machine-cleanup script
    ClearMachineExecute,
    /// Apply a named metadata mutation through the topology repository
    DbMeta,
    /// Provision the per-ticket temporary admin account
    AddTempAccount,
    /// Drop the per-ticket temporary admin account (idempotent)
    DropTempAccount,
    /// Build the include/exclude filter for a library/table-scoped backup
    BuildTableFilter,
    /// Validate the built filter against live schema objects
    CheckTableFilter,
    /// Execute the backup command on the chosen instance
    ExecTableBackup,
    /// Tag the produced backup artifact with the ticket's backup id
    LinkBackupId,
    /// Start/stop/demote one MongoDB process
    MongoInstanceOp,
    /// Resolve backup records for one shard at a point in time
    MongoFetchBackupRecord,
    /// Download backup files onto a shard's execution node
    MongoDownloadBackup,
    /// Replay backup files on a shard's execution node
    MongoPitrRestore,
    /// Rebuild cluster identity on a restored shard
    MongoPitrRebuild,
    /// Classify a SQLServer slave's sync state into a fix code
    CheckSlaveSyncStatus,
    /// Create the availability group for a slave being rebuilt
    SqlserverBuildSyncGroup,
    /// Re-establish database synchronization on a slave
    SqlserverRepairSync,
    /// Apply account privilege rules on target clusters
    AuthorizeRules,
    /// Copy privilege rules to another business
    ClonePrivRules,
    /// Move cluster metadata to another business
    TransferClusterMeta,
    /// Repoint access-entry ownership to another business
    UpdateDnsOwnership,
}

impl fmt::Display for StepCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransFile => "trans_file",
            Self::ClearMachineExecute => "clear_machine_execute",
            Self::DbMeta => "db_meta",
            Self::AddTempAccount => "add_job_temp_user",
            Self::DropTempAccount => "drop_job_temp_user",
            Self::BuildTableFilter => "build_table_filter",
            Self::CheckTableFilter => "check_table_filter",
            Self::ExecTableBackup => "exec_table_backup",
            Self::LinkBackupId => "link_backup_id",
            Self::MongoInstanceOp => "mongo_instance_op",
            Self::MongoFetchBackupRecord => "mongo_fetch_backup_record",
            Self::MongoDownloadBackup => "mongo_download_backup",
            Self::MongoPitrRestore => "mongo_pitr_restore",
            Self::MongoPitrRebuild => "mongo_pitr_rebuild",
            Self::CheckSlaveSyncStatus => "sqlserver_check_rebuild_slave",
            Self::SqlserverBuildSyncGroup => "sqlserver_build_sync_group",
            Self::SqlserverRepairSync => "sqlserver_repair_sync",
            Self::AuthorizeRules => "authorize_rules",
            Self::ClonePrivRules => "clone_priv_rules",
            Self::TransferClusterMeta => "transfer_cluster_meta",
            Self::UpdateDnsOwnership => "update_dns_ownership",
        };
        write!(f, "{s}")
    }
}

/// Errors an activity can report. They fail the enclosing node, never the
/// engine process.
#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("remote command failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("metadata operation failed: {0}")]
    Topology(#[from] TopologyError),

    #[error("invalid kwargs for {step}: {message}")]
    BadKwargs { step: StepCode, message: String },

    #[error("execution failed: {message}")]
    Execution { message: String },
}

impl ActivityError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}

/// Resolved inputs handed to one activity invocation: the global ticket
/// payload, the node's declared kwargs, and a read-only view of the
/// trans-data context produced by predecessor nodes.
#[derive(Debug, Clone)]
pub struct ActivityInput {
    pub root_id: String,
    pub node_id: u32,
    pub node_name: String,
    pub global: Value,
    pub kwargs: Value,
    pub trans: Map<String, Value>,
}

impl ActivityInput {
    /// Deserialize the node kwargs into the activity's typed kwargs struct.
    pub fn parse_kwargs<T: DeserializeOwned>(&self, step: StepCode) -> Result<T, ActivityError> {
        serde_json::from_value(self.kwargs.clone()).map_err(|e| ActivityError::BadKwargs {
            step,
            message: e.to_string(),
        })
    }

    pub fn global_str(&self, key: &str) -> Option<&str> {
        self.global.get(key).and_then(Value::as_str)
    }

    pub fn global_i64(&self, key: &str) -> Option<i64> {
        self.global.get(key).and_then(Value::as_i64)
    }

    pub fn trans_value(&self, key: &str) -> Option<&Value> {
        self.trans.get(key)
    }
}

/// What an activity produced: durable outputs, trans-data writes for
/// downstream nodes, and an optional branch code gating later siblings.
#[derive(Debug, Clone, Default)]
pub struct ActivityOutput {
    pub outputs: Value,
    pub trans_writes: Vec<(String, Value)>,
    pub branch_code: Option<i32>,
}

impl ActivityOutput {
    pub fn ok() -> Self {
        Self {
            outputs: Value::Null,
            ..Self::default()
        }
    }

    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn write_trans(mut self, key: impl Into<String>, value: Value) -> Self {
        self.trans_writes.push((key.into(), value));
        self
    }

    pub fn with_branch(mut self, code: i32) -> Self {
        self.branch_code = Some(code);
        self
    }
}

/// Shared collaborators handed to every activity invocation.
pub struct Services {
    pub repository: Arc<dyn TopologyRepository>,
    pub gateway: Arc<dyn RemoteCommandGateway>,
    pub todos: Arc<TodoStore>,
    pub config: EngineConfig,
}

/// A callable unit of work with a declared input/output contract.
///
/// Activities must tolerate being invoked twice with the same inputs: the
/// engine guarantees at-least-once execution across crash recovery, so
/// anything not naturally idempotent has to check-then-act.
#[async_trait]
pub trait Activity: Send + Sync {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError>;
}

/// Immutable step-code → activity catalog.
pub struct StepRegistry {
    activities: HashMap<StepCode, Arc<dyn Activity>>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder {
            activities: HashMap::new(),
        }
    }

    /// The full built-in catalog. Call once at startup, before any flow
    /// controller builds a pipeline.
    pub fn standard() -> Self {
        activities::standard_registry()
    }

    pub fn resolve(&self, code: StepCode) -> Option<Arc<dyn Activity>> {
        self.activities.get(&code).cloned()
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

pub struct StepRegistryBuilder {
    activities: HashMap<StepCode, Arc<dyn Activity>>,
}

impl StepRegistryBuilder {
    pub fn register(mut self, code: StepCode, activity: Arc<dyn Activity>) -> Self {
        if self.activities.insert(code, activity).is_some() {
            tracing::warn!(step = %code, "activity already registered, replacing");
        }
        self
    }

    pub fn build(self) -> StepRegistry {
        StepRegistry {
            activities: self.activities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_is_complete() {
        let registry = StepRegistry::standard();
        for code in [
            StepCode::TransFile,
            StepCode::ClearMachineExecute,
            StepCode::DbMeta,
            StepCode::AddTempAccount,
            StepCode::DropTempAccount,
            StepCode::BuildTableFilter,
            StepCode::CheckTableFilter,
            StepCode::ExecTableBackup,
            StepCode::LinkBackupId,
            StepCode::MongoInstanceOp,
            StepCode::MongoFetchBackupRecord,
            StepCode::MongoDownloadBackup,
            StepCode::MongoPitrRestore,
            StepCode::MongoPitrRebuild,
            StepCode::CheckSlaveSyncStatus,
            StepCode::SqlserverBuildSyncGroup,
            StepCode::SqlserverRepairSync,
            StepCode::AuthorizeRules,
            StepCode::ClonePrivRules,
            StepCode::TransferClusterMeta,
            StepCode::UpdateDnsOwnership,
        ] {
            assert!(registry.resolve(code).is_some(), "missing activity {code}");
        }
    }

    #[test]
    fn test_step_code_serde_is_stable() {
        assert_eq!(
            serde_json::to_string(&StepCode::DropTempAccount).unwrap(),
            "\"drop_temp_account\""
        );
        assert_eq!(StepCode::DropTempAccount.to_string(), "drop_job_temp_user");
    }
}
