//! Built-in activities, grouped by the database family they serve.

pub mod common;
pub mod mongodb;
pub mod mysql;
pub mod sqlserver;

use std::sync::Arc;

use super::{ActivityError, StepCode, StepRegistry};
use crate::gateway::AddressResult;

/// Build the complete built-in registry.
pub fn standard_registry() -> StepRegistry {
    StepRegistry::builder()
        .register(StepCode::TransFile, Arc::new(mysql::TransFileActivity))
        .register(
            StepCode::ClearMachineExecute,
            Arc::new(common::ClearMachineExecuteActivity),
        )
        .register(StepCode::DbMeta, Arc::new(common::DbMetaActivity))
        .register(
            StepCode::AddTempAccount,
            Arc::new(common::AddTempAccountActivity),
        )
        .register(
            StepCode::DropTempAccount,
            Arc::new(common::DropTempAccountActivity),
        )
        .register(
            StepCode::BuildTableFilter,
            Arc::new(mysql::BuildTableFilterActivity),
        )
        .register(
            StepCode::CheckTableFilter,
            Arc::new(mysql::CheckTableFilterActivity),
        )
        .register(
            StepCode::ExecTableBackup,
            Arc::new(mysql::ExecTableBackupActivity),
        )
        .register(StepCode::LinkBackupId, Arc::new(mysql::LinkBackupIdActivity))
        .register(
            StepCode::MongoInstanceOp,
            Arc::new(mongodb::MongoInstanceOpActivity),
        )
        .register(
            StepCode::MongoFetchBackupRecord,
            Arc::new(mongodb::MongoFetchBackupRecordActivity),
        )
        .register(
            StepCode::MongoDownloadBackup,
            Arc::new(mongodb::MongoDownloadBackupActivity),
        )
        .register(
            StepCode::MongoPitrRestore,
            Arc::new(mongodb::MongoPitrRestoreActivity),
        )
        .register(
            StepCode::MongoPitrRebuild,
            Arc::new(mongodb::MongoPitrRebuildActivity),
        )
        .register(
            StepCode::CheckSlaveSyncStatus,
            Arc::new(sqlserver::CheckSlaveSyncStatusActivity),
        )
        .register(
            StepCode::SqlserverBuildSyncGroup,
            Arc::new(sqlserver::SqlserverBuildSyncGroupActivity),
        )
        .register(
            StepCode::SqlserverRepairSync,
            Arc::new(sqlserver::SqlserverRepairSyncActivity),
        )
        .register(
            StepCode::AuthorizeRules,
            Arc::new(mysql::AuthorizeRulesActivity),
        )
        .register(
            StepCode::ClonePrivRules,
            Arc::new(common::ClonePrivRulesActivity),
        )
        .register(
            StepCode::TransferClusterMeta,
            Arc::new(common::TransferClusterMetaActivity),
        )
        .register(
            StepCode::UpdateDnsOwnership,
            Arc::new(common::UpdateDnsOwnershipActivity),
        )
        .build()
}

/// Fail on the first address whose batch did not fully succeed, with the
/// address in the error context.
pub(crate) fn require_all_ok(results: &[AddressResult]) -> Result<(), ActivityError> {
    for result in results {
        if let Some(error) = result.first_error() {
            return Err(ActivityError::execution(format!(
                "[{}] {error}",
                result.address
            )));
        }
    }
    Ok(())
}

/// Collect the first string column of every result row of the first command
/// on every address.
pub(crate) fn first_column_strings(results: &[AddressResult]) -> Vec<String> {
    let mut out = Vec::new();
    for result in results {
        for cmd in &result.cmd_results {
            for row in &cmd.rows {
                match row {
                    serde_json::Value::String(s) => out.push(s.clone()),
                    serde_json::Value::Object(map) => {
                        if let Some(s) = map.values().find_map(|v| v.as_str()) {
                            out.push(s.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    out
}

/// Name of the per-ticket temporary admin account, derived from the pipeline
/// root id so create and drop always agree.
pub(crate) fn temp_account_for(root_id: &str) -> String {
    let sanitized: String = root_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut name = format!("job_temp_{sanitized}");
    name.truncate(32);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CommandResult;
    use serde_json::json;

    #[test]
    fn test_temp_account_is_deterministic_and_bounded() {
        let a = temp_account_for("backup-2024-06-01-abcdef0123456789");
        let b = temp_account_for("backup-2024-06-01-abcdef0123456789");
        assert_eq!(a, b);
        assert!(a.len() <= 32);
        assert!(a.starts_with("job_temp_"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_first_column_strings_reads_objects_and_strings() {
        let results = vec![AddressResult {
            address: "10.0.0.1:48322".into(),
            error_msg: None,
            cmd_results: vec![CommandResult {
                command: "select name".into(),
                error_msg: String::new(),
                rows: vec![json!({"name": "db1"}), json!("db2")],
            }],
        }];
        assert_eq!(first_column_strings(&results), vec!["db1", "db2"]);
    }
}
