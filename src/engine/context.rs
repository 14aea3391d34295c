//! Trans-data context: named values forwarded between pipeline nodes.
//!
//! Each key is written once, by the node that produced it, and read-only for
//! everything downstream. Replaying the same node (crash recovery, manual
//! retry) may rewrite its own keys; a different node writing an existing key
//! is a conflict.

use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::pipeline::NodeId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("trans key {key} already written by node {owner}, rejected write from node {writer}")]
    WriteConflict {
        key: String,
        owner: NodeId,
        writer: NodeId,
    },
}

#[derive(Debug, Clone)]
struct TransValue {
    value: Value,
    version: u64,
    written_by: NodeId,
}

/// Versioned key-value context scoped to one pipeline run.
#[derive(Debug, Default)]
pub struct TransData {
    values: HashMap<String, TransValue>,
    next_version: u64,
}

impl TransData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a key on behalf of a node. Rewrites by the same node are
    /// allowed (replay); writes to another node's key are rejected.
    pub fn write(
        &mut self,
        key: impl Into<String>,
        value: Value,
        written_by: NodeId,
    ) -> Result<(), ContextError> {
        let key = key.into();
        if let Some(existing) = self.values.get(&key) {
            if existing.written_by != written_by {
                return Err(ContextError::WriteConflict {
                    key,
                    owner: existing.written_by,
                    writer: written_by,
                });
            }
        }
        self.next_version += 1;
        self.values.insert(
            key,
            TransValue {
                value,
                version: self.next_version,
                written_by,
            },
        );
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|v| &v.value)
    }

    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.values.get(key).map(|v| v.version)
    }

    /// Read-only snapshot handed to an activity invocation.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_once_per_key() {
        let mut trans = TransData::new();
        trans.write("backup_id", json!("abc"), NodeId(1)).unwrap();

        let err = trans
            .write("backup_id", json!("other"), NodeId(2))
            .unwrap_err();
        assert!(matches!(err, ContextError::WriteConflict { .. }));
        assert_eq!(trans.get("backup_id"), Some(&json!("abc")));
    }

    #[test]
    fn test_same_node_may_rewrite_on_replay() {
        let mut trans = TransData::new();
        trans.write("fix_dbs", json!(["db1"]), NodeId(3)).unwrap();
        let v1 = trans.version_of("fix_dbs").unwrap();
        trans
            .write("fix_dbs", json!(["db1", "db2"]), NodeId(3))
            .unwrap();
        assert!(trans.version_of("fix_dbs").unwrap() > v1);
        assert_eq!(trans.get("fix_dbs"), Some(&json!(["db1", "db2"])));
    }
}
