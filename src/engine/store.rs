//! # Pipeline Store
//!
//! Durable record of pipeline and node state. Node rows are keyed by
//! `(root_id, node_id)` and carry the serialized kwargs and outputs — this
//! is the resumability record the engine consults to skip completed work
//! after a restart or a manual retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use super::states::{NodeState, PipelineState};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {message}")]
    Backend { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted state of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub root_id: String,
    pub node_id: u32,
    pub name: String,
    pub state: NodeState,
    /// Kwargs as resolved at first execution; reused verbatim on retry
    pub kwargs: Value,
    pub outputs: Value,
    /// Trans-data writes the node produced, replayed on resume
    pub trans_writes: Vec<(String, Value)>,
    pub branch_code: Option<i32>,
    pub error: Option<String>,
    /// Operator that triggered the most recent manual retry
    pub retried_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(root_id: impl Into<String>, node_id: u32, name: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            node_id,
            name: name.into(),
            state: NodeState::Pending,
            kwargs: Value::Null,
            outputs: Value::Null,
            trans_writes: Vec::new(),
            branch_code: None,
            error: None,
            retried_by: None,
            updated_at: Utc::now(),
        }
    }
}

/// Durable store for pipeline runs. Implementations must make a written
/// record visible to subsequent reads from any task.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn upsert_node(&self, record: NodeRecord) -> Result<(), StoreError>;

    async fn get_node(&self, root_id: &str, node_id: u32)
        -> Result<Option<NodeRecord>, StoreError>;

    async fn list_nodes(&self, root_id: &str) -> Result<Vec<NodeRecord>, StoreError>;

    async fn set_pipeline_state(
        &self,
        root_id: &str,
        state: PipelineState,
    ) -> Result<(), StoreError>;

    async fn get_pipeline_state(&self, root_id: &str) -> Result<Option<PipelineState>, StoreError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    nodes: HashMap<(String, u32), NodeRecord>,
    pipelines: HashMap<String, PipelineState>,
}

/// In-memory store for tests and embedded runs.
#[derive(Default)]
pub struct MemoryPipelineStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn upsert_node(&self, record: NodeRecord) -> Result<(), StoreError> {
        let key = (record.root_id.clone(), record.node_id);
        self.inner.lock().nodes.insert(key, record);
        Ok(())
    }

    async fn get_node(
        &self,
        root_id: &str,
        node_id: u32,
    ) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .nodes
            .get(&(root_id.to_string(), node_id))
            .cloned())
    }

    async fn list_nodes(&self, root_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut records: Vec<NodeRecord> = inner
            .nodes
            .values()
            .filter(|r| r.root_id == root_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.node_id);
        Ok(records)
    }

    async fn set_pipeline_state(
        &self,
        root_id: &str,
        state: PipelineState,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .pipelines
            .insert(root_id.to_string(), state);
        Ok(())
    }

    async fn get_pipeline_state(&self, root_id: &str) -> Result<Option<PipelineState>, StoreError> {
        Ok(self.inner.lock().pipelines.get(root_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_records_keyed_by_root_and_node() {
        let store = MemoryPipelineStore::new();
        let mut record = NodeRecord::new("root-1", 0, "first");
        record.state = NodeState::Succeeded;
        store.upsert_node(record).await.unwrap();
        store
            .upsert_node(NodeRecord::new("root-2", 0, "other"))
            .await
            .unwrap();

        let loaded = store.get_node("root-1", 0).await.unwrap().unwrap();
        assert_eq!(loaded.state, NodeState::Succeeded);
        assert_eq!(store.list_nodes("root-2").await.unwrap().len(), 1);
        assert!(store.get_node("root-3", 0).await.unwrap().is_none());
    }
}
