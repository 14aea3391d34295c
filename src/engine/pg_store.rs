//! Postgres-backed pipeline store.
//!
//! Production deployments persist node rows here so pipeline runs survive
//! process restarts; the schema is bootstrapped on first use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use super::states::{NodeState, PipelineState};
use super::store::{NodeRecord, PipelineStore, StoreError};

pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flow_pipeline (
                root_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flow_pipeline_node (
                root_id TEXT NOT NULL,
                node_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                kwargs JSONB NOT NULL,
                outputs JSONB NOT NULL,
                trans_writes JSONB NOT NULL,
                branch_code INTEGER,
                error TEXT,
                retried_by TEXT,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (root_id, node_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<NodeRecord, StoreError> {
        let state: String = row.try_get("state").map_err(backend)?;
        let state: NodeState = state
            .parse()
            .map_err(|e: String| StoreError::Backend { message: e })?;
        let trans_writes: Value = row.try_get("trans_writes").map_err(backend)?;
        let node_id: i32 = row.try_get("node_id").map_err(backend)?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(backend)?;

        Ok(NodeRecord {
            root_id: row.try_get("root_id").map_err(backend)?,
            node_id: node_id as u32,
            name: row.try_get("name").map_err(backend)?,
            state,
            kwargs: row.try_get("kwargs").map_err(backend)?,
            outputs: row.try_get("outputs").map_err(backend)?,
            trans_writes: serde_json::from_value(trans_writes)?,
            branch_code: row.try_get("branch_code").map_err(backend)?,
            error: row.try_get("error").map_err(backend)?,
            retried_by: row.try_get("retried_by").map_err(backend)?,
            updated_at,
        })
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend {
        message: err.to_string(),
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn upsert_node(&self, record: NodeRecord) -> Result<(), StoreError> {
        let trans_writes = serde_json::to_value(&record.trans_writes)?;
        sqlx::query(
            "INSERT INTO flow_pipeline_node
                (root_id, node_id, name, state, kwargs, outputs, trans_writes,
                 branch_code, error, retried_by, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (root_id, node_id) DO UPDATE SET
                state = EXCLUDED.state,
                kwargs = EXCLUDED.kwargs,
                outputs = EXCLUDED.outputs,
                trans_writes = EXCLUDED.trans_writes,
                branch_code = EXCLUDED.branch_code,
                error = EXCLUDED.error,
                retried_by = EXCLUDED.retried_by,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&record.root_id)
        .bind(record.node_id as i32)
        .bind(&record.name)
        .bind(record.state.to_string())
        .bind(&record.kwargs)
        .bind(&record.outputs)
        .bind(trans_writes)
        .bind(record.branch_code)
        .bind(&record.error)
        .bind(&record.retried_by)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_node(
        &self,
        root_id: &str,
        node_id: u32,
    ) -> Result<Option<NodeRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT root_id, node_id, name, state, kwargs, outputs, trans_writes,
                    branch_code, error, retried_by, updated_at
             FROM flow_pipeline_node WHERE root_id = $1 AND node_id = $2",
        )
        .bind(root_id)
        .bind(node_id as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn list_nodes(&self, root_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT root_id, node_id, name, state, kwargs, outputs, trans_writes,
                    branch_code, error, retried_by, updated_at
             FROM flow_pipeline_node WHERE root_id = $1 ORDER BY node_id",
        )
        .bind(root_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn set_pipeline_state(
        &self,
        root_id: &str,
        state: PipelineState,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO flow_pipeline (root_id, state, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (root_id) DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = now()",
        )
        .bind(root_id)
        .bind(state.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_pipeline_state(&self, root_id: &str) -> Result<Option<PipelineState>, StoreError> {
        let row = sqlx::query("SELECT state FROM flow_pipeline WHERE root_id = $1")
            .bind(root_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(|r| {
            let state: String = r.try_get("state").map_err(backend)?;
            state
                .parse()
                .map_err(|e: String| StoreError::Backend { message: e })
        })
        .transpose()
    }
}
