//! Violation reports produced by the invariant checker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::topology::{ClusterSnapshot, MachineType};

/// The instance a violation points at, when one is identifiable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffendingInstance {
    pub ip: String,
    pub port: u16,
    pub machine_type: MachineType,
}

/// One rule violation, as produced by a rule function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    /// Stable identifier of the violated rule
    pub rule: &'static str,
    pub msg: String,
    pub instance: Option<OffendingInstance>,
}

impl CheckResponse {
    pub fn new(rule: &'static str, msg: impl Into<String>) -> Self {
        Self {
            rule,
            msg: msg.into(),
            instance: None,
        }
    }

    pub fn with_instance(
        mut self,
        ip: impl Into<String>,
        port: u16,
        machine_type: MachineType,
    ) -> Self {
        self.instance = Some(OffendingInstance {
            ip: ip.into(),
            port,
            machine_type,
        });
        self
    }
}

/// A violation flattened into a persistable report row with full cluster
/// context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaCheckReport {
    pub rule: String,
    pub msg: String,
    pub biz_id: i64,
    pub cloud_id: i64,
    pub cluster: String,
    pub cluster_type: String,
    pub ip: String,
    pub port: u16,
    pub machine_type: Option<MachineType>,
    pub created_at: DateTime<Utc>,
}

impl MetaCheckReport {
    pub fn from_response(cluster: &ClusterSnapshot, response: &CheckResponse) -> Self {
        let mut report = Self {
            rule: response.rule.to_string(),
            msg: response.msg.clone(),
            biz_id: cluster.biz_id,
            cloud_id: cluster.cloud_id,
            cluster: cluster.immute_domain.clone(),
            cluster_type: cluster.cluster_type.to_string(),
            ip: "0.0.0.0".to_string(),
            port: 0,
            machine_type: None,
            created_at: Utc::now(),
        };
        if let Some(instance) = &response.instance {
            report.ip = instance.ip.clone();
            report.port = instance.port;
            report.machine_type = Some(instance.machine_type);
        }
        report
    }
}

/// Destination for persisted report rows.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn persist(&self, reports: Vec<MetaCheckReport>);
}

/// In-memory sink for tests and embedded use.
#[derive(Default)]
pub struct MemoryReportSink {
    reports: Mutex<Vec<MetaCheckReport>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<MetaCheckReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn persist(&self, reports: Vec<MetaCheckReport>) {
        self.reports.lock().extend(reports);
    }
}
