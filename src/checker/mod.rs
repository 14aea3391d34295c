//! # Topology Invariant Checker
//!
//! Read-only auditor over cluster snapshots. Evaluates a fixed rule set and
//! produces structured violation reports; no remediation is attempted here —
//! automatic repair, where it exists, is a flow of its own.

mod access_relate;
mod entry_bind;
mod replicate;
pub mod report;
mod status;
mod unique_cluster;

use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::topology::{ClusterFilter, ClusterSnapshot, ClusterType, TopologyRepository};

pub use report::{CheckResponse, MemoryReportSink, MetaCheckReport, OffendingInstance, ReportSink};

/// Evaluate every rule against one HA-cluster snapshot.
///
/// All checks are independent of each other: a violation found by one rule
/// never short-circuits the rest, so a single pass reports everything wrong
/// with the cluster at once.
pub fn health_check(cluster: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut res = Vec::new();
    res.extend(unique_cluster::instance_unique_cluster(cluster));
    res.extend(status::cluster_status(cluster));
    res.extend(status::master_entry_count(cluster));
    res.extend(status::proxy_count(cluster));
    res.extend(status::one_master(cluster));
    res.extend(status::master_status(cluster));
    res.extend(status::one_standby_slave(cluster));
    res.extend(status::standby_slave_status(cluster));
    res.extend(entry_bind::master_entry_on_proxy(cluster));
    res.extend(entry_bind::master_entry_on_storage(cluster));
    res.extend(entry_bind::entry_real_bind(cluster));
    res.extend(access_relate::proxy_access_master(cluster));
    res.extend(replicate::master_as_ejector(cluster));
    res.extend(replicate::slave_as_receiver(cluster));
    res.extend(replicate::replicate_out(cluster));
    res
}

/// Scheduled auditor: reads snapshots through the repository and persists
/// flattened report rows through a sink.
pub struct TopologyInvariantChecker {
    repository: Arc<dyn TopologyRepository>,
    sink: Arc<dyn ReportSink>,
}

impl TopologyInvariantChecker {
    pub fn new(repository: Arc<dyn TopologyRepository>, sink: Arc<dyn ReportSink>) -> Self {
        Self { repository, sink }
    }

    /// Check one cluster and persist its violations. Returns the violations
    /// for the caller's convenience.
    pub async fn check_cluster(&self, cluster_id: i64) -> Result<Vec<CheckResponse>> {
        let cluster = self.repository.get_cluster(cluster_id).await?;
        let responses = health_check(&cluster);
        info!(
            cluster = %cluster.immute_domain,
            violations = responses.len(),
            "topology check finished"
        );
        if !responses.is_empty() {
            let reports = responses
                .iter()
                .map(|r| MetaCheckReport::from_response(&cluster, r))
                .collect();
            self.sink.persist(reports).await;
        }
        Ok(responses)
    }

    /// Sweep every HA cluster, persisting violations per cluster. One
    /// cluster's violations never stop the sweep.
    pub async fn run_sweep(&self) -> Result<usize> {
        let clusters = self
            .repository
            .list_clusters(&ClusterFilter {
                cluster_type: Some(ClusterType::TendbHa),
                ..ClusterFilter::default()
            })
            .await?;
        let mut total = 0;
        for cluster in &clusters {
            total += self.check_cluster(cluster.id).await?.len();
        }
        info!(clusters = clusters.len(), violations = total, "topology sweep finished");
        Ok(total)
    }
}
