//! Transfer-cluster flow: move clusters (metadata, privilege rules, access
//! entries) to another business, with a manual confirmation gate between the
//! metadata move and the DNS ownership change.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;

use super::FlowController;
use crate::error::{FlowError, Result};
use crate::pipeline::{ActivitySpec, Pipeline, PipelineBuilder};
use crate::registry::{Services, StepCode};
use crate::ticket::Ticket;
use crate::topology::{ClusterEntryType, ClusterSnapshot};

/// Address of the privilege-manager control endpoint.
const PRIV_API_ADDRESS: &str = "priv-api";
/// Address of the DNS control endpoint.
const DNS_API_ADDRESS: &str = "dns-api";

#[derive(Debug, Deserialize)]
struct TransferInfo {
    cluster_domain_list: Vec<String>,
    target_biz_id: i64,
    #[serde(default)]
    need_clone_priv_rules: bool,
}

pub struct TransferClusterFlow;

impl TransferClusterFlow {
    /// Clusters sharing machines with the transfer set but not part of it.
    /// Transfer is refused until those relations are untangled.
    async fn find_other_relation_domains(
        services: &Services,
        clusters: &[ClusterSnapshot],
    ) -> Result<Vec<String>> {
        let transfer_ids: BTreeSet<i64> = clusters.iter().map(|c| c.id).collect();
        let mut related_ids: BTreeSet<i64> = BTreeSet::new();
        for cluster in clusters {
            for ip in cluster.all_ips() {
                let view = services.repository.machine_view(&ip).await?;
                for (cluster_id, _) in view.storages.iter().chain(view.proxies.iter()) {
                    related_ids.insert(*cluster_id);
                }
            }
        }

        let mut domains = Vec::new();
        for related_id in related_ids.difference(&transfer_ids) {
            let cluster = services.repository.get_cluster(*related_id).await?;
            domains.push(cluster.immute_domain);
        }
        Ok(domains)
    }
}

#[async_trait]
impl FlowController for TransferClusterFlow {
    async fn build(
        &self,
        ticket: &Ticket,
        services: &Services,
        root_id: &str,
    ) -> Result<Pipeline> {
        let info: TransferInfo = serde_json::from_value(ticket.infos.clone())
            .map_err(|e| FlowError::Precondition(format!("transfer payload: {e}")))?;
        if info.cluster_domain_list.is_empty() {
            return Err(FlowError::Precondition("no clusters to transfer".to_string()));
        }

        let mut clusters = Vec::with_capacity(info.cluster_domain_list.len());
        for domain in &info.cluster_domain_list {
            clusters.push(services.repository.get_cluster_by_domain(domain).await?);
        }

        let other_domains = Self::find_other_relation_domains(services, &clusters).await?;
        if !other_domains.is_empty() {
            return Err(FlowError::Precondition(format!(
                "domains share machines with the transfer set, untangle first: {}",
                other_domains.join(", ")
            )));
        }

        let cloud_ids: BTreeSet<i64> = clusters.iter().map(|c| c.cloud_id).collect();
        if cloud_ids.len() != 1 {
            return Err(FlowError::Precondition(
                "clusters to transfer must share one cloud region".to_string(),
            ));
        }
        let source_biz_ids: BTreeSet<i64> = clusters.iter().map(|c| c.biz_id).collect();
        if source_biz_ids.len() != 1 {
            return Err(FlowError::Precondition(
                "clusters to transfer must belong to one business".to_string(),
            ));
        }
        let cloud_id = *cloud_ids.iter().next().unwrap_or(&0);
        let source_biz_id = *source_biz_ids.iter().next().unwrap_or(&0);

        // DNS ownership moves for master entries and DNS slave entries.
        let mut domains = info.cluster_domain_list.clone();
        for cluster in &clusters {
            for entry in cluster.slave_entries() {
                if entry.entry_type == ClusterEntryType::Dns {
                    domains.push(entry.entry.clone());
                }
            }
        }
        let cluster_ids: Vec<i64> = clusters.iter().map(|c| c.id).collect();

        let data = json!({
            "uid": ticket.uid,
            "created_by": ticket.created_by,
            "biz_id": ticket.biz_id,
            "ticket_type": ticket.ticket_type,
        });
        let mut builder = PipelineBuilder::new(root_id, data);

        if info.need_clone_priv_rules {
            builder.add_activity(ActivitySpec::new(
                "clone privilege rules",
                StepCode::ClonePrivRules,
                json!({
                    "source_biz_id": source_biz_id,
                    "target_biz_id": info.target_biz_id,
                    "address": PRIV_API_ADDRESS,
                    "cloud_id": cloud_id,
                }),
            ));
        }

        builder.add_activity(ActivitySpec::new(
            "transfer cluster metadata",
            StepCode::TransferClusterMeta,
            json!({
                "cluster_ids": cluster_ids,
                "target_biz_id": info.target_biz_id,
            }),
        ));

        builder.add_pause("run cluster standardization, confirm when finished");

        builder.add_activity(ActivitySpec::new(
            "repoint dns record ownership",
            StepCode::UpdateDnsOwnership,
            json!({
                "domains": domains,
                "source_biz_id": source_biz_id,
                "target_biz_id": info.target_biz_id,
                "address": DNS_API_ADDRESS,
                "cloud_id": cloud_id,
            }),
        ));

        builder.build().map_err(|e| FlowError::Build(e.to_string()))
    }
}
