//! Privilege authorization flow: apply account rules per target cluster.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::FlowController;
use crate::error::{FlowError, Result};
use crate::pipeline::{ActivitySpec, Pipeline, PipelineBuilder};
use crate::registry::{Services, StepCode};
use crate::ticket::Ticket;

#[derive(Debug, Deserialize)]
struct AuthorizeInfo {
    cluster_id: i64,
    rules: Vec<Value>,
}

pub struct AuthorizeRulesFlow;

#[async_trait]
impl FlowController for AuthorizeRulesFlow {
    async fn build(
        &self,
        ticket: &Ticket,
        services: &Services,
        root_id: &str,
    ) -> Result<Pipeline> {
        let infos: Vec<AuthorizeInfo> = serde_json::from_value(ticket.infos.clone())
            .map_err(|e| FlowError::Precondition(format!("authorize payload: {e}")))?;
        if infos.is_empty() {
            return Err(FlowError::Precondition("no authorization rules".to_string()));
        }

        let mut acts = Vec::with_capacity(infos.len());
        for info in &infos {
            let cluster = services.repository.get_cluster(info.cluster_id).await?;
            if cluster.masters().is_empty() {
                return Err(FlowError::Precondition(format!(
                    "cluster {} has no master to authorize against",
                    cluster.immute_domain
                )));
            }
            acts.push(ActivitySpec::new(
                format!("authorize rules on {}", cluster.immute_domain),
                StepCode::AuthorizeRules,
                json!({ "cluster_id": info.cluster_id, "rules": info.rules }),
            ));
        }

        let data = json!({
            "uid": ticket.uid,
            "created_by": ticket.created_by,
            "biz_id": ticket.biz_id,
            "ticket_type": ticket.ticket_type,
        });
        let mut builder = PipelineBuilder::new(root_id, data);
        builder
            .add_parallel_acts(acts)
            .map_err(|e| FlowError::Build(e.to_string()))?;
        builder.build().map_err(|e| FlowError::Build(e.to_string()))
    }
}
