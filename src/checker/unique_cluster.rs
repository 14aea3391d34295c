//! An instance belongs to at most one cluster.

use super::report::CheckResponse;
use crate::topology::ClusterSnapshot;

pub(super) const RULE_UNIQUE_CLUSTER: &str = "instance_unique_cluster";

pub(super) fn instance_unique_cluster(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    for si in &c.storages {
        for other in si.cluster_ids.iter().filter(|id| **id != c.id) {
            bad.push(
                CheckResponse::new(
                    RULE_UNIQUE_CLUSTER,
                    format!(
                        "instance {} also belongs to cluster {other}",
                        si.ip_port()
                    ),
                )
                .with_instance(si.machine.ip.clone(), si.port, si.machine.machine_type),
            );
        }
    }
    for pi in &c.proxies {
        for other in pi.cluster_ids.iter().filter(|id| **id != c.id) {
            bad.push(
                CheckResponse::new(
                    RULE_UNIQUE_CLUSTER,
                    format!(
                        "instance {} also belongs to cluster {other}",
                        pi.ip_port()
                    ),
                )
                .with_instance(pi.machine.ip.clone(), pi.port, pi.machine.machine_type),
            );
        }
    }
    bad
}
