//! Proxy access rules.

use super::report::CheckResponse;
use crate::topology::{ClusterSnapshot, InstanceInnerRole};

pub(super) const RULE_PROXY_ACCESS_MASTER: &str = "proxy_access_master";

/// A proxy may reference master instances only.
pub(super) fn proxy_access_master(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    for pi in &c.proxies {
        for backend in &pi.storages {
            if backend.inner_role != InstanceInnerRole::Master {
                bad.push(
                    CheckResponse::new(
                        RULE_PROXY_ACCESS_MASTER,
                        format!(
                            "proxy references {}: {}",
                            backend.inner_role, backend.addr
                        ),
                    )
                    .with_instance(pi.machine.ip.clone(), pi.port, pi.machine.machine_type),
                );
            }
        }
    }
    bad
}
