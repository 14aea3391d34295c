//! Replication-edge rules.

use super::report::CheckResponse;
use crate::topology::{ClusterSnapshot, InstanceInnerRole};

pub(super) const RULE_MASTER_AS_EJECTOR: &str = "master_as_ejector";
pub(super) const RULE_SLAVE_AS_RECEIVER: &str = "slave_as_receiver";
pub(super) const RULE_REPLICATE_OUT: &str = "replicate_out";

/// A master may appear only as replication ejector.
pub(super) fn master_as_ejector(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    for si in &c.storages {
        if si.inner_role == InstanceInnerRole::Master {
            for edge in &si.as_receiver {
                bad.push(
                    CheckResponse::new(
                        RULE_MASTER_AS_EJECTOR,
                        format!("master is receiver of replication from {}", edge.addr),
                    )
                    .with_instance(si.machine.ip.clone(), si.port, si.machine.machine_type),
                );
            }
        }
    }
    bad
}

/// A slave may appear only as replication receiver.
pub(super) fn slave_as_receiver(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    for si in &c.storages {
        if si.inner_role == InstanceInnerRole::Slave {
            for edge in &si.as_ejector {
                bad.push(
                    CheckResponse::new(
                        RULE_SLAVE_AS_RECEIVER,
                        format!("slave is ejector of replication to {}", edge.addr),
                    )
                    .with_instance(si.machine.ip.clone(), si.port, si.machine.machine_type),
                );
            }
        }
    }
    bad
}

/// No replication edge may cross the cluster boundary, in either direction.
pub(super) fn replicate_out(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    for si in &c.storages {
        for edge in si.as_ejector.iter().chain(si.as_receiver.iter()) {
            if edge.cluster_id != c.id {
                bad.push(
                    CheckResponse::new(
                        RULE_REPLICATE_OUT,
                        format!(
                            "replication with external cluster {} {}",
                            edge.cluster_domain, edge.addr
                        ),
                    )
                    .with_instance(si.machine.ip.clone(), si.port, si.machine.machine_type),
                );
            }
        }
    }
    bad
}
