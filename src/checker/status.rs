//! Status rules: cluster health, entry and proxy counts, master and
//! standby-slave cardinality and health.

use super::report::CheckResponse;
use crate::topology::{
    ClusterEntryRole, ClusterSnapshot, ClusterStatus, InstanceInnerRole,
};

pub(super) const RULE_CLUSTER_STATUS: &str = "cluster_status";
pub(super) const RULE_MASTER_ENTRY_COUNT: &str = "master_entry_count";
pub(super) const RULE_PROXY_COUNT: &str = "proxy_count";
pub(super) const RULE_ONE_MASTER: &str = "one_master";
pub(super) const RULE_MASTER_STATUS: &str = "master_status";
pub(super) const RULE_ONE_STANDBY_SLAVE: &str = "one_standby_slave";
pub(super) const RULE_STANDBY_SLAVE_STATUS: &str = "standby_slave_status";

pub(super) fn cluster_status(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    if c.status != ClusterStatus::Normal {
        return vec![CheckResponse::new(
            RULE_CLUSTER_STATUS,
            format!("cluster status abnormal: {}", c.status),
        )];
    }
    Vec::new()
}

/// At least one master access entry.
pub(super) fn master_entry_count(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let count = c
        .entries
        .iter()
        .filter(|e| e.role == ClusterEntryRole::MasterEntry)
        .count();
    if count == 0 {
        return vec![CheckResponse::new(
            RULE_MASTER_ENTRY_COUNT,
            "no master access entry",
        )];
    }
    Vec::new()
}

/// At least two healthy proxies.
pub(super) fn proxy_count(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    if c.healthy_proxy_count() < 2 {
        return vec![CheckResponse::new(
            RULE_PROXY_COUNT,
            "fewer than 2 healthy proxies",
        )];
    }
    Vec::new()
}

/// Exactly one master.
pub(super) fn one_master(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let masters = c.masters();
    if masters.is_empty() {
        return vec![CheckResponse::new(RULE_ONE_MASTER, "no master instance")];
    }
    if masters.len() > 1 {
        let addrs: Vec<String> = masters.iter().map(|m| m.ip_port()).collect();
        return vec![CheckResponse::new(
            RULE_ONE_MASTER,
            format!("more than 1 master: {}", addrs.join(",")),
        )];
    }
    Vec::new()
}

/// The master must be running and online.
pub(super) fn master_status(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let healthy = c
        .storages
        .iter()
        .filter(|s| s.inner_role == InstanceInnerRole::Master && s.is_healthy())
        .count();
    if healthy == 0 {
        return vec![CheckResponse::new(RULE_MASTER_STATUS, "no healthy master")];
    }
    Vec::new()
}

/// Exactly one designated standby slave.
pub(super) fn one_standby_slave(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let standbys = c.standby_slaves();
    if standbys.is_empty() {
        return vec![CheckResponse::new(
            RULE_ONE_STANDBY_SLAVE,
            "no standby slave",
        )];
    }
    if standbys.len() > 1 {
        let addrs: Vec<String> = standbys.iter().map(|s| s.ip_port()).collect();
        return vec![CheckResponse::new(
            RULE_ONE_STANDBY_SLAVE,
            format!("more than 1 standby slave: {}", addrs.join(",")),
        )];
    }
    Vec::new()
}

/// The standby slave must be running and online.
pub(super) fn standby_slave_status(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    for si in &c.storages {
        if si.inner_role == InstanceInnerRole::Slave && si.is_stand_by && !si.is_healthy() {
            bad.push(
                CheckResponse::new(
                    RULE_STANDBY_SLAVE_STATUS,
                    format!(
                        "standby slave {} status abnormal: {}, {}",
                        si.ip_port(),
                        si.status,
                        si.phase
                    ),
                )
                .with_instance(si.machine.ip.clone(), si.port, si.machine.machine_type),
            );
        }
    }
    bad
}
