//! Access-entry binding rules.

use super::report::CheckResponse;
use crate::topology::{ClusterEntryRole, ClusterEntryType, ClusterSnapshot};

pub(super) const RULE_MASTER_ENTRY_ON_PROXY: &str = "master_entry_on_proxy";
pub(super) const RULE_MASTER_ENTRY_ON_STORAGE: &str = "master_entry_on_storage";
pub(super) const RULE_ENTRY_REAL_BIND: &str = "entry_real_bind";

/// A master entry must bind exactly the cluster's healthy proxies.
pub(super) fn master_entry_on_proxy(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    let healthy_proxies = c.healthy_proxy_count();
    for entry in &c.entries {
        if entry.role == ClusterEntryRole::MasterEntry
            && entry.bind_proxies.len() != healthy_proxies
        {
            bad.push(CheckResponse::new(
                RULE_MASTER_ENTRY_ON_PROXY,
                format!(
                    "master entry {} binds {} proxies, cluster has {healthy_proxies} healthy",
                    entry.entry,
                    entry.bind_proxies.len()
                ),
            ));
        }
    }
    bad
}

/// A master entry must never bind raw storage.
pub(super) fn master_entry_on_storage(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    for entry in &c.entries {
        if entry.role == ClusterEntryRole::MasterEntry {
            for addr in &entry.bind_storages {
                let mut response = CheckResponse::new(
                    RULE_MASTER_ENTRY_ON_STORAGE,
                    format!("master entry {} bound to storage instance", entry.entry),
                );
                if let Some(si) = c
                    .storages
                    .iter()
                    .find(|s| s.machine.ip == addr.ip && s.port == addr.port)
                {
                    response = response.with_instance(
                        si.machine.ip.clone(),
                        si.port,
                        si.machine.machine_type,
                    );
                }
                bad.push(response);
            }
        }
    }
    bad
}

/// Consistency of the entry's real bind configuration with metadata.
///
/// The live-DNS comparison is not implemented; DNS entries currently pass
/// unconditionally.
pub(super) fn entry_real_bind(c: &ClusterSnapshot) -> Vec<CheckResponse> {
    let mut bad = Vec::new();
    for entry in &c.entries {
        if entry.entry_type == ClusterEntryType::Dns && !dns_entry_real_bind(c) {
            bad.push(CheckResponse::new(
                RULE_ENTRY_REAL_BIND,
                format!("entry {} real bind differs from metadata", entry.entry),
            ));
        }
    }
    bad
}

fn dns_entry_real_bind(_c: &ClusterSnapshot) -> bool {
    true
}
