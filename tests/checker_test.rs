//! Topology invariant checker tests against synthetic cluster snapshots.

use std::sync::Arc;

use dbflow_core::checker::{health_check, MemoryReportSink, TopologyInvariantChecker};
use dbflow_core::testing::fixtures;
use dbflow_core::topology::{
    ClusterEntryRole, ClusterEntryType, ClusterStatus, InstanceInnerRole, InstancePhase,
    MemoryTopologyRepository, StorageRef,
};

#[test]
fn test_healthy_ha_cluster_has_zero_violations() {
    let cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    let violations = health_check(&cluster);
    assert!(
        violations.is_empty(),
        "expected healthy cluster, got {violations:?}"
    );
}

#[test]
fn test_missing_standby_designation_yields_exactly_one_violation() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    for storage in &mut cluster.storages {
        storage.is_stand_by = false;
    }
    let violations = health_check(&cluster);
    assert_eq!(violations.len(), 1, "got {violations:?}");
    assert_eq!(violations[0].rule, "one_standby_slave");
}

#[test]
fn test_offline_standby_yields_exactly_one_standby_status_violation() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    let slave = cluster
        .storages
        .iter_mut()
        .find(|s| s.is_stand_by)
        .unwrap();
    slave.phase = InstancePhase::Offline;
    let slave_port = slave.port;
    let slave_ip = slave.machine.ip.clone();

    // Every other rule is still evaluated independently and passes.
    let violations = health_check(&cluster);
    assert_eq!(violations.len(), 1, "got {violations:?}");
    assert_eq!(violations[0].rule, "standby_slave_status");
    let offending = violations[0].instance.as_ref().unwrap();
    assert_eq!(offending.ip, slave_ip);
    assert_eq!(offending.port, slave_port);
}

#[test]
fn test_cross_cluster_replication_yields_one_replicate_out_violation() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    fixtures::add_cross_cluster_replication(&mut cluster, 2, "other.app.example");

    let violations = health_check(&cluster);
    assert_eq!(violations.len(), 1, "got {violations:?}");
    assert_eq!(violations[0].rule, "replicate_out");
    assert!(violations[0].msg.contains("other.app.example"));
    // Attributed to the queried cluster's own instance holding the edge.
    let offending = violations[0].instance.as_ref().unwrap();
    assert_eq!(offending.ip, "10.1.0.1");
}

#[test]
fn test_instance_in_two_clusters_is_flagged() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    cluster.storages[0].cluster_ids.push(77);

    let violations = health_check(&cluster);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].rule, "instance_unique_cluster");
    assert!(violations[0].msg.contains("77"));
}

#[test]
fn test_master_entry_bound_to_storage_is_flagged() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    let master_addr = cluster.masters()[0].addr();
    cluster.entries[0].bind_storages.push(master_addr);

    let violations = health_check(&cluster);
    assert!(violations
        .iter()
        .any(|v| v.rule == "master_entry_on_storage"));
}

#[test]
fn test_proxy_referencing_slave_is_flagged() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    let slave = cluster
        .storages
        .iter()
        .find(|s| s.inner_role == InstanceInnerRole::Slave)
        .unwrap();
    let slave_ref = StorageRef {
        addr: slave.addr(),
        inner_role: slave.inner_role,
    };
    cluster.proxies[0].storages.push(slave_ref);

    let violations = health_check(&cluster);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].rule, "proxy_access_master");
}

#[test]
fn test_abnormal_cluster_status_is_flagged() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    cluster.status = ClusterStatus::Abnormal;

    let violations = health_check(&cluster);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].rule, "cluster_status");
}

#[test]
fn test_violations_collected_exhaustively() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    // Break several independent invariants at once.
    cluster.status = ClusterStatus::Abnormal;
    cluster.storages[0].cluster_ids.push(9);
    cluster.entries[0].role = ClusterEntryRole::SlaveEntry;
    fixtures::add_cross_cluster_replication(&mut cluster, 3, "third.app.example");

    let violations = health_check(&cluster);
    let rules: Vec<&str> = violations.iter().map(|v| v.rule).collect();
    for expected in [
        "cluster_status",
        "instance_unique_cluster",
        "master_entry_count",
        "replicate_out",
    ] {
        assert!(rules.contains(&expected), "missing {expected} in {rules:?}");
    }
}

#[test]
fn test_dns_real_bind_rule_is_a_stated_noop() {
    let mut cluster = fixtures::healthy_ha_cluster(1, "db.app.example");
    // Even a DNS entry with no bound proxies passes the real-bind rule; the
    // bind-count rule is what catches the inconsistency.
    cluster.entries[0].entry_type = ClusterEntryType::Dns;
    let violations = health_check(&cluster);
    assert!(violations.iter().all(|v| v.rule != "entry_real_bind"));
}

#[tokio::test]
async fn test_checker_persists_report_rows_with_instance_context() {
    let repository = Arc::new(MemoryTopologyRepository::new());
    let mut cluster = fixtures::healthy_ha_cluster(7, "db.app.example");
    let slave = cluster
        .storages
        .iter_mut()
        .find(|s| s.is_stand_by)
        .unwrap();
    slave.phase = InstancePhase::Offline;
    repository.insert_cluster(cluster);

    let sink = Arc::new(MemoryReportSink::new());
    let checker = TopologyInvariantChecker::new(repository, sink.clone());

    let violations = checker.check_cluster(7).await.unwrap();
    assert_eq!(violations.len(), 1);

    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    for report in &reports {
        assert_eq!(report.cluster, "db.app.example");
        assert_eq!(report.cluster_type, "tendbha");
        assert_eq!(report.biz_id, 100);
        assert_eq!(report.ip, "10.7.0.2");
        assert_eq!(report.port, 20000);
    }
}

#[tokio::test]
async fn test_sweep_covers_every_ha_cluster() {
    let repository = Arc::new(MemoryTopologyRepository::new());
    repository.insert_cluster(fixtures::healthy_ha_cluster(1, "one.app.example"));
    let mut broken = fixtures::healthy_ha_cluster(2, "two.app.example");
    broken.status = ClusterStatus::Abnormal;
    repository.insert_cluster(broken);
    // Non-HA clusters are outside the sweep.
    repository.insert_cluster(fixtures::mongo_cluster(3, "mg.app.example", true, 2));

    let sink = Arc::new(MemoryReportSink::new());
    let checker = TopologyInvariantChecker::new(repository, sink.clone());
    let total = checker.run_sweep().await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(sink.reports().len(), 1);
    assert_eq!(sink.reports()[0].cluster, "two.app.example");
}
