//! Flow controller integration tests, driven end-to-end through the engine
//! against in-memory topology and a recording gateway.

use serde_json::json;

use dbflow_core::engine::{NodeState, PipelineStore, RunOutcome};
use dbflow_core::error::FlowError;
use dbflow_core::flows::{self, controller_for};
use dbflow_core::gateway::CommandKind;
use dbflow_core::testing::{fixtures, TestHarness};
use dbflow_core::ticket::{Ticket, TicketStatus, TicketType, TodoAction, TodoStatus, TodoType};
use dbflow_core::topology::{
    InstanceInnerRole, InstanceStatus, MutationBatch, MutationOp, TopologyRepository,
};

fn ticket(ticket_type: TicketType, infos: serde_json::Value) -> Ticket {
    Ticket::new("2024060112120001", "admin", 100, ticket_type, infos)
}

/// A cluster whose master machine also carries a second storage instance and
/// one proxy, for machine-scoped assertions.
fn dense_machine_cluster(id: i64) -> dbflow_core::topology::ClusterSnapshot {
    let mut cluster = fixtures::healthy_ha_cluster(id, "dense.app.example");
    let shared_ip = cluster.storages[0].machine.ip.clone();
    let mut extra = fixtures::storage(&shared_ip, 20001, InstanceInnerRole::Slave, false);
    extra.cluster_ids = vec![id];
    cluster.storages.push(extra);
    cluster.proxies[0].machine.ip = shared_ip;
    cluster
}

#[tokio::test]
async fn test_clear_machine_deletes_metadata_then_wipes_once() {
    let harness = TestHarness::new();
    let cluster = dense_machine_cluster(1);
    let machine_ip = cluster.storages[0].machine.ip.clone();
    harness.repository.insert_cluster(cluster);

    let view = harness.repository.machine_view(&machine_ip).await.unwrap();
    assert_eq!(view.instance_count(), 3);

    let mut ticket = ticket(
        TicketType::ClearMachine,
        json!({
            "db_type": "mysql",
            "clear_hosts": [{ "ip": machine_ip, "cloud_id": 0 }],
        }),
    );
    let run = flows::run_ticket(&harness.engine, &mut ticket).await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);
    assert_eq!(ticket.status, TicketStatus::Succeeded);

    // Metadata bindings are gone.
    assert!(harness.repository.machine_view(&machine_ip).await.is_err());

    // Exactly one destructive script, after the metadata step.
    let scripts: Vec<_> = harness
        .gateway
        .executed()
        .into_iter()
        .filter(|c| matches!(c.kind, CommandKind::Script { .. }))
        .collect();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].addresses, vec![machine_ip]);
    assert!(scripts[0].commands[0].contains("mysqld"));
}

#[tokio::test]
async fn test_clear_machine_skips_wipe_when_metadata_step_fails() {
    let harness = TestHarness::new();
    let cluster = dense_machine_cluster(1);
    let machine_ip = cluster.storages[0].machine.ip.clone();
    harness.repository.insert_cluster(cluster);

    let ticket = ticket(
        TicketType::ClearMachine,
        json!({
            "db_type": "mysql",
            "clear_hosts": [{ "ip": machine_ip, "cloud_id": 0 }],
        }),
    );
    let pipeline = controller_for(TicketType::ClearMachine)
        .build(&ticket, harness.engine.services(), "clear-root")
        .await
        .unwrap();

    // The machine disappears between planning and execution, failing the
    // metadata step at run time.
    harness
        .repository
        .mutate(MutationBatch::single(MutationOp::ClearMachine {
            ip: machine_ip.clone(),
        }))
        .await
        .unwrap();

    let outcome = harness.engine.run(&pipeline, &ticket).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    // The destructive script never ran.
    assert!(harness.gateway.executed().is_empty());
}

#[tokio::test]
async fn test_clear_machine_unknown_host_fails_before_building() {
    let harness = TestHarness::new();
    let mut ticket = ticket(
        TicketType::ClearMachine,
        json!({
            "db_type": "mysql",
            "clear_hosts": [{ "ip": "192.0.2.1", "cloud_id": 0 }],
        }),
    );
    let err = flows::run_ticket(&harness.engine, &mut ticket)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Topology(_)));
    // No pipeline state was created.
    assert!(harness.store.list_nodes("").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_table_backup_merges_duplicate_clusters_and_links_artifacts() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::healthy_ha_cluster(1, "one.app.example"));
    harness
        .repository
        .insert_cluster(fixtures::healthy_ha_cluster(2, "two.app.example"));
    harness
        .gateway
        .stub_rows("show databases", vec![json!({"Database": "db1_app"})]);

    let mut ticket = ticket(
        TicketType::DbTableBackup,
        json!([
            {
                "cluster_id": 1,
                "db_patterns": ["db1%"], "ignore_dbs": [],
                "table_patterns": ["*"], "ignore_tables": [],
            },
            {
                "cluster_id": 2,
                "db_patterns": ["db1%"], "ignore_dbs": [],
                "table_patterns": ["*"], "ignore_tables": [],
            },
            {
                "cluster_id": 1,
                "db_patterns": ["db1_app"], "ignore_dbs": [],
                "table_patterns": ["tb_role%"], "ignore_tables": [],
            },
        ]),
    );
    let run = flows::run_ticket(&harness.engine, &mut ticket).await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);

    // Media is pushed once per cluster, not once per job.
    assert_eq!(harness.gateway.executed_matching("transfer_media").len(), 2);
    // Every job executed its backup with a distinct artifact id.
    let backups = harness.gateway.executed_matching("backup-demand");
    assert_eq!(backups.len(), 3);
    let mut ids: Vec<String> = backups
        .iter()
        .map(|c| {
            let cmd = &c.commands[0];
            let start = cmd.find("--backup-id ").unwrap() + "--backup-id ".len();
            cmd[start..].split_whitespace().next().unwrap().to_string()
        })
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    // The ticket admin account is provisioned first and dropped last.
    let all = harness.gateway.executed();
    assert!(all
        .first()
        .unwrap()
        .commands
        .iter()
        .any(|c| c.contains("CREATE USER IF NOT EXISTS")));
    assert!(all
        .last()
        .unwrap()
        .commands
        .iter()
        .any(|c| c.contains("drop user if exists")));
}

#[tokio::test]
async fn test_table_backup_requires_running_standby_slave() {
    let harness = TestHarness::new();
    let mut cluster = fixtures::healthy_ha_cluster(1, "one.app.example");
    cluster
        .storages
        .iter_mut()
        .find(|s| s.is_stand_by)
        .unwrap()
        .status = InstanceStatus::Unavailable;
    harness.repository.insert_cluster(cluster);

    let mut ticket = ticket(
        TicketType::DbTableBackup,
        json!([{
            "cluster_id": 1,
            "db_patterns": ["db%"], "ignore_dbs": [],
            "table_patterns": ["*"], "ignore_tables": [],
        }]),
    );
    let err = flows::run_ticket(&harness.engine, &mut ticket)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Precondition(_)));
    assert!(harness.gateway.executed().is_empty());
}

#[tokio::test]
async fn test_backup_filter_validation_failure_parks_flow_with_todo() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::healthy_ha_cluster(1, "one.app.example"));
    // Live schema has nothing the filter matches.
    harness
        .gateway
        .stub_rows("show databases", vec![json!({"Database": "unrelated"})]);

    let mut ticket = ticket(
        TicketType::DbTableBackup,
        json!([{
            "cluster_id": 1,
            "db_patterns": ["db1%"], "ignore_dbs": [],
            "table_patterns": ["*"], "ignore_tables": [],
        }]),
    );
    let run = flows::run_ticket(&harness.engine, &mut ticket).await.unwrap();
    assert!(matches!(run.outcome, RunOutcome::Failed { .. }));
    assert_eq!(ticket.status, TicketStatus::Failed);
    // No backup command was issued for the failed job.
    assert!(harness.gateway.executed_matching("backup-demand").is_empty());

    // A recovery todo was created for the operator.
    let todos = harness.todos.unfinished_for_flow(&run.flow.root_id);
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].todo_type, TodoType::InnerFailed);
}

#[tokio::test]
async fn test_pitr_restore_orders_config_rebuild_before_shards_before_mongos() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::mongo_cluster(1, "src.mg.example", true, 2));
    harness
        .repository
        .insert_cluster(fixtures::mongo_cluster(2, "dst.mg.example", true, 2));
    harness.gateway.stub_rows(
        "bkstore list-backups",
        vec![json!({"file_name": "FULL-20240601.tar"})],
    );

    let mut ticket = ticket(
        TicketType::MongoPitrRestore,
        json!([{
            "src_cluster_id": 1,
            "dst_cluster_id": 2,
            "dst_time": "2024-06-01 12:00:00",
            "apply_oplog": true,
        }]),
    );
    let run = flows::run_ticket(&harness.engine, &mut ticket).await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);

    let all = harness.gateway.executed();
    let position = |needle: &str| -> Vec<usize> {
        all.iter()
            .enumerate()
            .filter(|(_, c)| c.commands.iter().any(|cmd| cmd.contains(needle)))
            .map(|(i, _)| i)
            .collect()
    };

    let config_rebuilds = position("pitr-rebuild")
        .into_iter()
        .filter(|i| all[*i].commands[0].contains("configsvr"))
        .collect::<Vec<_>>();
    let shard_rebuilds = position("pitr-rebuild")
        .into_iter()
        .filter(|i| all[*i].commands[0].contains("shardsvr"))
        .collect::<Vec<_>>();
    let mongos_starts = position("start_mongos");
    let mongos_stops = position("stop_mongos");
    let restores = position("pitr-restore");

    assert_eq!(config_rebuilds.len(), 1);
    assert_eq!(shard_rebuilds.len(), 2);
    assert_eq!(mongos_starts.len(), 2);
    assert_eq!(mongos_stops.len(), 2);
    // Three restores: two data shards plus the config set.
    assert_eq!(restores.len(), 3);

    // Routers stop before any restore begins.
    assert!(mongos_stops.iter().max().unwrap() < restores.iter().min().unwrap());
    // Config-server rebuild strictly precedes every data-shard rebuild.
    assert!(config_rebuilds[0] < *shard_rebuilds.iter().min().unwrap());
    // Every rebuild strictly precedes every mongos restart.
    assert!(shard_rebuilds.iter().max().unwrap() < mongos_starts.iter().min().unwrap());
}

#[tokio::test]
async fn test_pitr_restore_rejects_mismatched_topology() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::mongo_cluster(1, "src.mg.example", false, 1));
    harness
        .repository
        .insert_cluster(fixtures::mongo_cluster(2, "dst.mg.example", true, 2));

    let mut ticket = ticket(
        TicketType::MongoPitrRestore,
        json!([{
            "src_cluster_id": 1,
            "dst_cluster_id": 2,
            "dst_time": "2024-06-01 12:00:00",
            "apply_oplog": false,
        }]),
    );
    let err = flows::run_ticket(&harness.engine, &mut ticket)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Precondition(_)));
    assert!(err.to_string().contains("different topology kinds"));
}

#[tokio::test]
async fn test_pitr_restore_rejects_mismatched_shard_count() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::mongo_cluster(1, "src.mg.example", true, 3));
    harness
        .repository
        .insert_cluster(fixtures::mongo_cluster(2, "dst.mg.example", true, 2));

    let mut ticket = ticket(
        TicketType::MongoPitrRestore,
        json!([{
            "src_cluster_id": 1,
            "dst_cluster_id": 2,
            "dst_time": "2024-06-01 12:00:00",
            "apply_oplog": false,
        }]),
    );
    let err = flows::run_ticket(&harness.engine, &mut ticket)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("different shard counts"));
}

#[tokio::test]
async fn test_slave_rebuild_group_missing_selects_build_branch() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::sqlserver_ha_cluster(1, "ms.app.example"));
    // No availability group configured; databases exist on the master.
    harness.gateway.stub_rows("sys.availability_groups", vec![]);
    harness.gateway.stub_rows(
        "FROM sys.databases WHERE database_id > 4",
        vec![json!({"name": "gamedb1"}), json!({"name": "gamedb2"})],
    );

    let fix_ip = "10.1.0.2";
    let mut ticket = ticket(
        TicketType::SqlserverSlaveRebuild,
        json!([{ "cluster_id": 1, "fix_slave_ip": fix_ip }]),
    );
    let run = flows::run_ticket(&harness.engine, &mut ticket).await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);

    let builds = harness.gateway.executed_matching("sp_build_availability_group");
    assert_eq!(builds.len(), 1);
    assert!(builds[0].commands.iter().any(|c| c.contains("gamedb1,gamedb2")));
    // The rebuild and repair branches were gated out, not executed.
    assert!(harness
        .gateway
        .executed_matching("sp_drop_availability_group")
        .is_empty());
    assert!(harness
        .gateway
        .executed_matching("sp_rebuild_db_sync")
        .is_empty());

    let skipped: Vec<NodeState> = {
        let mut states = Vec::new();
        for record in harness.store.list_nodes(&run.flow.root_id).await.unwrap() {
            if record.name.contains("rebuild availability group")
                || record.name.contains("re-establish database sync")
            {
                states.push(record.state);
            }
        }
        states
    };
    assert_eq!(skipped, vec![NodeState::Skipped, NodeState::Skipped]);
}

#[tokio::test]
async fn test_slave_rebuild_healthy_gates_out_every_repair_branch() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::sqlserver_ha_cluster(1, "ms.app.example"));
    harness
        .gateway
        .stub_rows("sys.availability_groups", vec![json!({"name": "AG1"})]);
    harness.gateway.stub_rows(
        "synchronization_health_desc",
        vec![json!({"synchronization_health_desc": "HEALTHY"})],
    );
    harness
        .gateway
        .stub_rows("dm_hadr_database_replica_states", vec![]);
    harness.gateway.stub_rows(
        "FROM sys.databases WHERE database_id > 4",
        vec![json!({"name": "gamedb1"})],
    );

    let mut ticket = ticket(
        TicketType::SqlserverSlaveRebuild,
        json!([{ "cluster_id": 1, "fix_slave_ip": "10.1.0.2" }]),
    );
    let run = flows::run_ticket(&harness.engine, &mut ticket).await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);

    assert!(harness
        .gateway
        .executed_matching("sp_build_availability_group")
        .is_empty());
    assert!(harness
        .gateway
        .executed_matching("sp_rebuild_db_sync")
        .is_empty());
}

#[tokio::test]
async fn test_transfer_cluster_pauses_then_moves_dns_after_confirmation() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::healthy_ha_cluster(1, "one.app.example"));
    harness
        .repository
        .insert_cluster(fixtures::healthy_ha_cluster(2, "two.app.example"));

    let mut ticket = ticket(
        TicketType::TransferCluster,
        json!({
            "cluster_domain_list": ["one.app.example", "two.app.example"],
            "target_biz_id": 200,
            "need_clone_priv_rules": true,
        }),
    );
    let run = flows::run_ticket(&harness.engine, &mut ticket).await.unwrap();
    let RunOutcome::Paused { todo_id, .. } = run.outcome else {
        panic!("expected pause, got {:?}", run.outcome);
    };

    // Metadata already moved; DNS untouched while parked.
    assert_eq!(
        harness.repository.get_cluster(1).await.unwrap().biz_id,
        200
    );
    assert!(harness.gateway.executed_matching("dnsctl transfer").is_empty());
    assert!(!harness.gateway.executed_matching("privctl clone-rules").is_empty());

    harness
        .todos
        .resolve(todo_id, "admin", TodoAction::Approve, json!({}))
        .unwrap();
    let outcome = harness
        .engine
        .resume(&run.pipeline, &ticket)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);

    let dns = harness.gateway.executed_matching("dnsctl transfer");
    assert_eq!(dns.len(), 1);
    assert!(dns[0]
        .commands
        .iter()
        .any(|c| c.contains("one.app.example") && c.contains("--to-biz 200")));
    assert_eq!(harness.todos.get(todo_id).unwrap().status, TodoStatus::DoneSuccess);
}

#[tokio::test]
async fn test_transfer_cluster_rejects_entangled_machines() {
    let harness = TestHarness::new();
    let cluster_a = fixtures::healthy_ha_cluster(1, "one.app.example");
    // A third cluster shares a machine with cluster 1 but is not part of
    // the transfer.
    let mut entangled = fixtures::healthy_ha_cluster(3, "shared.app.example");
    entangled.storages[0].machine.ip = cluster_a.storages[0].machine.ip.clone();
    harness.repository.insert_cluster(cluster_a);
    harness.repository.insert_cluster(entangled);

    let mut ticket = ticket(
        TicketType::TransferCluster,
        json!({
            "cluster_domain_list": ["one.app.example"],
            "target_biz_id": 200,
        }),
    );
    let err = flows::run_ticket(&harness.engine, &mut ticket)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Precondition(_)));
    assert!(err.to_string().contains("shared.app.example"));
}

#[tokio::test]
async fn test_authorize_rules_grant_on_master() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::healthy_ha_cluster(1, "one.app.example"));

    let mut ticket = ticket(
        TicketType::AuthorizeRules,
        json!([{
            "cluster_id": 1,
            "rules": [{
                "user": "reporting",
                "access_db": "db1_app",
                "privileges": ["SELECT"],
                "source_ips": ["10.200.0.1"],
            }],
        }]),
    );
    let run = flows::run_ticket(&harness.engine, &mut ticket).await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);

    let grants = harness.gateway.executed_matching("GRANT SELECT");
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].addresses, vec!["10.1.0.1:20000"]);
    assert!(grants[0].commands[0].contains("`reporting`@`10.200.0.1`"));
}

#[tokio::test]
async fn test_terminated_backup_drops_temp_account_best_effort() {
    let harness = TestHarness::new();
    harness
        .repository
        .insert_cluster(fixtures::healthy_ha_cluster(1, "one.app.example"));
    harness
        .gateway
        .stub_rows("show databases", vec![json!({"Database": "db1_app"})]);

    let ticket = ticket(
        TicketType::DbTableBackup,
        json!([{
            "cluster_id": 1,
            "db_patterns": ["db1%"], "ignore_dbs": [],
            "table_patterns": ["*"], "ignore_tables": [],
        }]),
    );
    let pipeline = controller_for(TicketType::DbTableBackup)
        .build(&ticket, harness.engine.services(), "backup-term-root")
        .await
        .unwrap();

    harness.engine.terminate(&pipeline, "operator").await.unwrap();

    // The compensating drop ran even though the flow never started.
    let drops = harness.gateway.executed_matching("drop user if exists");
    assert_eq!(drops.len(), 4, "one drop batch per instance of the cluster");
    let outcome = harness.engine.run(&pipeline, &ticket).await.unwrap();
    assert_eq!(outcome, RunOutcome::Terminated);
}
