//! MySQL/TenDB activities: media distribution, library/table backup steps,
//! and privilege-rule application.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{first_column_strings, require_all_ok};
use crate::gateway::{CommandKind, RemoteCommand};
use crate::registry::{Activity, ActivityError, ActivityInput, ActivityOutput, Services, StepCode};

#[derive(Debug, Deserialize)]
struct TransFileKwargs {
    exec_ips: Vec<String>,
    cloud_id: i64,
    file_list: Vec<String>,
    file_target_path: String,
}

/// Push the actuator/media package to the hosts that will execute remote
/// work. Always the first step of flows that run actuator commands.
pub struct TransFileActivity;

#[async_trait]
impl Activity for TransFileActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: TransFileKwargs = input.parse_kwargs(StepCode::TransFile)?;
        if kwargs.exec_ips.is_empty() {
            return Err(ActivityError::execution("no hosts to receive media"));
        }
        let command = format!(
            "transfer_media --dest {} {}",
            kwargs.file_target_path,
            kwargs.file_list.join(" ")
        );
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: kwargs.exec_ips.clone(),
                commands: vec![command],
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.script_timeout(),
                kind: CommandKind::Script {
                    account: "root".to_string(),
                    os_name: "shell".to_string(),
                },
            })
            .await?;
        require_all_ok(&results)?;
        Ok(ActivityOutput::ok().with_outputs(json!({ "hosts": kwargs.exec_ips })))
    }
}

#[derive(Debug, Deserialize)]
struct BuildTableFilterKwargs {
    /// Context namespace of the enclosing backup job; parallel jobs write
    /// disjoint trans keys
    ns: String,
    db_patterns: Vec<String>,
    ignore_dbs: Vec<String>,
    table_patterns: Vec<String>,
    ignore_tables: Vec<String>,
}

/// Translate a `%`/`*`/`?` wildcard pattern into an anchored regex.
fn wildcard_to_regex(patterns: &[String]) -> String {
    let alternatives: Vec<String> = patterns
        .iter()
        .map(|p| {
            let mut out = String::new();
            for c in p.chars() {
                match c {
                    '%' | '*' => out.push_str(".*"),
                    '?' => out.push('.'),
                    c => out.push_str(&regex::escape(&c.to_string())),
                }
            }
            out
        })
        .collect();
    format!("^(?:{})$", alternatives.join("|"))
}

/// Build the include/exclude filter regexes for a library/table-scoped
/// backup from the ticket's wildcard patterns.
pub struct BuildTableFilterActivity;

#[async_trait]
impl Activity for BuildTableFilterActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        _services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: BuildTableFilterKwargs = input.parse_kwargs(StepCode::BuildTableFilter)?;
        if kwargs.db_patterns.is_empty() {
            return Err(ActivityError::execution("empty database pattern list"));
        }

        let db_regex = wildcard_to_regex(&kwargs.db_patterns);
        let table_regex = wildcard_to_regex(&kwargs.table_patterns);
        for (name, source) in [("db filter", &db_regex), ("table filter", &table_regex)] {
            Regex::new(source)
                .map_err(|e| ActivityError::execution(format!("invalid {name}: {e}")))?;
        }

        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "db_regex": db_regex, "table_regex": table_regex }))
            .write_trans(format!("{}:db_filter_regex", kwargs.ns), json!(db_regex))
            .write_trans(format!("{}:table_filter_regex", kwargs.ns), json!(table_regex))
            .write_trans(format!("{}:ignore_dbs", kwargs.ns), json!(kwargs.ignore_dbs))
            .write_trans(format!("{}:ignore_tables", kwargs.ns), json!(kwargs.ignore_tables)))
    }
}

#[derive(Debug, Deserialize)]
struct CheckTableFilterKwargs {
    ns: String,
    address: String,
    cloud_id: i64,
}

/// Validate the built filter against the instance's real schema objects
/// before any backup command runs. An empty match set fails the node.
pub struct CheckTableFilterActivity;

#[async_trait]
impl Activity for CheckTableFilterActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: CheckTableFilterKwargs = input.parse_kwargs(StepCode::CheckTableFilter)?;
        let db_regex_src = input
            .trans_value(&format!("{}:db_filter_regex", kwargs.ns))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ActivityError::execution("db filter regex missing from context"))?;
        let ignore_dbs: Vec<String> = input
            .trans_value(&format!("{}:ignore_dbs", kwargs.ns))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ActivityError::execution(format!("ignore_dbs: {e}")))?
            .unwrap_or_default();
        let db_regex = Regex::new(db_regex_src)
            .map_err(|e| ActivityError::execution(format!("stored db filter invalid: {e}")))?;

        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.address.clone()],
                commands: vec!["show databases".to_string()],
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.sql_timeout(),
                kind: CommandKind::Sql,
            })
            .await?;
        require_all_ok(&results)?;

        let matched: Vec<String> = first_column_strings(&results)
            .into_iter()
            .filter(|db| db_regex.is_match(db))
            .filter(|db| !ignore_dbs.contains(db))
            .collect();

        if matched.is_empty() {
            return Err(ActivityError::execution(format!(
                "filter matched no databases on {}",
                kwargs.address
            )));
        }
        info!(address = %kwargs.address, matched = matched.len(), "backup filter validated");
        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "match_dbs": matched }))
            .write_trans(format!("{}:match_dbs", kwargs.ns), json!(matched)))
    }
}

#[derive(Debug, Deserialize)]
struct ExecTableBackupKwargs {
    ns: String,
    exec_ip: String,
    port: u16,
    cloud_id: i64,
    backup_id: String,
    backup_type: String,
    backup_gsd: Vec<String>,
    custom_backup_dir: String,
    role: String,
}

/// Execute the library/table backup on the chosen instance via the actuator.
pub struct ExecTableBackupActivity;

#[async_trait]
impl Activity for ExecTableBackupActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: ExecTableBackupKwargs = input.parse_kwargs(StepCode::ExecTableBackup)?;
        let db_regex = input
            .trans_value(&format!("{}:db_filter_regex", kwargs.ns))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ActivityError::execution("db filter regex missing from context"))?
            .to_string();
        let table_regex = input
            .trans_value(&format!("{}:table_filter_regex", kwargs.ns))
            .and_then(|v| v.as_str())
            .unwrap_or(".*")
            .to_string();

        let command = format!(
            "dbactuator mysql backup-demand --host {} --port {} --backup-id {} \
             --backup-type {} --backup-gsd {} --backup-dir {} --role {} \
             --db-filter '{}' --table-filter '{}'",
            kwargs.exec_ip,
            kwargs.port,
            kwargs.backup_id,
            kwargs.backup_type,
            kwargs.backup_gsd.join(","),
            kwargs.custom_backup_dir,
            kwargs.role,
            db_regex,
            table_regex,
        );
        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![kwargs.exec_ip.clone()],
                commands: vec![command],
                cloud_id: kwargs.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.script_timeout(),
                kind: CommandKind::Script {
                    account: "mysql".to_string(),
                    os_name: "shell".to_string(),
                },
            })
            .await?;
        require_all_ok(&results)?;

        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "backup_id": kwargs.backup_id }))
            .write_trans(format!("{}:backup_id", kwargs.ns), json!(kwargs.backup_id)))
    }
}

#[derive(Debug, Deserialize)]
struct LinkBackupIdKwargs {
    ns: String,
}

/// Link the produced backup artifact to the submitting ticket so the
/// artifact can be retrieved by ticket later.
pub struct LinkBackupIdActivity;

#[async_trait]
impl Activity for LinkBackupIdActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        _services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: LinkBackupIdKwargs = input.parse_kwargs(StepCode::LinkBackupId)?;
        let backup_id = input
            .trans_value(&format!("{}:backup_id", kwargs.ns))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ActivityError::execution("backup id missing from context"))?
            .to_string();
        let ticket_uid = input.global_str("uid").unwrap_or_default().to_string();
        info!(backup_id = %backup_id, ticket_uid = %ticket_uid, "backup artifact linked");
        Ok(ActivityOutput::ok()
            .with_outputs(json!({ "backup_id": backup_id, "ticket_uid": ticket_uid })))
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizeRule {
    user: String,
    access_db: String,
    privileges: Vec<String>,
    source_ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizeRulesKwargs {
    cluster_id: i64,
    rules: Vec<AuthorizeRule>,
}

/// Apply account privilege rules on a cluster's master instance.
pub struct AuthorizeRulesActivity;

#[async_trait]
impl Activity for AuthorizeRulesActivity {
    async fn execute(
        &self,
        input: ActivityInput,
        services: &Services,
    ) -> Result<ActivityOutput, ActivityError> {
        let kwargs: AuthorizeRulesKwargs = input.parse_kwargs(StepCode::AuthorizeRules)?;
        let cluster = services.repository.get_cluster(kwargs.cluster_id).await?;
        let master = cluster
            .masters()
            .into_iter()
            .next()
            .ok_or_else(|| {
                ActivityError::execution(format!(
                    "cluster {} has no master instance",
                    cluster.immute_domain
                ))
            })?
            .ip_port();

        let mut commands = Vec::new();
        for rule in &kwargs.rules {
            for source_ip in &rule.source_ips {
                commands.push(format!(
                    "GRANT {} ON `{}`.* TO `{}`@`{}`;",
                    rule.privileges.join(", "),
                    rule.access_db,
                    rule.user,
                    source_ip,
                ));
            }
        }
        if commands.is_empty() {
            return Err(ActivityError::execution("no privilege rules to apply"));
        }

        let results = services
            .gateway
            .execute(RemoteCommand {
                addresses: vec![master],
                commands,
                cloud_id: cluster.cloud_id,
                force_continue_on_error: false,
                timeout: services.config.sql_timeout(),
                kind: CommandKind::Sql,
            })
            .await?;
        require_all_ok(&results)?;

        Ok(ActivityOutput::ok().with_outputs(json!({ "rules": kwargs.rules.len() })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_translation() {
        let regex = Regex::new(&wildcard_to_regex(&[
            "db1%".to_string(),
            "exact".to_string(),
        ]))
        .unwrap();
        assert!(regex.is_match("db1"));
        assert!(regex.is_match("db1_extra"));
        assert!(regex.is_match("exact"));
        assert!(!regex.is_match("other"));
        assert!(!regex.is_match("prefix_db1"));
    }

    #[test]
    fn test_wildcard_escapes_metacharacters() {
        let regex = Regex::new(&wildcard_to_regex(&["a.b%".to_string()])).unwrap();
        assert!(regex.is_match("a.b_suffix"));
        assert!(!regex.is_match("aXb_suffix"));
    }
}
