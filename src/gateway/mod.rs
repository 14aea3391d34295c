//! # Remote Command Gateway
//!
//! Uniform interface for firing commands against named addresses inside a
//! cloud region. Both SQL-style batches (remote statement execution against
//! `host:port` service addresses) and script-style jobs (shell/powershell
//! against hosts) go through the same contract; the engine only cares about
//! per-address success/failure and structured result rows.
//!
//! Concrete transports (job-execution API, remote-SQL API) live outside the
//! core and implement [`RemoteCommandGateway`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("remote call timed out after {timeout_secs}s: {operation}")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("remote transport error: {message}")]
    Transport { message: String },

    #[error("empty target address list")]
    EmptyTargets,
}

/// How the command batch should be interpreted by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// Statement batch executed against database service addresses.
    Sql,
    /// Script content executed on hosts under the given account.
    Script { account: String, os_name: String },
}

/// One batch of commands against a set of addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommand {
    /// `host:port` for SQL, bare host ip for scripts
    pub addresses: Vec<String>,
    pub commands: Vec<String>,
    pub cloud_id: i64,
    /// Run the whole batch to completion even if a middle statement fails,
    /// so trailing cleanup statements (re-enable binlog and the like) still
    /// execute.
    pub force_continue_on_error: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub kind: CommandKind,
}

/// Result of one command within an address's batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    /// Empty when the command succeeded
    pub error_msg: String,
    pub rows: Vec<Value>,
}

impl CommandResult {
    pub fn is_ok(&self) -> bool {
        self.error_msg.is_empty()
    }
}

/// Per-address outcome of a [`RemoteCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressResult {
    pub address: String,
    /// Address-level failure (unreachable, auth) as opposed to per-command errors
    pub error_msg: Option<String>,
    pub cmd_results: Vec<CommandResult>,
}

impl AddressResult {
    /// Address reached and every command succeeded.
    pub fn is_ok(&self) -> bool {
        self.error_msg.is_none() && self.cmd_results.iter().all(CommandResult::is_ok)
    }

    /// First error message found, address-level first.
    pub fn first_error(&self) -> Option<&str> {
        if let Some(err) = &self.error_msg {
            return Some(err);
        }
        self.cmd_results
            .iter()
            .find(|r| !r.is_ok())
            .map(|r| r.error_msg.as_str())
    }
}

/// Uniform remote-execution interface.
///
/// A timeout or per-address failure is reported in the return value (or as
/// [`RemoteError::Timeout`]), never as a panic; callers translate failures
/// into node state.
#[async_trait]
pub trait RemoteCommandGateway: Send + Sync {
    async fn execute(&self, command: RemoteCommand) -> Result<Vec<AddressResult>, RemoteError>;
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_result_error_detection() {
        let ok = AddressResult {
            address: "10.0.0.1:20000".into(),
            error_msg: None,
            cmd_results: vec![CommandResult {
                command: "select 1".into(),
                error_msg: String::new(),
                rows: vec![],
            }],
        };
        assert!(ok.is_ok());
        assert!(ok.first_error().is_none());

        let failed = AddressResult {
            address: "10.0.0.1:20000".into(),
            error_msg: None,
            cmd_results: vec![CommandResult {
                command: "drop user x".into(),
                error_msg: "access denied".into(),
                rows: vec![],
            }],
        };
        assert!(!failed.is_ok());
        assert_eq!(failed.first_error(), Some("access denied"));
    }
}
