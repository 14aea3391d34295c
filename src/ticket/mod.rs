//! # Tickets and Flows
//!
//! A ticket is an operator-submitted request: an immutable, already-validated
//! payload plus a mutable status. Each ticket owns one or more flows; a flow
//! owns one pipeline run and mirrors its terminal state. Tickets, flows, and
//! todos are retained as an audit trail — never hard-deleted.

pub mod todo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub use todo::{Todo, TodoAction, TodoError, TodoStatus, TodoStore, TodoType};

/// Operation family a ticket requests. Each variant maps to one flow
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketType {
    ClearMachine,
    DbTableBackup,
    MongoPitrRestore,
    AuthorizeRules,
    TransferCluster,
    SqlserverSlaveRebuild,
}

impl fmt::Display for TicketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClearMachine => "CLEAR_MACHINE",
            Self::DbTableBackup => "DB_TABLE_BACKUP",
            Self::MongoPitrRestore => "MONGO_PITR_RESTORE",
            Self::AuthorizeRules => "AUTHORIZE_RULES",
            Self::TransferCluster => "TRANSFER_CLUSTER",
            Self::SqlserverSlaveRebuild => "SQLSERVER_SLAVE_REBUILD",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Approve,
    Todo,
    Running,
    Succeeded,
    Failed,
    Terminated,
    Revoked,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Terminated | Self::Revoked
        )
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approve => "approve",
            Self::Todo => "todo",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Revoked => "revoked",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Running,
    /// Parked on a pause checkpoint or a failed node awaiting retry
    Paused,
    Succeeded,
    Failed,
    Terminated,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Operator-submitted request payload, validated upstream.
///
/// The core performs no input validation of its own beyond
/// topology-existence and precondition checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub uid: String,
    pub created_by: String,
    pub biz_id: i64,
    pub ticket_type: TicketType,
    /// Flow-type-specific line items; each controller deserializes its own
    /// info shape out of this
    pub infos: Value,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    pub fn new(
        uid: impl Into<String>,
        created_by: impl Into<String>,
        biz_id: i64,
        ticket_type: TicketType,
        infos: Value,
    ) -> Self {
        Self {
            uid: uid.into(),
            created_by: created_by.into(),
            biz_id,
            ticket_type,
            infos,
            status: TicketStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// One executable unit belonging to a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Root id of the owned pipeline
    pub root_id: String,
    pub ticket_uid: String,
    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(root_id: impl Into<String>, ticket_uid: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            root_id: root_id.into(),
            ticket_uid: ticket_uid.into(),
            status: FlowStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_status(&mut self, status: FlowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Ticket status derived from its flows: failure and termination dominate,
/// any non-terminal flow keeps the ticket running.
pub fn ticket_status_from_flows(flows: &[FlowStatus]) -> TicketStatus {
    if flows.is_empty() {
        return TicketStatus::Pending;
    }
    if flows.iter().any(|f| *f == FlowStatus::Terminated) {
        return TicketStatus::Terminated;
    }
    if flows.iter().any(|f| *f == FlowStatus::Failed) {
        return TicketStatus::Failed;
    }
    if flows.iter().all(|f| *f == FlowStatus::Succeeded) {
        return TicketStatus::Succeeded;
    }
    TicketStatus::Running
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_flow_state_dominates() {
        assert_eq!(
            ticket_status_from_flows(&[FlowStatus::Succeeded, FlowStatus::Failed]),
            TicketStatus::Failed
        );
        assert_eq!(
            ticket_status_from_flows(&[FlowStatus::Failed, FlowStatus::Terminated]),
            TicketStatus::Terminated
        );
        assert_eq!(
            ticket_status_from_flows(&[FlowStatus::Succeeded, FlowStatus::Succeeded]),
            TicketStatus::Succeeded
        );
        assert_eq!(
            ticket_status_from_flows(&[FlowStatus::Succeeded, FlowStatus::Running]),
            TicketStatus::Running
        );
    }

    #[test]
    fn test_ticket_type_serde() {
        let t: TicketType = serde_json::from_str("\"DB_TABLE_BACKUP\"").unwrap();
        assert_eq!(t, TicketType::DbTableBackup);
        assert_eq!(t.to_string(), "DB_TABLE_BACKUP");
    }
}
