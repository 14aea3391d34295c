//! # Todos
//!
//! A todo is a durable human-decision checkpoint tied to a flow: created when
//! a pipeline reaches a pause gate or fails in a way that needs an operator
//! decision, resolved by exactly one terminal action, immutable afterwards.
//! Every resolution is appended to an operation history.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Built-in account allowed to resolve any todo (engine-internal confirms).
pub const SYSTEM_USER: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoType {
    /// Pre-execution confirmation by the submitter
    Approve,
    /// Mid-pipeline confirmation gate
    InnerApprove,
    /// Waiting for more resource to be supplied
    ResourceReplenish,
    /// A flow failed and needs a retry/terminate decision
    InnerFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Todo,
    DoneSuccess,
    DoneFailed,
}

impl TodoStatus {
    pub fn is_unfinished(&self) -> bool {
        matches!(self, Self::Todo)
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::DoneSuccess => "done_success",
            Self::DoneFailed => "done_failed",
        };
        write!(f, "{s}")
    }
}

/// The exactly-one terminal action a todo is resolved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoAction {
    Approve,
    Terminate,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TodoError {
    #[error("todo {id} does not exist")]
    NotFound { id: u64 },

    #[error("todo {id} is already processed and cannot be processed again")]
    AlreadyProcessed { id: u64 },

    #[error("{username} is not among the operators {operators:?} of todo {id}")]
    WrongOperator {
        id: u64,
        username: String,
        operators: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: u64,
    pub name: String,
    pub flow_root_id: String,
    pub ticket_uid: String,
    /// Pipeline node this todo parks, when tied to a pause gate
    pub node_id: Option<u32>,
    pub todo_type: TodoType,
    pub operators: Vec<String>,
    pub context: Value,
    pub status: TodoStatus,
    pub done_by: String,
    pub done_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One resolution record; written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoHistory {
    pub todo_id: u64,
    pub actor: String,
    pub action: TodoAction,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct TodoStoreInner {
    next_id: u64,
    todos: HashMap<u64, Todo>,
    history: Vec<TodoHistory>,
}

/// In-process todo registry with the resolution rules of the ticket layer:
/// no double resolution, operator membership enforced, system user exempt.
#[derive(Default)]
pub struct TodoStore {
    inner: Mutex<TodoStoreInner>,
}

impl TodoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        name: impl Into<String>,
        flow_root_id: impl Into<String>,
        ticket_uid: impl Into<String>,
        node_id: Option<u32>,
        todo_type: TodoType,
        operators: Vec<String>,
        context: Value,
    ) -> Todo {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let todo = Todo {
            id: inner.next_id,
            name: name.into(),
            flow_root_id: flow_root_id.into(),
            ticket_uid: ticket_uid.into(),
            node_id,
            todo_type,
            operators,
            context,
            status: TodoStatus::Todo,
            done_by: String::new(),
            done_at: None,
            created_at: Utc::now(),
        };
        tracing::info!(
            todo_id = todo.id,
            flow_root_id = %todo.flow_root_id,
            todo_type = ?todo.todo_type,
            "todo created"
        );
        inner.todos.insert(todo.id, todo.clone());
        todo
    }

    pub fn get(&self, id: u64) -> Result<Todo, TodoError> {
        self.inner
            .lock()
            .todos
            .get(&id)
            .cloned()
            .ok_or(TodoError::NotFound { id })
    }

    /// Unfinished todos attached to one flow.
    pub fn unfinished_for_flow(&self, flow_root_id: &str) -> Vec<Todo> {
        self.inner
            .lock()
            .todos
            .values()
            .filter(|t| t.flow_root_id == flow_root_id && t.status.is_unfinished())
            .cloned()
            .collect()
    }

    /// Resolve a todo with exactly one terminal action.
    ///
    /// `params` may carry a `remark` that is folded into the todo context.
    pub fn resolve(
        &self,
        id: u64,
        username: &str,
        action: TodoAction,
        params: Value,
    ) -> Result<Todo, TodoError> {
        let mut inner = self.inner.lock();
        let todo = inner
            .todos
            .get_mut(&id)
            .ok_or(TodoError::NotFound { id })?;

        if !todo.status.is_unfinished() {
            return Err(TodoError::AlreadyProcessed { id });
        }
        if username != SYSTEM_USER && !todo.operators.iter().any(|op| op == username) {
            return Err(TodoError::WrongOperator {
                id,
                username: username.to_string(),
                operators: todo.operators.clone(),
            });
        }

        todo.status = match action {
            TodoAction::Approve => TodoStatus::DoneSuccess,
            TodoAction::Terminate => TodoStatus::DoneFailed,
        };
        todo.done_by = username.to_string();
        todo.done_at = Some(Utc::now());
        if let Some(remark) = params.get("remark") {
            if let Some(ctx) = todo.context.as_object_mut() {
                ctx.insert("remark".to_string(), remark.clone());
            }
        }
        let resolved = todo.clone();

        inner.history.push(TodoHistory {
            todo_id: id,
            actor: username.to_string(),
            action,
            at: Utc::now(),
        });
        tracing::info!(todo_id = id, actor = %username, action = ?action, "todo resolved");
        Ok(resolved)
    }

    pub fn history_for(&self, todo_id: u64) -> Vec<TodoHistory> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|h| h.todo_id == todo_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_todo() -> (TodoStore, u64) {
        let store = TodoStore::new();
        let todo = store.create(
            "confirm cutover",
            "root-1",
            "ticket-1",
            Some(3),
            TodoType::InnerApprove,
            vec!["alice".to_string(), "bob".to_string()],
            json!({}),
        );
        let id = todo.id;
        (store, id)
    }

    #[test]
    fn test_resolution_is_terminal() {
        let (store, id) = store_with_todo();
        store
            .resolve(id, "alice", TodoAction::Approve, json!({}))
            .unwrap();
        let err = store
            .resolve(id, "bob", TodoAction::Terminate, json!({}))
            .unwrap_err();
        assert_eq!(err, TodoError::AlreadyProcessed { id });
        assert_eq!(store.get(id).unwrap().status, TodoStatus::DoneSuccess);
    }

    #[test]
    fn test_non_operator_rejected() {
        let (store, id) = store_with_todo();
        let err = store
            .resolve(id, "mallory", TodoAction::Approve, json!({}))
            .unwrap_err();
        assert!(matches!(err, TodoError::WrongOperator { .. }));
        // still unfinished
        assert!(store.get(id).unwrap().status.is_unfinished());
    }

    #[test]
    fn test_system_user_bypasses_operator_check() {
        let (store, id) = store_with_todo();
        store
            .resolve(id, SYSTEM_USER, TodoAction::Approve, json!({}))
            .unwrap();
        assert_eq!(store.get(id).unwrap().done_by, SYSTEM_USER);
    }

    #[test]
    fn test_terminate_marks_done_failed_and_records_history() {
        let (store, id) = store_with_todo();
        store
            .resolve(id, "bob", TodoAction::Terminate, json!({"remark": "wrong window"}))
            .unwrap();
        let todo = store.get(id).unwrap();
        assert_eq!(todo.status, TodoStatus::DoneFailed);
        assert_eq!(todo.context["remark"], "wrong window");
        let history = store.history_for(id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, TodoAction::Terminate);
    }
}
