//! # dbflow-core
//!
//! Ticket/flow orchestration core for a database-management control plane.
//! Turns validated operator requests ("back up this cluster", "clear this
//! machine", "restore to this point in time") into directed graphs of remote
//! operations across many machines and instances, executes them with
//! partial-failure recovery, human-in-the-loop pauses, and resumability, and
//! audits the durable topology record against what a healthy cluster must
//! look like.
//!
//! ## Module Organization
//!
//! - [`topology`] - cluster/instance/entry snapshots and the repository façade
//! - [`gateway`] - uniform remote-command execution interface
//! - [`ticket`] - tickets, flows, and human-decision todos
//! - [`pipeline`] - activity-graph builders (chains, parallel groups, nesting)
//! - [`engine`] - the pipeline executor: states, context, durable store
//! - [`registry`] - step codes and the built-in activity catalog
//! - [`flows`] - per-operation-family planning (backup, restore, clear, ...)
//! - [`checker`] - read-only topology invariant auditing
//! - [`config`] - engine configuration
//! - [`error`] - top-level error type
//! - [`logging`] - structured logging setup
//! - [`testing`] - fixtures and fakes shared by tests and embedders
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dbflow_core::flows;
//! use dbflow_core::testing::TestHarness;
//! use dbflow_core::ticket::{Ticket, TicketType};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let harness = TestHarness::new();
//! let mut ticket = Ticket::new(
//!     "2024060112120001",
//!     "admin",
//!     100,
//!     TicketType::ClearMachine,
//!     json!({ "db_type": "mysql", "clear_hosts": [{ "ip": "10.0.0.9", "cloud_id": 0 }] }),
//! );
//! let run = flows::run_ticket(&harness.engine, &mut ticket).await?;
//! println!("flow {} finished as {}", run.flow.root_id, run.flow.status);
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod config;
pub mod engine;
pub mod error;
pub mod flows;
pub mod gateway;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod testing;
pub mod ticket;
pub mod topology;

pub use config::EngineConfig;
pub use engine::{PipelineEngine, RunOutcome};
pub use error::{FlowError, Result};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use registry::{Activity, Services, StepCode, StepRegistry};
pub use ticket::{Flow, FlowStatus, Ticket, TicketStatus, TicketType};
pub use topology::{ClusterSnapshot, TopologyRepository};
