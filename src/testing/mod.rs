//! Test support: snapshot fixtures and an in-process recording gateway.
//!
//! Compiled into the library so integration tests and downstream embedders
//! share one set of fixtures.

pub mod fixtures;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::{MemoryPipelineStore, PipelineEngine};
use crate::gateway::{AddressResult, CommandResult, RemoteCommand, RemoteCommandGateway, RemoteError};
use crate::registry::{Services, StepRegistry};
use crate::ticket::TodoStore;
use crate::topology::MemoryTopologyRepository;

/// Gateway fake: records every dispatched command, returns stubbed rows, and
/// injects failures on demand.
#[derive(Default)]
pub struct RecordingGateway {
    commands: Mutex<Vec<RemoteCommand>>,
    row_stubs: Mutex<Vec<(String, Vec<Value>)>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything executed so far, in dispatch order.
    pub fn executed(&self) -> Vec<RemoteCommand> {
        self.commands.lock().clone()
    }

    /// Commands whose text contains the needle.
    pub fn executed_matching(&self, needle: &str) -> Vec<RemoteCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.commands.iter().any(|cmd| cmd.contains(needle)))
            .cloned()
            .collect()
    }

    /// Return these rows for any command containing the needle.
    pub fn stub_rows(&self, needle: impl Into<String>, rows: Vec<Value>) {
        self.row_stubs.lock().push((needle.into(), rows));
    }

    /// Fail any batch whose address or command text contains the needle.
    pub fn fail_on(&self, needle: impl Into<String>) {
        self.failures.lock().push(needle.into());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    fn should_fail(&self, address: &str, commands: &[String]) -> bool {
        let failures = self.failures.lock();
        failures.iter().any(|needle| {
            address.contains(needle.as_str())
                || commands.iter().any(|c| c.contains(needle.as_str()))
        })
    }

    fn rows_for(&self, command: &str) -> Vec<Value> {
        let stubs = self.row_stubs.lock();
        stubs
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteCommandGateway for RecordingGateway {
    async fn execute(&self, command: RemoteCommand) -> Result<Vec<AddressResult>, RemoteError> {
        if command.addresses.is_empty() {
            return Err(RemoteError::EmptyTargets);
        }
        self.commands.lock().push(command.clone());

        let mut results = Vec::with_capacity(command.addresses.len());
        for address in &command.addresses {
            if self.should_fail(address, &command.commands) {
                results.push(AddressResult {
                    address: address.clone(),
                    error_msg: Some("injected failure".to_string()),
                    cmd_results: Vec::new(),
                });
                continue;
            }
            let cmd_results = command
                .commands
                .iter()
                .map(|cmd| CommandResult {
                    command: cmd.clone(),
                    error_msg: String::new(),
                    rows: self.rows_for(cmd),
                })
                .collect();
            results.push(AddressResult {
                address: address.clone(),
                error_msg: None,
                cmd_results,
            });
        }
        Ok(results)
    }
}

/// Everything a flow/engine test needs, wired onto in-memory fakes.
pub struct TestHarness {
    pub repository: Arc<MemoryTopologyRepository>,
    pub gateway: Arc<RecordingGateway>,
    pub store: Arc<MemoryPipelineStore>,
    pub todos: Arc<TodoStore>,
    pub engine: PipelineEngine,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(StepRegistry::standard()))
    }

    pub fn with_registry(registry: Arc<StepRegistry>) -> Self {
        let repository = Arc::new(MemoryTopologyRepository::new());
        let gateway = Arc::new(RecordingGateway::new());
        let store = Arc::new(MemoryPipelineStore::new());
        let todos = Arc::new(TodoStore::new());
        let services = Arc::new(Services {
            repository: repository.clone(),
            gateway: gateway.clone(),
            todos: todos.clone(),
            config: EngineConfig::for_testing(),
        });
        let engine = PipelineEngine::new(registry, store.clone(), services);
        Self {
            repository,
            gateway,
            store,
            todos,
            engine,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
