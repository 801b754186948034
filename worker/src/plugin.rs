use async_trait::async_trait;
use serde_json::Value;
use shared_types::CommandEnvelope;

use crate::reporter::LedgerReporter;

/// What a plugin produced for one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Finished inline; the value is the command result
    Done(Value),
    /// Still running; progress and the result arrive through the ledger under `call_id`
    Deferred { call_id: String },
}

/// Per-worker context handed to every command.
#[derive(Debug, Clone)]
pub struct CallContext {
    worker_id: Option<String>,
    reporter: Option<LedgerReporter>,
}

impl CallContext {
    pub(crate) fn new(worker_id: Option<String>, reporter: Option<LedgerReporter>) -> Self {
        Self {
            worker_id,
            reporter,
        }
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    /// Reporter for the gateway's internal webhook, when a gateway URL was configured.
    pub fn reporter(&self) -> Option<&LedgerReporter> {
        self.reporter.as_ref()
    }

    /// Fresh call id, prefixed with the worker id so the gateway can release it
    /// when this worker goes away.
    pub fn new_call_id(&self) -> String {
        let id = uuid::Uuid::new_v4();
        match &self.worker_id {
            Some(worker_id) => format!("{worker_id}:{id}"),
            None => id.to_string(),
        }
    }
}

#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Called once with the startup config before the worker reports ready.
    async fn start(&self, _config: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn execute(&self, command: CommandEnvelope, ctx: CallContext) -> Result<Outcome, String>;
}
