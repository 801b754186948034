use std::sync::Arc;

use crate::{ledger::CallLedger, webhook::external::ExternalResults, worker::WorkerRegistry};

pub struct AppState {
    pub ledger: Arc<CallLedger>,
    pub workers: Arc<WorkerRegistry>,
    pub external_results: ExternalResults,
}
