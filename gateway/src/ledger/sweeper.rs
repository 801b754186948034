use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::CallLedger;

/// Background task that sweeps the ledger every `sweep_interval`.
///
/// Stops when [`LedgerSweeper::stop`] is called or the handle is dropped.
pub struct LedgerSweeper {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LedgerSweeper {
    pub fn start(ledger: Arc<CallLedger>) -> Self {
        let cancel = CancellationToken::new();
        let period = ledger.settings().sweep_interval;
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick is immediate; skip it
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        ledger.sweep().await;
                    }
                }
            }
            debug!("ledger sweeper exited");
        });

        info!(interval_ms = period.as_millis() as u64, "ledger sweeper started");
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LedgerSweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
