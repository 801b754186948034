//! Workers forked when the gateway boots.
//!
//! ```toml
//! [[worker]]
//! id = "images"
//! script = "/opt/plugins/images/run"
//!
//! [worker.config]
//! plugin = "images"
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use serde::Deserialize;
use tracing::{error, info};

use crate::worker::WorkerRegistry;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub script: PathBuf,
    /// Sent to the worker in its `start` message
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerManifest {
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerSpec>,
}

impl WorkerManifest {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid worker manifest")
    }

    pub async fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read worker manifest {}", path.display()))?;
        Self::parse(&raw)
    }

    /// Fork every listed worker. A worker that fails to start is logged and skipped.
    pub async fn launch(&self, registry: &Arc<WorkerRegistry>) -> usize {
        let launches = self.workers.iter().map(|spec| async move {
            match registry
                .spawn(&spec.id, &spec.script, spec.config.clone())
                .await
            {
                Ok(url) => {
                    info!(worker_id = %spec.id, %url, "boot worker ready");
                    true
                }
                Err(e) => {
                    error!(worker_id = %spec.id, "boot worker failed: {e}");
                    false
                }
            }
        });
        futures_util::future::join_all(launches)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }
}
