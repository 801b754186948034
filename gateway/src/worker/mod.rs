//! Worker process supervisor.
//!
//! Each worker id maps to at most one live OS process. A worker is addressable
//! over HTTP only after its readiness handshake (`ready` over the IPC channel)
//! has been received; until then it is Starting and forwards are refused.

mod ipc;
mod monitor;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared_types::{SupervisorMessage, WorkerSnapshot, WorkerStatus};
use tokio::{
    process::{Child, Command},
    sync::{mpsc, Mutex, Notify},
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    ledger::CallLedger,
    secrets::{SecretSource, ENV_CONTAINER},
};

pub use monitor::ReadyWait;
use monitor::{Monitor, ReadyLatch, WorkerControl};

/// How long a forked worker may take to send `ready`.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Shortest pause between signalling an old worker and forking its replacement.
pub const MIN_RESTART_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {0} not found")]
    NotFound(String),

    #[error("failed to fork worker: {0}")]
    Spawn(String),

    #[error("worker {0} has no stdio channel")]
    MissingStdio(String),

    #[error("worker IPC failed: {0}")]
    Ipc(String),

    #[error("worker reported an error: {0}")]
    Rejected(String),

    #[error("worker exited before it was ready: {0}")]
    Exited(String),

    #[error("worker {worker_id} did not become ready within {timeout:?}")]
    ReadyTimeout { worker_id: String, timeout: Duration },

    #[error("{0}")]
    Transport(String),

    #[error("secret store unavailable: {0}")]
    Secrets(String),
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub ready_timeout: Duration,
    pub restart_grace: Duration,
    /// Per-request timeout for commands forwarded to workers
    pub forward_timeout: Duration,
    /// Webhook base URL handed to workers in their `start` message
    pub gateway_url: Option<String>,
}

impl SupervisorSettings {
    /// Use `grace` between terminate and re-fork, never below [`MIN_RESTART_GRACE`].
    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace.max(MIN_RESTART_GRACE);
        self
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            ready_timeout: READY_TIMEOUT,
            restart_grace: MIN_RESTART_GRACE,
            forward_timeout: Duration::from_secs(120),
            gateway_url: None,
        }
    }
}

/// Response relayed from a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Forwarded {
    pub status: u16,
    /// JSON body, or the raw text as a JSON string when it is not JSON
    pub body: Value,
}

struct WorkerEntry {
    generation: u64,
    status: WorkerStatus,
    pid: Option<u32>,
    base_url: Option<String>,
    startup_config: Value,
    script_path: PathBuf,
    registered_at: DateTime<Utc>,
    started: Instant,
    control: mpsc::UnboundedSender<WorkerControl>,
}

/// Registry of supervised worker processes, keyed by worker id.
pub struct WorkerRegistry {
    settings: SupervisorSettings,
    ledger: Arc<CallLedger>,
    secrets: Arc<dyn SecretSource>,
    client: reqwest::Client,
    entries: Mutex<HashMap<String, WorkerEntry>>,
    next_generation: AtomicU64,
    released: Notify,
}

impl WorkerRegistry {
    pub fn new(
        settings: SupervisorSettings,
        ledger: Arc<CallLedger>,
        secrets: Arc<dyn SecretSource>,
    ) -> Result<Arc<Self>, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(settings.forward_timeout)
            .build()
            .map_err(|e| WorkerError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Arc::new(Self {
            settings,
            ledger,
            secrets,
            client,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            released: Notify::new(),
        }))
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Adopt a process forked elsewhere.
    ///
    /// With `url` the worker is Ready immediately; without it the worker stays
    /// Starting until it sends `ready` on stdout, within the readiness timeout.
    /// A previous registration under the same id is terminated and replaced.
    pub async fn register(
        self: &Arc<Self>,
        worker_id: &str,
        child: Child,
        startup_config: Value,
        script_path: impl AsRef<Path>,
        url: Option<String>,
    ) -> Result<ReadyWait, WorkerError> {
        self.install(
            worker_id,
            child,
            startup_config,
            script_path.as_ref().to_path_buf(),
            url,
            false,
        )
        .await
    }

    /// Fork `script_path` with the inherited environment and wait until it is Ready.
    pub async fn spawn(
        self: &Arc<Self>,
        worker_id: &str,
        script_path: impl AsRef<Path>,
        startup_config: Value,
    ) -> Result<String, WorkerError> {
        let script_path = script_path.as_ref().to_path_buf();
        let child = fork(worker_id, &script_path, None)?;
        self.install(worker_id, child, startup_config, script_path, None, true)
            .await?
            .wait()
            .await
    }

    /// Replace a worker's process with one running under a new environment.
    ///
    /// The environment is `overrides` when non-empty, else the secret store's
    /// `env` container, else the gateway's own. The old worker's calls are
    /// released when its registration goes. Resolves with the new base URL once
    /// the replacement is Ready.
    pub async fn restart_with_env(
        self: &Arc<Self>,
        worker_id: &str,
        overrides: HashMap<String, String>,
    ) -> Result<String, WorkerError> {
        let (generation, control, startup_config, script_path) = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(worker_id)
                .ok_or_else(|| WorkerError::NotFound(worker_id.to_string()))?;
            (
                entry.generation,
                entry.control.clone(),
                entry.startup_config.clone(),
                entry.script_path.clone(),
            )
        };

        let env = self.resolve_env(overrides).await?;
        info!(
            worker_id,
            env_vars = env.as_ref().map(HashMap::len),
            "restarting worker with new environment"
        );

        if control.send(WorkerControl::Terminate).is_err() {
            debug!(worker_id, "old worker monitor already gone");
        }
        sleep(self.settings.restart_grace).await;

        if self.entries.lock().await.remove_if_generation(worker_id, generation) {
            debug!(worker_id, generation, "old registration removed");
            self.ledger.cleanup_for_owner(worker_id).await;
        }

        let child = fork(worker_id, &script_path, env.as_ref())?;
        self.install(worker_id, child, startup_config, script_path, None, true)
            .await?
            .wait()
            .await
    }

    /// Relay an HTTP call to a Ready worker.
    pub async fn forward(
        &self,
        worker_id: &str,
        path: &str,
        method: reqwest::Method,
        body: Option<&Value>,
    ) -> Result<Forwarded, WorkerError> {
        let base_url = self
            .ready_url(worker_id)
            .await
            .ok_or_else(|| WorkerError::NotFound(worker_id.to_string()))?;
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        debug!(worker_id, %url, %method, "forwarding to worker");

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| {
            warn!(worker_id, %url, error = %e, "worker request failed");
            WorkerError::Transport(e.to_string())
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| WorkerError::Transport(e.to_string()))?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(Forwarded { status, body })
    }

    /// Base URL of `worker_id` if it is Ready.
    pub async fn ready_url(&self, worker_id: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        let entry = entries.get(worker_id)?;
        match entry.status {
            WorkerStatus::Ready => entry.base_url.clone(),
            WorkerStatus::Starting => None,
        }
    }

    pub async fn status_of(&self, worker_id: &str) -> Option<WorkerStatus> {
        self.entries.lock().await.get(worker_id).map(|e| e.status)
    }

    /// Snapshot of all registrations for the admin endpoint.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let entries = self.entries.lock().await;
        let mut out: Vec<WorkerSnapshot> = entries
            .iter()
            .map(|(worker_id, entry)| WorkerSnapshot {
                worker_id: worker_id.clone(),
                status: entry.status,
                pid: entry.pid,
                url: entry.base_url.clone(),
                script_path: entry.script_path.display().to_string(),
                registered_at: entry.registered_at,
                uptime_secs: entry.started.elapsed().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    /// Terminate every worker and wait up to `timeout` for them to exit.
    pub async fn shutdown(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        {
            let entries = self.entries.lock().await;
            for (worker_id, entry) in entries.iter() {
                if entry.control.send(WorkerControl::Terminate).is_err() {
                    debug!(worker_id, "worker monitor already gone");
                }
            }
        }

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.entries.lock().await.len();
            if remaining == 0 {
                info!("all workers stopped");
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(remaining, "workers still running at shutdown deadline");
                return;
            }
        }
    }

    async fn resolve_env(
        &self,
        overrides: HashMap<String, String>,
    ) -> Result<Option<HashMap<String, String>>, WorkerError> {
        if !overrides.is_empty() {
            return Ok(Some(overrides));
        }
        self.secrets
            .container(ENV_CONTAINER)
            .await
            .map_err(|e| WorkerError::Secrets(e.to_string()))
    }

    async fn install(
        self: &Arc<Self>,
        worker_id: &str,
        mut child: Child,
        startup_config: Value,
        script_path: PathBuf,
        url: Option<String>,
        send_start: bool,
    ) -> Result<ReadyWait, WorkerError> {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let needs_stdout = url.is_none();
        if (needs_stdout && stdout.is_none()) || (send_start && stdin.is_none()) {
            error!(worker_id, "worker has no IPC channel, killing it");
            if let Err(e) = child.kill().await {
                warn!(worker_id, "kill failed: {e}");
            }
            return Err(WorkerError::MissingStdio(worker_id.to_string()));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let (mut latch, wait) = ReadyLatch::new();
        let status = match &url {
            Some(url) => {
                latch.resolve(Ok(url.clone()));
                WorkerStatus::Ready
            }
            None => WorkerStatus::Starting,
        };
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let replaced = {
            let mut entries = self.entries.lock().await;
            let previous = entries.insert(
                worker_id.to_string(),
                WorkerEntry {
                    generation,
                    status,
                    pid,
                    base_url: url.clone(),
                    startup_config: startup_config.clone(),
                    script_path: script_path.clone(),
                    registered_at: Utc::now(),
                    started: Instant::now(),
                    control: control_tx,
                },
            );
            match previous {
                Some(previous) => {
                    warn!(worker_id, "replacing live registration");
                    let _ = previous.control.send(WorkerControl::Terminate);
                    true
                }
                None => false,
            }
        };
        if replaced {
            self.ledger.cleanup_for_owner(worker_id).await;
        }
        info!(worker_id, ?pid, ?status, script = %script_path.display(), "worker registered");

        let monitor = Monitor {
            worker_id: worker_id.to_string(),
            generation,
            child,
            stdin,
            stdout,
            start: send_start.then(|| SupervisorMessage::Start {
                worker_id: worker_id.to_string(),
                gateway_url: self.settings.gateway_url.clone(),
                config: startup_config,
            }),
            latch,
            control: control_rx,
            ready_timeout: self.settings.ready_timeout,
        };
        tokio::spawn(monitor.run(Arc::clone(self)));
        Ok(wait)
    }

    /// Flip a Starting registration to Ready. False if it was replaced meanwhile.
    async fn mark_ready(&self, worker_id: &str, generation: u64, url: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(worker_id) {
            Some(entry) if entry.generation == generation => {
                entry.status = WorkerStatus::Ready;
                entry.base_url = Some(url.to_string());
                true
            }
            _ => false,
        }
    }

    /// Drop the registration of a departed process and release its calls.
    ///
    /// A process whose registration was already replaced releases nothing; the
    /// replacement released its calls when it removed the registration.
    async fn release(&self, worker_id: &str, generation: u64) -> bool {
        let removed = self
            .entries
            .lock()
            .await
            .remove_if_generation(worker_id, generation);
        self.released.notify_waiters();
        if removed {
            info!(worker_id, "worker deregistered");
            self.ledger.cleanup_for_owner(worker_id).await;
        }
        removed
    }
}

trait EntriesExt {
    fn remove_if_generation(&mut self, worker_id: &str, generation: u64) -> bool;
}

impl EntriesExt for HashMap<String, WorkerEntry> {
    fn remove_if_generation(&mut self, worker_id: &str, generation: u64) -> bool {
        if self.get(worker_id).map(|e| e.generation) == Some(generation) {
            self.remove(worker_id);
            true
        } else {
            false
        }
    }
}

/// Fork a worker with piped stdin/stdout as its IPC channel.
///
/// `env` replaces the inherited environment when given.
fn fork(
    worker_id: &str,
    script_path: &Path,
    env: Option<&HashMap<String, String>>,
) -> Result<Child, WorkerError> {
    let mut command = Command::new(script_path);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if let Some(env) = env {
        command.env_clear().envs(env);
    }
    command.spawn().map_err(|e| {
        error!(worker_id, script = %script_path.display(), "failed to fork worker: {e}");
        WorkerError::Spawn(format!("{}: {e}", script_path.display()))
    })
}
