//! Per-process monitor task.
//!
//! One task owns each worker's `Child`. It drives the readiness handshake, relays
//! worker output to the log, enforces the readiness deadline, delivers termination
//! signals, and releases the registration when the process goes away.

use std::{future::Future, sync::Arc, time::Duration};

use shared_types::{SupervisorMessage, WorkerMessage};
use tokio::{
    process::{Child, ChildStdin, ChildStdout},
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use super::{
    ipc::{Inbound, IpcReader, IpcWriter},
    WorkerError, WorkerRegistry,
};

/// A worker that ignores SIGTERM this long is killed outright.
const TERMINATE_ESCALATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WorkerControl {
    /// Ask the process to exit (SIGTERM), escalating to SIGKILL
    Terminate,
}

/// Resolves once a freshly registered worker becomes Ready or fails to.
pub struct ReadyWait {
    rx: oneshot::Receiver<Result<String, WorkerError>>,
}

impl ReadyWait {
    /// The worker's base URL, or why it never became Ready.
    pub async fn wait(self) -> Result<String, WorkerError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(WorkerError::Ipc(
                "worker monitor stopped before readiness was decided".to_string(),
            ))
        })
    }
}

/// Accepts only the first readiness transition; later ones are no-ops.
pub(super) struct ReadyLatch {
    tx: Option<oneshot::Sender<Result<String, WorkerError>>>,
}

impl ReadyLatch {
    pub(super) fn new() -> (Self, ReadyWait) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, ReadyWait { rx })
    }

    pub(super) fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Returns false when the outcome was already decided.
    pub(super) fn resolve(&mut self, outcome: Result<String, WorkerError>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

pub(super) struct Monitor {
    pub(super) worker_id: String,
    pub(super) generation: u64,
    pub(super) child: Child,
    pub(super) stdin: Option<ChildStdin>,
    pub(super) stdout: Option<ChildStdout>,
    pub(super) start: Option<SupervisorMessage>,
    pub(super) latch: ReadyLatch,
    pub(super) control: mpsc::UnboundedReceiver<WorkerControl>,
    pub(super) ready_timeout: Duration,
}

enum Flow {
    Continue,
    Stop,
}

impl Monitor {
    pub(super) async fn run(mut self, registry: Arc<WorkerRegistry>) {
        let mut writer = self.stdin.take().map(IpcWriter::new);
        let mut reader = self.stdout.take().map(IpcReader::new);

        if let Some(start) = self.start.take() {
            let sent = match writer.as_mut() {
                Some(w) => w.send(&start).await,
                None => Err(WorkerError::MissingStdio(self.worker_id.clone())),
            };
            if let Err(e) = sent {
                error!(worker_id = %self.worker_id, "failed to send start message: {e}");
                self.latch.resolve(Err(e));
                self.kill_and_release(&registry).await;
                return;
            }
            debug!(worker_id = %self.worker_id, "start message sent");
        }

        let mut ready_deadline = self
            .latch
            .is_open()
            .then(|| Instant::now() + self.ready_timeout);
        let mut kill_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                status = self.child.wait() => {
                    let status = match status {
                        Ok(s) => s.to_string(),
                        Err(e) => format!("wait failed: {e}"),
                    };
                    if kill_deadline.is_some() {
                        info!(worker_id = %self.worker_id, %status, "worker exited after termination");
                    } else {
                        warn!(worker_id = %self.worker_id, %status, "worker exited");
                    }
                    self.latch.resolve(Err(WorkerError::Exited(status)));
                    registry.release(&self.worker_id, self.generation).await;
                    return;
                }
                Some(control) = self.control.recv() => match control {
                    WorkerControl::Terminate => {
                        self.terminate();
                        kill_deadline.get_or_insert(Instant::now() + TERMINATE_ESCALATION);
                        ready_deadline = None;
                        self.latch.resolve(Err(WorkerError::Exited(
                            "terminated before ready".to_string(),
                        )));
                    }
                },
                line = next_inbound(&mut reader) => match line {
                    Some(Ok(inbound)) => {
                        if let Flow::Stop = self.on_inbound(inbound, &registry, &mut ready_deadline).await {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(worker_id = %self.worker_id, "dropping worker IPC channel: {e}");
                        reader = None;
                    }
                    None => {
                        debug!(worker_id = %self.worker_id, "worker closed stdout");
                        reader = None;
                    }
                },
                _ = sleep_until_opt(ready_deadline) => {
                    warn!(
                        worker_id = %self.worker_id,
                        timeout_ms = self.ready_timeout.as_millis() as u64,
                        "worker not ready in time, killing it"
                    );
                    self.latch.resolve(Err(WorkerError::ReadyTimeout {
                        worker_id: self.worker_id.clone(),
                        timeout: self.ready_timeout,
                    }));
                    self.kill_and_release(&registry).await;
                    return;
                }
                _ = sleep_until_opt(kill_deadline) => {
                    warn!(worker_id = %self.worker_id, "worker ignored SIGTERM, killing it");
                    kill_deadline = None;
                    if let Err(e) = self.child.start_kill() {
                        error!(worker_id = %self.worker_id, "failed to kill worker: {e}");
                    }
                }
            }
        }
    }

    async fn on_inbound(
        &mut self,
        inbound: Inbound,
        registry: &Arc<WorkerRegistry>,
        ready_deadline: &mut Option<Instant>,
    ) -> Flow {
        match inbound {
            Inbound::Output(line) => {
                debug!(worker_id = %self.worker_id, "{line}");
                Flow::Continue
            }
            Inbound::Message(WorkerMessage::Ready { url }) => {
                if !self.latch.is_open() {
                    debug!(worker_id = %self.worker_id, %url, "ignoring repeated ready message");
                    return Flow::Continue;
                }
                if let Err(e) = url::Url::parse(&url) {
                    let reason = format!("invalid ready url {url:?}: {e}");
                    error!(worker_id = %self.worker_id, "{reason}");
                    self.latch.resolve(Err(WorkerError::Rejected(reason)));
                    self.kill_and_release(registry).await;
                    return Flow::Stop;
                }
                if registry.mark_ready(&self.worker_id, self.generation, &url).await {
                    info!(worker_id = %self.worker_id, %url, "worker ready");
                    *ready_deadline = None;
                    self.latch.resolve(Ok(url));
                } else {
                    debug!(worker_id = %self.worker_id, "ready message from a replaced worker");
                }
                Flow::Continue
            }
            Inbound::Message(WorkerMessage::Error { message }) => {
                if !self.latch.is_open() {
                    warn!(worker_id = %self.worker_id, %message, "worker reported an error after startup");
                    return Flow::Continue;
                }
                error!(worker_id = %self.worker_id, %message, "worker failed to start");
                self.latch.resolve(Err(WorkerError::Rejected(message)));
                self.kill_and_release(registry).await;
                Flow::Stop
            }
        }
    }

    /// SIGTERM on unix; hard kill elsewhere or when signalling fails.
    fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            match sigterm(pid) {
                Ok(()) => {
                    info!(worker_id = %self.worker_id, pid, "sent SIGTERM to worker");
                    return;
                }
                Err(e) => warn!(worker_id = %self.worker_id, pid, "SIGTERM failed: {e}"),
            }
        }
        if let Err(e) = self.child.start_kill() {
            error!(worker_id = %self.worker_id, "failed to kill worker: {e}");
        }
    }

    async fn kill_and_release(&mut self, registry: &Arc<WorkerRegistry>) {
        if let Err(e) = self.child.kill().await {
            warn!(worker_id = %self.worker_id, "kill failed: {e}");
        }
        registry.release(&self.worker_id, self.generation).await;
    }
}

/// Send SIGTERM to `pid`.
///
/// Only called with the pid of a `Child` that has not been reaped yet
/// (`Child::id` returns `None` afterwards), so the pid cannot have been reused.
#[cfg(unix)]
fn sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes no pointers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

async fn next_inbound(
    reader: &mut Option<IpcReader<ChildStdout>>,
) -> Option<Result<Inbound, tokio_util::codec::LinesCodecError>> {
    match reader {
        Some(r) => r.next().await,
        None => std::future::pending().await,
    }
}

fn sleep_until_opt(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latch_keeps_first_outcome() {
        let (mut latch, wait) = ReadyLatch::new();
        assert!(latch.is_open());
        assert!(latch.resolve(Ok("http://127.0.0.1:1".to_string())));
        assert!(!latch.resolve(Err(WorkerError::Rejected("late".to_string()))));
        assert!(!latch.is_open());
        assert_eq!(wait.wait().await.unwrap(), "http://127.0.0.1:1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_stops_child() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        sigterm(child.id().unwrap()).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_dropped_latch_fails_the_waiter() {
        let (latch, wait) = ReadyLatch::new();
        drop(latch);
        assert!(matches!(wait.wait().await, Err(WorkerError::Ipc(_))));
    }
}
