use std::{future::Future, sync::Arc};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared_types::{CommandEnvelope, CommandReply, SupervisorMessage, WorkerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info};

use crate::{
    plugin::{CallContext, Outcome, Plugin},
    reporter::LedgerReporter,
};

#[derive(Debug, thiserror::Error)]
pub enum WorkerRuntimeError {
    #[error("control channel closed before start")]
    NoStart,

    #[error("unexpected control message: {0}")]
    Protocol(String),

    #[error("control channel failed: {0}")]
    Channel(String),

    #[error("plugin failed to start: {0}")]
    Start(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct Runtime<P> {
    plugin: P,
    ctx: CallContext,
}

/// Run `plugin` as a gateway worker over this process's stdin/stdout.
pub async fn serve<P: Plugin>(plugin: P) -> Result<(), WorkerRuntimeError> {
    serve_with_io(
        plugin,
        tokio::io::stdin(),
        tokio::io::stdout(),
        terminate_signal(),
    )
    .await
}

/// Run `plugin` over an arbitrary control channel until `shutdown` resolves or
/// the gateway closes the channel.
pub async fn serve_with_io<P, R, W, F>(
    plugin: P,
    control_in: R,
    control_out: W,
    shutdown: F,
) -> Result<(), WorkerRuntimeError>
where
    P: Plugin,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()> + Send + 'static,
{
    let mut reader = FramedRead::new(control_in, LinesCodec::new());
    let mut writer = FramedWrite::new(control_out, LinesCodec::new());

    let (worker_id, gateway_url, config) = loop {
        let line = reader
            .next()
            .await
            .ok_or(WorkerRuntimeError::NoStart)?
            .map_err(|e| WorkerRuntimeError::Channel(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SupervisorMessage>(&line) {
            Ok(SupervisorMessage::Start {
                worker_id,
                gateway_url,
                config,
            }) => break (worker_id, gateway_url, config),
            Err(e) => return Err(WorkerRuntimeError::Protocol(format!("{line}: {e}"))),
        }
    };
    debug!("start message received");

    if let Err(message) = plugin.start(&config).await {
        error!(%message, "plugin start failed");
        send(&mut writer, &WorkerMessage::Error { message: message.clone() }).await?;
        return Err(WorkerRuntimeError::Start(message));
    }

    let host = config
        .get("bindHost")
        .and_then(Value::as_str)
        .unwrap_or("127.0.0.1")
        .to_string();
    let listener = match tokio::net::TcpListener::bind((host.as_str(), 0)).await {
        Ok(l) => l,
        Err(e) => {
            send(
                &mut writer,
                &WorkerMessage::Error {
                    message: format!("failed to bind {host}: {e}"),
                },
            )
            .await?;
            return Err(e.into());
        }
    };
    let url = format!("http://{}", listener.local_addr()?);

    // The start message wins; config keys cover workers launched by hand.
    let worker_id = Some(worker_id)
        .filter(|id| !id.is_empty())
        .or_else(|| config_str(&config, "workerId"));
    let reporter = gateway_url
        .or_else(|| config_str(&config, "gatewayUrl"))
        .or_else(|| std::env::var("GATEWAY_URL").ok())
        .map(LedgerReporter::new);
    let runtime = Arc::new(Runtime {
        plugin,
        ctx: CallContext::new(worker_id, reporter),
    });

    let app = Router::new()
        .route("/executeCommand", post(execute_command::<P>))
        .route("/ready", get(ready))
        .with_state(runtime);

    send(&mut writer, &WorkerMessage::Ready { url: url.clone() }).await?;
    info!(%url, "worker ready");

    // The gateway holds our stdin open for as long as it supervises us.
    let control_closed = async move { while reader.next().await.is_some() {} };
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown => info!("shutdown requested"),
                _ = control_closed => info!("control channel closed"),
            }
        })
        .await?;
    Ok(())
}

fn config_str(config: &Value, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut FramedWrite<W, LinesCodec>,
    message: &WorkerMessage,
) -> Result<(), WorkerRuntimeError> {
    let line =
        serde_json::to_string(message).map_err(|e| WorkerRuntimeError::Channel(e.to_string()))?;
    writer
        .send(line)
        .await
        .map_err(|e| WorkerRuntimeError::Channel(e.to_string()))
}

/// POST /executeCommand
async fn execute_command<P: Plugin>(
    State(runtime): State<Arc<Runtime<P>>>,
    Json(command): Json<CommandEnvelope>,
) -> Json<CommandReply> {
    let name = command.name.clone();
    let reply = match runtime.plugin.execute(command, runtime.ctx.clone()).await {
        Ok(Outcome::Done(result)) => CommandReply::ok(result),
        Ok(Outcome::Deferred { call_id }) => CommandReply {
            status_code: 202,
            result: Some(json!({ "callId": call_id })),
            err: None,
        },
        Err(err) => {
            error!(command = %name, %err, "command failed");
            CommandReply::failed(500, err)
        }
    };
    Json(reply)
}

/// GET /ready
async fn ready() -> Json<Value> {
    Json(json!({ "ready": true }))
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Upper;

    #[async_trait]
    impl Plugin for Upper {
        async fn start(&self, config: &Value) -> Result<(), String> {
            if config.get("fail").is_some() {
                return Err("bad config".to_string());
            }
            Ok(())
        }

        async fn execute(
            &self,
            command: CommandEnvelope,
            ctx: CallContext,
        ) -> Result<Outcome, String> {
            match command.name.as_str() {
                "upper" => Ok(Outcome::Done(json!(command
                    .args
                    .as_str()
                    .unwrap_or_default()
                    .to_uppercase()))),
                "later" => Ok(Outcome::Deferred {
                    call_id: ctx.new_call_id(),
                }),
                "context" => Ok(Outcome::Done(json!({
                    "workerId": ctx.worker_id(),
                    "reporting": ctx.reporter().is_some(),
                }))),
                other => Err(format!("unknown command {other}")),
            }
        }
    }

    async fn read_message<R: AsyncRead + Unpin>(lines: &mut BufReader<R>) -> WorkerMessage {
        let mut line = String::new();
        lines.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_then_commands() {
        let (mut to_worker, worker_in) = tokio::io::duplex(4096);
        let (worker_out, from_worker) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_with_io(
            Upper,
            worker_in,
            worker_out,
            std::future::pending(),
        ));

        to_worker
            .write_all(b"{\"type\":\"start\",\"workerId\":\"text\",\"config\":{}}\n")
            .await
            .unwrap();
        let mut from_worker = BufReader::new(from_worker);
        let WorkerMessage::Ready { url } = read_message(&mut from_worker).await else {
            panic!("expected ready");
        };

        let client = reqwest::Client::new();
        let reply: CommandReply = client
            .post(format!("{url}/executeCommand"))
            .json(&json!({"name": "upper", "pluginName": "text", "args": "hi"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reply, CommandReply::ok(json!("HI")));

        let deferred: CommandReply = client
            .post(format!("{url}/executeCommand"))
            .json(&json!({"name": "later", "pluginName": "text"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(deferred.status_code, 202);
        let call_id = deferred.result.unwrap()["callId"].as_str().unwrap().to_string();
        assert!(call_id.starts_with("text:"));

        let failed: CommandReply = client
            .post(format!("{url}/executeCommand"))
            .json(&json!({"name": "nope", "pluginName": "text"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(failed.err.as_deref(), Some("unknown command nope"));

        let ready: Value = client
            .get(format!("{url}/ready"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ready["ready"], true);

        // Closing the control channel stops the worker.
        drop(client);
        drop(to_worker);
        task.await.unwrap().unwrap();
    }

    async fn context_after_start(start: &str) -> Value {
        let (mut to_worker, worker_in) = tokio::io::duplex(4096);
        let (worker_out, from_worker) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_with_io(
            Upper,
            worker_in,
            worker_out,
            std::future::pending(),
        ));

        to_worker.write_all(start.as_bytes()).await.unwrap();
        let mut from_worker = BufReader::new(from_worker);
        let WorkerMessage::Ready { url } = read_message(&mut from_worker).await else {
            panic!("expected ready");
        };

        let client = reqwest::Client::new();
        let reply: CommandReply = client
            .post(format!("{url}/executeCommand"))
            .json(&json!({"name": "context", "pluginName": "text"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        drop(client);
        drop(to_worker);
        task.await.unwrap().unwrap();
        reply.result.unwrap()
    }

    #[tokio::test]
    async fn test_start_message_supplies_identity() {
        let context = context_after_start(
            "{\"type\":\"start\",\"workerId\":\"images\",\"gatewayUrl\":\"http://127.0.0.1:4005\",\"config\":{\"workerId\":\"ignored\"}}\n",
        )
        .await;
        assert_eq!(context["workerId"], "images");
        assert_eq!(context["reporting"], true);
    }

    #[tokio::test]
    async fn test_config_identity_when_start_has_none() {
        let context = context_after_start(
            "{\"type\":\"start\",\"config\":{\"workerId\":\"manual\",\"gatewayUrl\":\"http://127.0.0.1:4005\"}}\n",
        )
        .await;
        assert_eq!(context["workerId"], "manual");
        assert_eq!(context["reporting"], true);
    }

    #[tokio::test]
    async fn test_start_failure_reports_error() {
        let (mut to_worker, worker_in) = tokio::io::duplex(4096);
        let (worker_out, from_worker) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_with_io(
            Upper,
            worker_in,
            worker_out,
            std::future::pending(),
        ));

        to_worker
            .write_all(b"{\"type\":\"start\",\"config\":{\"fail\":true}}\n")
            .await
            .unwrap();
        let mut from_worker = BufReader::new(from_worker);
        assert_eq!(
            read_message(&mut from_worker).await,
            WorkerMessage::Error {
                message: "bad config".to_string()
            }
        );
        assert!(matches!(
            task.await.unwrap(),
            Err(WorkerRuntimeError::Start(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_before_start() {
        let (to_worker, worker_in) = tokio::io::duplex(64);
        let (worker_out, _from_worker) = tokio::io::duplex(64);
        drop(to_worker);

        let result = serve_with_io(Upper, worker_in, worker_out, std::future::pending()).await;
        assert!(matches!(result, Err(WorkerRuntimeError::NoStart)));
    }
}
