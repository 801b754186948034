//! Echo worker: `echo` answers inline, `countdown` reports progress through
//! the gateway ledger before posting its result.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use shared_types::CommandEnvelope;
use tracing::warn;
use worker::{CallContext, Outcome, Plugin};

struct Echo;

#[async_trait]
impl Plugin for Echo {
    async fn execute(&self, command: CommandEnvelope, ctx: CallContext) -> Result<Outcome, String> {
        match command.name.as_str() {
            "echo" => Ok(Outcome::Done(json!({
                "forWhom": command.for_whom,
                "args": command.args,
            }))),
            "countdown" => {
                let reporter = ctx
                    .reporter()
                    .cloned()
                    .ok_or_else(|| "countdown needs gatewayUrl or GATEWAY_URL".to_string())?;
                let steps = command.args.get("steps").and_then(Value::as_u64).unwrap_or(3);
                let call_id = ctx.new_call_id();

                let id = call_id.clone();
                tokio::spawn(async move {
                    for remaining in (1..=steps).rev() {
                        if let Err(e) = reporter.progress(&id, json!({ "remaining": remaining })).await {
                            warn!(call_id = %id, "progress report failed: {e}");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    if let Err(e) = reporter.result(&id, json!({ "done": true })).await {
                        warn!(call_id = %id, "result report failed: {e}");
                    }
                });
                Ok(Outcome::Deferred { call_id })
            }
            other => Err(format!("unknown command {other}")),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout carries the control protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker=info,echo_worker=info".into()),
        )
        .init();

    worker::serve(Echo).await?;
    Ok(())
}
