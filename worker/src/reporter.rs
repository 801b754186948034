use std::time::Duration;

use serde_json::Value;
use shared_types::{ExpiryTimeWrite, ProgressWrite, ResultWrite};
use tracing::debug;

/// Client for the gateway's internal webhook.
#[derive(Debug, Clone)]
pub struct LedgerReporter {
    client: reqwest::Client,
    base_url: String,
}

impl LedgerReporter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn progress(&self, call_id: &str, progress: Value) -> reqwest::Result<()> {
        self.put(
            "progress",
            &ProgressWrite {
                call_id: Some(call_id.to_string()),
                progress,
            },
        )
        .await
    }

    pub async fn result(&self, call_id: &str, result: Value) -> reqwest::Result<()> {
        self.put(
            "result",
            &ResultWrite {
                call_id: Some(call_id.to_string()),
                result,
            },
        )
        .await
    }

    pub async fn expiry(&self, call_id: &str, ttl: Duration) -> reqwest::Result<()> {
        self.put(
            "expiryTime",
            &ExpiryTimeWrite {
                call_id: Some(call_id.to_string()),
                expiry_time: Some(ttl.as_millis() as u64),
            },
        )
        .await
    }

    async fn put<T: serde::Serialize>(&self, kind: &str, body: &T) -> reqwest::Result<()> {
        let url = format!("{}/internalWebhook/{kind}", self.base_url);
        debug!(%url, "reporting to gateway");
        self.client
            .put(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
