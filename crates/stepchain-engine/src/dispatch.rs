use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info};

use stepchain_core::error::{Result, StepchainError};
use stepchain_core::traits::StepDispatcher;
use stepchain_core::types::RunId;

/// Reaches the next step over HTTP, as a brand new invocation.
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PingReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    timestamp: Option<String>,
}

impl HttpDispatcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepchainError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn step_url(&self, step: u32) -> String {
        format!("{}/api/chained/{}", self.base_url, step)
    }

    pub fn ping_url(&self) -> String {
        format!("{}/api/ping", self.base_url)
    }
}

impl StepDispatcher for HttpDispatcher {
    fn dispatch_step(&self, run_id: &RunId, step: u32) -> BoxFuture<'_, Result<()>> {
        let url = self.step_url(step);
        let body = serde_json::json!({ "runId": run_id });
        let run_id = run_id.clone();

        Box::pin(async move {
            debug!(run_id = %run_id, step, url = %url, "Dispatching step");
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| StepchainError::Dispatch {
                    step,
                    status: None,
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(StepchainError::Dispatch {
                    step,
                    status: Some(status.as_u16()),
                    message: text,
                });
            }
            Ok(())
        })
    }

    fn ping(&self, source: &str) -> BoxFuture<'_, Result<()>> {
        let url = self.ping_url();
        let source = source.to_string();

        Box::pin(async move {
            let reply: PingReply = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "source": source }))
                .send()
                .await
                .map_err(|e| StepchainError::Executor(format!("ping failed: {}", e)))?
                .json()
                .await
                .map_err(|e| StepchainError::Executor(format!("ping reply unreadable: {}", e)))?;
            info!(source = %source, ok = reply.ok, timestamp = ?reply.timestamp, "Ping acknowledged");
            Ok(())
        })
    }
}
