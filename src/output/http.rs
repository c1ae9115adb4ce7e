use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{OutputSink, StepPayload};
use crate::error::OutputError;

/// Delivers a step's updates to an external shared-memory-like service via
/// `POST {base_url}/set`, one request per batch, encoding sensors by id.
pub struct HttpSink {
    client: Client,
    base_url: String,
    supplier: String,
}

impl HttpSink {
    pub fn new(client: Client, base_url: impl Into<String>, supplier: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            supplier: supplier.into(),
        }
    }
}

#[async_trait]
impl OutputSink for HttpSink {
    async fn send(&self, payload: &StepPayload) -> Result<(), OutputError> {
        let url = format!("{}/set", self.base_url.trim_end_matches('/'));
        let body = json!({
            "supplier": self.supplier,
            "step_id": payload.step_id,
            "step_ts": payload.step_ts.to_rfc3339(),
            "updates": payload.updates,
        });
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(OutputError::Transport(format!(
                "shared-memory service returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
