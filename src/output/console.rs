use async_trait::async_trait;

use super::{OutputSink, StepPayload};
use crate::error::OutputError;

/// Writes one structured log line per batch. The default sink, used for
/// local debugging and for `--output stdout`.
#[derive(Debug, Default)]
pub struct ConsoleSink;

#[async_trait]
impl OutputSink for ConsoleSink {
    async fn send(&self, payload: &StepPayload) -> Result<(), OutputError> {
        tracing::info!(
            step_id = payload.step_id,
            step_ts = %payload.step_ts,
            batch = format!("{}/{}", payload.batch_id, payload.batch_total),
            updates = payload.updates.len(),
            "step payload"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn never_fails() {
        let sink = ConsoleSink;
        let payload = StepPayload {
            step_id: 1,
            step_ts: Utc::now(),
            batch_id: 1,
            batch_total: 1,
            updates: vec![],
        };
        assert!(sink.send(&payload).await.is_ok());
    }
}
