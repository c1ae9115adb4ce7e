//! Output port: the abstraction the replay engine uses to deliver a step's
//! batched updates to whatever is consuming the replayed feed.

mod console;
mod http;

pub use console::ConsoleSink;
pub use http::HttpSink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OutputError;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SensorUpdate {
    pub id: u64,
    pub value: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StepPayload {
    pub step_id: u64,
    pub step_ts: DateTime<Utc>,
    pub batch_id: u32,
    pub batch_total: u32,
    pub updates: Vec<SensorUpdate>,
}

/// Abstract sink for a replay job's output. A `send` call is expected to
/// either fully deliver the payload or return an error; the engine does not
/// retry and treats the first error as fatal for the job.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn send(&self, payload: &StepPayload) -> Result<(), OutputError>;
}
