//! Storage port: the abstraction the replay engine uses to read archived
//! sensor history, independent of the backing database.

mod clickhouse_store;
mod memory;
mod postgres_store;
mod sqlite_store;

pub use clickhouse_store::ClickhouseStore;
pub use memory::MemoryStore;
pub use postgres_store::PostgresStore;
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;

/// A single archived reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub sensor_id: u64,
    pub ts: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub sensors: Vec<u64>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub window: chrono::Duration,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RangeInfo {
    pub min_ts: Option<DateTime<Utc>>,
    pub max_ts: Option<DateTime<Utc>>,
    pub distinct_sensor_count: u64,
}

/// A chunked, cancellable stream of archive events, fed into a bounded channel
/// by a dedicated producer task so the engine never blocks on the database.
pub struct EventStream {
    pub rx: mpsc::Receiver<Result<Vec<Event>, StorageError>>,
}

const STREAM_CHANNEL_CAPACITY: usize = 1024;

/// Abstract history source. Implementations must preserve the half-open
/// interval `[from, to)` for `stream` and the inclusive upper bound for
/// `warmup`, and must not interleave events out of `(ts, sensor_id)` order
/// within a single chunk.
#[async_trait]
pub trait StorageSource: Send + Sync {
    async fn warmup(
        &self,
        sensors: &[u64],
        from: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError>;

    async fn stream(&self, req: StreamRequest, cancel: CancellationToken) -> EventStream;

    async fn range(
        &self,
        sensors: &[u64],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<RangeInfo, StorageError>;
}

pub(crate) fn require_sensors(sensors: &[u64]) -> Result<(), StorageError> {
    if sensors.is_empty() {
        return Err(StorageError::EmptySensorSet);
    }
    Ok(())
}

/// Spawns a task that pulls time-windowed chunks from `next_chunk` and forwards
/// them into a bounded channel, terminating on cancellation or stream end.
/// Shared by every adapter so chunking/backpressure behavior stays uniform.
pub(crate) fn spawn_fan_in<F, Fut>(cancel: CancellationToken, mut next_chunk: F) -> EventStream
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Option<Result<Vec<Event>, StorageError>>> + Send,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = next_chunk() => {
                    match chunk {
                        Some(item) => {
                            let is_err = item.is_err();
                            if tx.send(item).await.is_err() {
                                break;
                            }
                            if is_err {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });
    EventStream { rx }
}
