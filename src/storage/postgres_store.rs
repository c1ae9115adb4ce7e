use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use super::{require_sensors, spawn_fan_in, Event, EventStream, RangeInfo, StorageSource, StreamRequest};
use crate::error::StorageError;

/// Reads archived history from `main_history(sensor_id, timestamp, value)`
/// over a lazily-connected Postgres pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageSource for PostgresStore {
    async fn warmup(
        &self,
        sensors: &[u64],
        from: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError> {
        require_sensors(sensors)?;
        let ids: Vec<i64> = sensors.iter().map(|&id| id as i64).collect();
        let rows = sqlx::query(
            "SELECT DISTINCT ON (sensor_id) sensor_id, timestamp, value \
             FROM main_history \
             WHERE sensor_id = ANY($1) AND timestamp <= $2 \
             ORDER BY sensor_id, timestamp DESC",
        )
        .bind(&ids)
        .bind(from)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Event {
                sensor_id: row.get::<i64, _>("sensor_id") as u64,
                ts: row.get("timestamp"),
                value: row.get("value"),
            })
            .collect())
    }

    async fn stream(&self, req: StreamRequest, cancel: CancellationToken) -> EventStream {
        let pool = self.pool.clone();
        let ids: Vec<i64> = req.sensors.iter().map(|&id| id as u64 as i64).collect();
        let to = req.to;
        let window = req.window;
        let mut cursor = req.from;
        spawn_fan_in(cancel, move || {
            let pool = pool.clone();
            let ids = ids.clone();
            let chunk_from = cursor;
            let chunk_to = std::cmp::min(chunk_from + window, to);
            let done = chunk_from >= to;
            cursor = chunk_to;
            async move {
                if done {
                    return None;
                }
                let result = sqlx::query(
                    "SELECT sensor_id, timestamp, value FROM main_history \
                     WHERE sensor_id = ANY($1) AND timestamp >= $2 AND timestamp < $3 \
                     ORDER BY timestamp, sensor_id",
                )
                .bind(&ids)
                .bind(chunk_from)
                .bind(chunk_to)
                .fetch_all(&pool)
                .await;
                match result {
                    Ok(rows) => Some(Ok(rows
                        .into_iter()
                        .map(|row| Event {
                            sensor_id: row.get::<i64, _>("sensor_id") as u64,
                            ts: row.get("timestamp"),
                            value: row.get("value"),
                        })
                        .collect())),
                    Err(err) => Some(Err(StorageError::from(err))),
                }
            }
        })
    }

    async fn range(
        &self,
        sensors: &[u64],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<RangeInfo, StorageError> {
        require_sensors(sensors)?;
        let ids: Vec<i64> = sensors.iter().map(|&id| id as i64).collect();
        let row = sqlx::query(
            "SELECT MIN(timestamp) AS min_ts, MAX(timestamp) AS max_ts, \
                    COUNT(DISTINCT sensor_id) AS cnt \
             FROM main_history \
             WHERE sensor_id = ANY($1) \
               AND ($2::timestamptz IS NULL OR timestamp >= $2) \
               AND ($3::timestamptz IS NULL OR timestamp <= $3)",
        )
        .bind(&ids)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(RangeInfo {
            min_ts: row.get("min_ts"),
            max_ts: row.get("max_ts"),
            distinct_sensor_count: row.get::<i64, _>("cnt") as u64,
        })
    }
}
