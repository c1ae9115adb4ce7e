use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;

use super::{require_sensors, spawn_fan_in, Event, EventStream, RangeInfo, StorageSource, StreamRequest};
use crate::error::StorageError;

/// Same `main_history` schema assumption as the Postgres adapter, over a
/// lazily-connected SQLite pool (used for small local archives or tests).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl StorageSource for SqliteStore {
    async fn warmup(
        &self,
        sensors: &[u64],
        from: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError> {
        require_sensors(sensors)?;
        let sql = format!(
            "SELECT sensor_id, timestamp, value FROM main_history \
             WHERE sensor_id IN ({}) AND timestamp <= ? \
             ORDER BY sensor_id, timestamp DESC",
            placeholders(sensors.len())
        );
        let mut query = sqlx::query(&sql);
        for &id in sensors {
            query = query.bind(id as i64);
        }
        query = query.bind(from);
        let rows = query.fetch_all(&self.pool).await?;

        let mut latest: std::collections::HashMap<u64, Event> = std::collections::HashMap::new();
        for row in rows {
            let event = Event {
                sensor_id: row.get::<i64, _>("sensor_id") as u64,
                ts: row.get("timestamp"),
                value: row.get("value"),
            };
            latest.entry(event.sensor_id).or_insert(event);
        }
        Ok(latest.into_values().collect())
    }

    async fn stream(&self, req: StreamRequest, cancel: CancellationToken) -> EventStream {
        let pool = self.pool.clone();
        let sensors = req.sensors.clone();
        let to = req.to;
        let window = req.window;
        let mut cursor = req.from;
        spawn_fan_in(cancel, move || {
            let pool = pool.clone();
            let sensors = sensors.clone();
            let chunk_from = cursor;
            let chunk_to = std::cmp::min(chunk_from + window, to);
            let done = chunk_from >= to;
            cursor = chunk_to;
            async move {
                if done {
                    return None;
                }
                let sql = format!(
                    "SELECT sensor_id, timestamp, value FROM main_history \
                     WHERE sensor_id IN ({}) AND timestamp >= ? AND timestamp < ? \
                     ORDER BY timestamp, sensor_id",
                    placeholders(sensors.len())
                );
                let mut query = sqlx::query(&sql);
                for &id in &sensors {
                    query = query.bind(id as i64);
                }
                query = query.bind(chunk_from).bind(chunk_to);
                match query.fetch_all(&pool).await {
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
        let sql = format!(
            "SELECT MIN(timestamp) AS min_ts, MAX(timestamp) AS max_ts, \
                    COUNT(DISTINCT sensor_id) AS cnt \
             FROM main_history \
             WHERE sensor_id IN ({}) \
               AND (? IS NULL OR timestamp >= ?) \
               AND (? IS NULL OR timestamp <= ?)",
            placeholders(sensors.len())
        );
        let mut query = sqlx::query(&sql);
        for &id in sensors {
            query = query.bind(id as i64);
        }
        query = query.bind(from).bind(from).bind(to).bind(to);
        let row = query.fetch_one(&self.pool).await?;
        Ok(RangeInfo {
            min_ts: row.get("min_ts"),
            max_ts: row.get("max_ts"),
            distinct_sensor_count: row.get::<i64, _>("cnt") as u64,
        })
    }
}
