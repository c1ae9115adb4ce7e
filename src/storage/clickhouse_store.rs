use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Client;
use tokio_util::sync::CancellationToken;

use super::{require_sensors, spawn_fan_in, Event, EventStream, RangeInfo, StorageSource, StreamRequest};
use crate::error::StorageError;

#[derive(clickhouse::Row, serde::Deserialize)]
struct HistoryRow {
    sensor_id: u64,
    #[serde(with = "clickhouse::serde::chrono::datetime64::micros")]
    timestamp: DateTime<Utc>,
    value: f64,
}

#[derive(clickhouse::Row, serde::Deserialize)]
struct RangeRow {
    min_ts: Option<i64>,
    max_ts: Option<i64>,
    cnt: u64,
}

/// ClickHouse adapter over `main_history(sensor_id, timestamp, value)`,
/// targeting the same schema shape as the Postgres/SQLite adapters so the
/// engine's assumptions hold uniformly.
pub struct ClickhouseStore {
    client: Client,
}

impl ClickhouseStore {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::default().with_url(url),
        }
    }
}

fn id_list(sensors: &[u64]) -> String {
    sensors
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl StorageSource for ClickhouseStore {
    async fn warmup(
        &self,
        sensors: &[u64],
        from: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError> {
        require_sensors(sensors)?;
        let query = format!(
            "SELECT sensor_id, argMax(timestamp, timestamp) AS timestamp, argMax(value, timestamp) AS value \
             FROM main_history WHERE sensor_id IN ({}) AND timestamp <= {} \
             GROUP BY sensor_id",
            id_list(sensors),
            from.timestamp_micros()
        );
        let rows: Vec<HistoryRow> = self
            .client
            .query(&query)
            .fetch_all()
            .await
            .map_err(StorageError::from)?;
        Ok(rows
            .into_iter()
            .map(|r| Event {
                sensor_id: r.sensor_id,
                ts: r.timestamp,
                value: r.value,
            })
            .collect())
    }

    async fn stream(&self, req: StreamRequest, cancel: CancellationToken) -> EventStream {
        let client = self.client.clone();
        let ids = id_list(&req.sensors);
        let to = req.to;
        let window = req.window;
        let mut cursor = req.from;
        spawn_fan_in(cancel, move || {
            let client = client.clone();
            let ids = ids.clone();
            let chunk_from = cursor;
            let chunk_to = std::cmp::min(chunk_from + window, to);
            let done = chunk_from >= to;
            cursor = chunk_to;
            async move {
                if done {
                    return None;
                }
                let query = format!(
                    "SELECT sensor_id, timestamp, value FROM main_history \
                     WHERE sensor_id IN ({ids}) AND timestamp >= {} AND timestamp < {} \
                     ORDER BY timestamp, sensor_id",
                    chunk_from.timestamp_micros(),
                    chunk_to.timestamp_micros()
                );
                let result: Result<Vec<HistoryRow>, _> = client.query(&query).fetch_all().await;
                match result {
                    Ok(rows) => Some(Ok(rows
                        .into_iter()
                        .map(|r| Event {
                            sensor_id: r.sensor_id,
                            ts: r.timestamp,
                            value: r.value,
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
        let mut conditions = vec![format!("sensor_id IN ({})", id_list(sensors))];
        if let Some(from) = from {
            conditions.push(format!("timestamp >= {}", from.timestamp_micros()));
        }
        if let Some(to) = to {
            conditions.push(format!("timestamp <= {}", to.timestamp_micros()));
        }
        let query = format!(
            "SELECT toInt64(min(timestamp)) AS min_ts, toInt64(max(timestamp)) AS max_ts, \
                    uniqExact(sensor_id) AS cnt \
             FROM main_history WHERE {}",
            conditions.join(" AND ")
        );
        let row: RangeRow = self
            .client
            .query(&query)
            .fetch_one()
            .await
            .map_err(StorageError::from)?;
        Ok(RangeInfo {
            min_ts: row.min_ts.and_then(DateTime::from_timestamp_micros),
            max_ts: row.max_ts.and_then(DateTime::from_timestamp_micros),
            distinct_sensor_count: row.cnt,
        })
    }
}
