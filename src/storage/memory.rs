use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{require_sensors, spawn_fan_in, Event, EventStream, RangeInfo, StorageSource, StreamRequest};
use crate::error::StorageError;

/// An in-memory archive backing the in-process test suite and the `--db
/// memory` CLI option. Events are kept sorted by `(ts, sensor_id)` at
/// construction time so stream chunking never has to re-sort.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    events: Arc<Vec<Event>>,
}

impl MemoryStore {
    pub fn new(mut events: Vec<Event>) -> Self {
        events.sort_by(|a, b| a.ts.cmp(&b.ts).then(a.sensor_id.cmp(&b.sensor_id)));
        Self {
            events: Arc::new(events),
        }
    }
}

#[async_trait]
impl StorageSource for MemoryStore {
    async fn warmup(
        &self,
        sensors: &[u64],
        from: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError> {
        require_sensors(sensors)?;
        let mut latest: std::collections::HashMap<u64, Event> = std::collections::HashMap::new();
        for event in self.events.iter() {
            if event.ts > from || !sensors.contains(&event.sensor_id) {
                continue;
            }
            latest
                .entry(event.sensor_id)
                .and_modify(|cur| {
                    if event.ts >= cur.ts {
                        *cur = *event;
                    }
                })
                .or_insert(*event);
        }
        Ok(latest.into_values().collect())
    }

    async fn stream(&self, req: StreamRequest, cancel: CancellationToken) -> EventStream {
        let events = self.events.clone();
        let sensors: std::collections::HashSet<u64> = req.sensors.into_iter().collect();
        let from = req.from;
        let to = req.to;
        let window = req.window;
        let mut cursor = from;
        spawn_fan_in(cancel, move || {
            let events = events.clone();
            let sensors = sensors.clone();
            let chunk_from = cursor;
            let chunk_to = std::cmp::min(chunk_from + window, to);
            cursor = chunk_to;
            let done = chunk_from >= to;
            async move {
                if done {
                    return None;
                }
                let chunk: Vec<Event> = events
                    .iter()
                    .filter(|e| {
                        e.ts >= chunk_from && e.ts < chunk_to && sensors.contains(&e.sensor_id)
                    })
                    .copied()
                    .collect();
                Some(Ok(chunk))
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
        let mut min_ts = None;
        let mut max_ts = None;
        let mut seen = std::collections::HashSet::new();
        for event in self.events.iter() {
            if !sensors.contains(&event.sensor_id) {
                continue;
            }
            if let Some(from) = from {
                if event.ts < from {
                    continue;
                }
            }
            if let Some(to) = to {
                if event.ts > to {
                    continue;
                }
            }
            seen.insert(event.sensor_id);
            min_ts = Some(min_ts.map_or(event.ts, |m: DateTime<Utc>| m.min(event.ts)));
            max_ts = Some(max_ts.map_or(event.ts, |m: DateTime<Utc>| m.max(event.ts)));
        }
        Ok(RangeInfo {
            min_ts,
            max_ts,
            distinct_sensor_count: seen.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_stream::wrappers::ReceiverStream;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn sample_store() -> MemoryStore {
        MemoryStore::new(vec![
            Event { sensor_id: 1, ts: ts(0), value: 10.0 },
            Event { sensor_id: 2, ts: ts(0), value: 20.0 },
            Event { sensor_id: 1, ts: ts(2), value: 11.0 },
            Event { sensor_id: 2, ts: ts(5), value: 22.0 },
        ])
    }

    #[tokio::test]
    async fn warmup_returns_latest_value_at_or_before_from() {
        let store = sample_store();
        let events = store.warmup(&[1, 2], ts(3)).await.unwrap();
        assert_eq!(events.len(), 2);
        let s1 = events.iter().find(|e| e.sensor_id == 1).unwrap();
        assert_eq!(s1.value, 11.0);
    }

    #[tokio::test]
    async fn warmup_rejects_empty_sensor_list() {
        let store = sample_store();
        assert!(matches!(
            store.warmup(&[], ts(0)).await,
            Err(StorageError::EmptySensorSet)
        ));
    }

    #[tokio::test]
    async fn stream_respects_half_open_interval() {
        let store = sample_store();
        let cancel = CancellationToken::new();
        let stream = store
            .stream(
                StreamRequest {
                    sensors: vec![1, 2],
                    from: ts(0),
                    to: ts(5),
                    window: chrono::Duration::seconds(10),
                },
                cancel,
            )
            .await;
        let chunks: Vec<_> = ReceiverStream::new(stream.rx).collect().await;
        let all: Vec<Event> = chunks.into_iter().flatten().flatten().collect();
        assert!(all.iter().all(|e| e.ts < ts(5)));
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn range_counts_distinct_sensors_in_bounds() {
        let store = sample_store();
        let info = store.range(&[1, 2], Some(ts(0)), Some(ts(2))).await.unwrap();
        assert_eq!(info.distinct_sensor_count, 2);
        assert_eq!(info.min_ts, Some(ts(0)));
        assert_eq!(info.max_ts, Some(ts(2)));
    }
}
