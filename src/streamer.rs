//! Fan-out of the currently-replaying state to push subscribers (the
//! WebSocket control surface and, internally, nothing else).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::catalog::SensorInfo;
use crate::engine::StepInfo;
use crate::output::SensorUpdate;

const SUBSCRIBER_MAILBOX_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct UpdateEntry {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub textname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_value: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Snapshot {
        step_id: u64,
        step_ts: Option<DateTime<Utc>>,
        updates: Vec<UpdateEntry>,
    },
    Updates {
        step_id: u64,
        step_ts: DateTime<Utc>,
        updates: Vec<UpdateEntry>,
    },
    Reset,
}

#[derive(Debug, Clone, Default)]
struct LiveValue {
    value: f64,
    has_value: bool,
}

struct Inner {
    dictionary: HashMap<u64, SensorInfo>,
    live: HashMap<u64, LiveValue>,
    last_step_id: u64,
    last_step_ts: Option<DateTime<Utc>>,
    subscribers: Vec<mpsc::Sender<Envelope>>,
}

/// Broadcasts step deltas to any number of subscribers, each with its own
/// bounded mailbox; a subscriber that can't keep up is dropped rather than
/// allowed to stall the engine.
pub struct Streamer {
    inner: RwLock<Inner>,
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new()
    }
}

impl Streamer {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                dictionary: HashMap::new(),
                live: HashMap::new(),
                last_step_id: 0,
                last_step_ts: None,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn reset(&self, sensors: &[SensorInfo]) {
        let mut inner = self.inner.write();
        inner.dictionary = sensors.iter().map(|s| (s.id, s.clone())).collect();
        inner.live.clear();
        inner.last_step_id = 0;
        inner.last_step_ts = None;
        inner.subscribers.retain(|tx| tx.try_send(Envelope::Reset).is_ok());
    }

    pub fn publish(&self, info: &StepInfo, updates: &[SensorUpdate]) {
        let mut inner = self.inner.write();
        inner.last_step_id = info.step_id;
        inner.last_step_ts = Some(info.step_ts);
        for update in updates {
            inner.live.insert(
                update.id,
                LiveValue {
                    value: update.value,
                    has_value: true,
                },
            );
        }
        let entries: Vec<UpdateEntry> = updates
            .iter()
            .map(|u| UpdateEntry {
                id: u.id,
                name: None,
                textname: None,
                value: Some(u.value),
                has_value: Some(true),
            })
            .collect();
        let envelope = Envelope::Updates {
            step_id: info.step_id,
            step_ts: info.step_ts,
            updates: entries,
        };
        inner
            .subscribers
            .retain(|tx| tx.try_send(envelope.clone()).is_ok());
    }

    pub fn snapshot(&self) -> Envelope {
        let inner = self.inner.read();
        self.snapshot_locked(&inner)
    }

    fn snapshot_locked(&self, inner: &Inner) -> Envelope {
        let mut names: Vec<_> = inner.dictionary.values().collect();
        names.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        let updates = names
            .into_iter()
            .map(|info| {
                let live = inner.live.get(&info.id);
                UpdateEntry {
                    id: info.id,
                    name: Some(info.name.clone()),
                    textname: info.textname.clone(),
                    value: live.map(|l| l.value),
                    has_value: Some(live.map(|l| l.has_value).unwrap_or(false)),
                }
            })
            .collect();
        Envelope::Snapshot {
            step_id: inner.last_step_id,
            step_ts: inner.last_step_ts,
            updates,
        }
    }

    /// Registers a new subscriber and immediately queues a snapshot for it.
    pub fn subscribe(self: &Arc<Self>) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_MAILBOX_CAPACITY);
        let mut inner = self.inner.write();
        let snapshot = self.snapshot_locked(&inner);
        let _ = tx.try_send(snapshot);
        inner.subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(id: u64, name: &str) -> SensorInfo {
        SensorInfo {
            id,
            name: name.to_string(),
            textname: None,
            iotype: None,
        }
    }

    #[test]
    fn subscriber_receives_snapshot_first() {
        let streamer = Arc::new(Streamer::new());
        streamer.reset(&[sensor(1, "a")]);
        let mut rx = streamer.subscribe();
        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Envelope::Snapshot { .. }));
    }

    #[test]
    fn publish_updates_live_values_and_fans_out() {
        let streamer = Arc::new(Streamer::new());
        streamer.reset(&[sensor(1, "a")]);
        let mut rx = streamer.subscribe();
        let _ = rx.try_recv();

        let info = StepInfo {
            step_id: 3,
            step_ts: Utc::now(),
            updates_count: 1,
        };
        streamer.publish(&info, &[SensorUpdate { id: 1, value: 42.0 }]);
        let msg = rx.try_recv().unwrap();
        match msg {
            Envelope::Updates { step_id, updates, .. } => {
                assert_eq!(step_id, 3);
                assert_eq!(updates[0].value, Some(42.0));
            }
            _ => panic!("expected updates envelope"),
        }
    }

    #[test]
    fn reset_emits_reset_envelope() {
        let streamer = Arc::new(Streamer::new());
        let mut rx = streamer.subscribe();
        let _ = rx.try_recv();
        streamer.reset(&[]);
        let msg = rx.try_recv().unwrap();
        assert!(matches!(msg, Envelope::Reset));
    }
}
