//! The replay engine: a single-job state machine that interleaves windowed
//! history prefetch with stepwise event application, batched delivery, and
//! an external command protocol.

mod cache;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{OutputError, StorageError};
use crate::output::{OutputSink, SensorUpdate, StepPayload};
use crate::storage::{Event, StorageSource, StreamRequest};

use cache::StateCache;

#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    /// Sentinel terminal condition for an explicit `Stop` command.
    #[error("stopped")]
    Stopped,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("output error: {0}")]
    Output(String),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<OutputError> for EngineError {
    fn from(err: OutputError) -> Self {
        EngineError::Output(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorCell {
    pub value: f64,
    pub has_value: bool,
    pub dirty: bool,
}

#[derive(Debug, Clone)]
pub struct JobParams {
    pub sensors: Vec<u64>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub step: chrono::Duration,
    pub window: chrono::Duration,
    pub speed: f64,
    pub batch_size: usize,
    pub save_output: bool,
}

impl JobParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sensors.is_empty() {
            return Err(EngineError::InvalidCommand("empty sensor set".into()));
        }
        if self.to <= self.from {
            return Err(EngineError::InvalidCommand("to must be after from".into()));
        }
        if self.step <= chrono::Duration::zero() {
            return Err(EngineError::InvalidCommand("step must be positive".into()));
        }
        if self.window <= chrono::Duration::zero() {
            return Err(EngineError::InvalidCommand("window must be positive".into()));
        }
        if self.speed <= 0.0 {
            return Err(EngineError::InvalidCommand("speed must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidCommand("batch_size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StepInfo {
    pub step_id: u64,
    pub step_ts: DateTime<Utc>,
    pub updates_count: usize,
}

pub enum CommandKind {
    Pause,
    Resume,
    Stop,
    StepForward,
    StepBackward { apply: bool },
    Seek { ts: DateTime<Utc>, apply: bool },
    Apply,
    SaveOutput { flag: bool },
}

pub struct Command {
    pub kind: CommandKind,
    pub resp: oneshot::Sender<Result<(), EngineError>>,
}

pub type OnStep = Arc<dyn Fn(StepInfo) + Send + Sync>;
pub type OnUpdates = Arc<dyn Fn(StepInfo, Vec<SensorUpdate>) + Send + Sync>;

const CACHE_CAPACITY: usize = 16;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Channel handle a caller (the job manager) uses to talk to a running engine.
pub struct EngineHandle {
    pub cmd_tx: mpsc::Sender<Command>,
    pub cancel: CancellationToken,
}

impl EngineHandle {
    pub async fn send(&self, kind: CommandKind) -> Result<(), EngineError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command { kind, resp: resp_tx })
            .await
            .map_err(|_| EngineError::Stopped)?;
        resp_rx.await.map_err(|_| EngineError::Stopped)?
    }
}

fn apply_event(state: &mut HashMap<u64, SensorCell>, event: Event) {
    if let Some(cell) = state.get_mut(&event.sensor_id) {
        cell.value = event.value;
        cell.has_value = true;
        cell.dirty = true;
    }
}

fn steps_between(from: DateTime<Utc>, to: DateTime<Utc>, step: chrono::Duration) -> u64 {
    let elapsed = (to - from).num_milliseconds().max(0);
    let step_ms = step.num_milliseconds().max(1);
    (elapsed / step_ms) as u64
}

fn partition_batches(updates: &[SensorUpdate], batch_size: usize) -> Vec<Vec<SensorUpdate>> {
    if updates.is_empty() {
        return Vec::new();
    }
    updates
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Replays buffered/streamed events from `from_ts` up to (and including)
/// `target`, advancing in `step`-sized increments, starting from `state`.
async fn replay_forward(
    storage: &Arc<dyn StorageSource>,
    sensors: &[u64],
    step: chrono::Duration,
    window: chrono::Duration,
    mut state: HashMap<u64, SensorCell>,
    from_ts: DateTime<Utc>,
    target: DateTime<Utc>,
) -> Result<HashMap<u64, SensorCell>, EngineError> {
    if target <= from_ts {
        return Ok(state);
    }
    let cancel = CancellationToken::new();
    let mut stream = storage
        .stream(
            StreamRequest {
                sensors: sensors.to_vec(),
                from: from_ts,
                to: target + step,
                window,
            },
            cancel.clone(),
        )
        .await;
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.rx.recv().await {
        buffer.extend(chunk?);
    }
    cancel.cancel();

    let mut ts = from_ts;
    while ts < target {
        ts += step;
        let mut i = 0;
        while i < buffer.len() {
            if buffer[i].ts <= ts {
                apply_event(&mut state, buffer.remove(i));
            } else {
                i += 1;
            }
        }
    }
    Ok(state)
}

/// Rebuilds state at `target` from scratch: warmup then full forward replay.
/// Always correct, but the most expensive restoration path.
async fn build_state(
    storage: &Arc<dyn StorageSource>,
    params: &JobParams,
    target: DateTime<Utc>,
) -> Result<HashMap<u64, SensorCell>, EngineError> {
    let mut state: HashMap<u64, SensorCell> =
        params.sensors.iter().map(|&id| (id, SensorCell::default())).collect();
    for event in storage.warmup(&params.sensors, params.from).await? {
        apply_event(&mut state, event);
    }
    replay_forward(
        storage,
        &params.sensors,
        params.step,
        params.window,
        state,
        params.from,
        target,
    )
    .await
}

/// Side-effect-free state computation at an arbitrary timestamp, used by the
/// snapshot endpoint. Always goes through the full rebuild path since there
/// is no engine instance (and therefore no cache) to consult.
pub async fn snapshot_at(
    storage: &Arc<dyn StorageSource>,
    params: &JobParams,
    target: DateTime<Utc>,
) -> Result<HashMap<u64, SensorCell>, EngineError> {
    build_state(storage, params, target).await
}

struct Engine {
    params: JobParams,
    storage: Arc<dyn StorageSource>,
    output: Option<Arc<dyn OutputSink>>,
    save_output: bool,
    on_step: OnStep,
    on_updates: OnUpdates,
    state: HashMap<u64, SensorCell>,
    cache: StateCache,
    pending: Vec<Event>,
    stream: crate::storage::EventStream,
    stream_cancel: CancellationToken,
    step_ts: DateTime<Utc>,
    step_id: u64,
    paused: bool,
    step_once: bool,
}

impl Engine {
    async fn new(
        params: JobParams,
        storage: Arc<dyn StorageSource>,
        output: Option<Arc<dyn OutputSink>>,
        on_step: OnStep,
        on_updates: OnUpdates,
    ) -> Result<Self, EngineError> {
        params.validate()?;
        let mut state: HashMap<u64, SensorCell> =
            params.sensors.iter().map(|&id| (id, SensorCell::default())).collect();
        for event in storage.warmup(&params.sensors, params.from).await? {
            apply_event(&mut state, event);
        }

        let mut cache = StateCache::new(CACHE_CAPACITY);
        cache.insert(params.from, 0, state.clone());

        let stream_cancel = CancellationToken::new();
        let stream = storage
            .stream(
                StreamRequest {
                    sensors: params.sensors.clone(),
                    from: params.from,
                    to: params.to,
                    window: params.window,
                },
                stream_cancel.clone(),
            )
            .await;

        let save_output = params.save_output;
        Ok(Self {
            step_ts: params.from,
            step_id: 0,
            paused: false,
            step_once: false,
            params,
            storage,
            output,
            save_output,
            on_step,
            on_updates,
            state,
            cache,
            pending: Vec::new(),
            stream,
            stream_cancel,
        })
    }

    fn drain_stream_nonblocking(&mut self) {
        while let Ok(chunk) = self.stream.rx.try_recv() {
            if let Ok(events) = chunk {
                self.pending.extend(events);
            }
        }
    }

    fn apply_pending_up_to(&mut self, ts: DateTime<Utc>) -> Vec<SensorUpdate> {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].ts <= ts {
                let event = self.pending.remove(i);
                apply_event(&mut self.state, event);
            } else {
                i += 1;
            }
        }
        let updates: Vec<SensorUpdate> = self
            .state
            .iter_mut()
            .filter(|(_, cell)| cell.dirty)
            .map(|(&id, cell)| {
                cell.dirty = false;
                SensorUpdate { id, value: cell.value }
            })
            .collect();
        updates
    }

    async fn emit(
        &mut self,
        step_id: u64,
        step_ts: DateTime<Utc>,
        updates: Vec<SensorUpdate>,
    ) -> Result<(), EngineError> {
        let batches = partition_batches(&updates, self.params.batch_size);
        let batch_total = batches.len() as u32;
        if self.save_output {
            if let Some(output) = &self.output {
                for (i, batch) in batches.iter().enumerate() {
                    let payload = StepPayload {
                        step_id,
                        step_ts,
                        batch_id: (i + 1) as u32,
                        batch_total,
                        updates: batch.clone(),
                    };
                    output.send(&payload).await?;
                }
            }
        }
        let info = StepInfo {
            step_id,
            step_ts,
            updates_count: updates.len(),
        };
        (self.on_updates)(info.clone(), updates);
        (self.on_step)(info);
        Ok(())
    }

    async fn emit_synthetic(&mut self) -> Result<(), EngineError> {
        let updates: Vec<SensorUpdate> = self
            .state
            .iter()
            .filter(|(_, cell)| cell.has_value)
            .map(|(&id, cell)| SensorUpdate { id, value: cell.value })
            .collect();
        self.emit(self.step_id, self.step_ts, updates).await
    }

    async fn restore_to(&mut self, target: DateTime<Utc>) -> Result<(), EngineError> {
        if let Some(entry) = self.cache.get_exact(target) {
            self.state = entry.state.clone();
            self.step_id = entry.step_id;
        } else if let Some(entry) = self.cache.get_le(target) {
            let base_ts = entry.ts;
            let base_step_id = entry.step_id;
            let base_state = entry.state.clone();
            let state = replay_forward(
                &self.storage,
                &self.params.sensors,
                self.params.step,
                self.params.window,
                base_state,
                base_ts,
                target,
            )
            .await?;
            self.state = state;
            self.step_id = base_step_id + steps_between(base_ts, target, self.params.step);
        } else {
            self.state = build_state(&self.storage, &self.params, target).await?;
            self.step_id = if target == self.params.from {
                1
            } else {
                1 + steps_between(self.params.from, target, self.params.step)
            };
        }
        self.step_ts = target;
        self.cache.insert(self.step_ts, self.step_id, self.state.clone());

        self.stream_cancel.cancel();
        self.stream_cancel = CancellationToken::new();
        self.pending.clear();
        self.stream = self
            .storage
            .stream(
                StreamRequest {
                    sensors: self.params.sensors.clone(),
                    from: self.step_ts,
                    to: self.params.to,
                    window: self.params.window,
                },
                self.stream_cancel.clone(),
            )
            .await;
        Ok(())
    }

    async fn step_backward(&mut self, apply: bool) -> Result<(), EngineError> {
        let target = std::cmp::max(self.params.from, self.step_ts - self.params.step);
        self.restore_to(target).await?;
        self.paused = true;
        if apply && self.save_output {
            self.emit_synthetic().await?;
        }
        Ok(())
    }

    async fn seek(&mut self, ts: DateTime<Utc>, apply: bool) -> Result<(), EngineError> {
        if ts < self.params.from || ts > self.params.to {
            return Err(EngineError::InvalidCommand("seek target out of range".into()));
        }
        let was_running = !self.paused;
        self.restore_to(ts).await?;
        self.paused = !was_running;
        if apply && self.save_output {
            self.emit_synthetic().await?;
        }
        Ok(())
    }

    /// Handles one command, replying on its response channel. Returns `true`
    /// if the engine should terminate (an explicit `Stop`).
    async fn handle_command(&mut self, cmd: Command) -> bool {
        let result = match cmd.kind {
            CommandKind::Pause => {
                self.paused = true;
                Ok(())
            }
            CommandKind::Resume => {
                self.paused = false;
                Ok(())
            }
            CommandKind::Stop => Err(EngineError::Stopped),
            CommandKind::StepForward => {
                self.step_once = true;
                self.paused = false;
                Ok(())
            }
            CommandKind::StepBackward { apply } => self.step_backward(apply).await,
            CommandKind::Seek { ts, apply } => self.seek(ts, apply).await,
            CommandKind::Apply => self.emit_synthetic().await,
            CommandKind::SaveOutput { flag } => {
                self.save_output = flag;
                Ok(())
            }
        };
        let terminate = matches!(result, Err(EngineError::Stopped));
        let _ = cmd.resp.send(result);
        terminate
    }
}

/// Drives a job to completion. Spawned as a detached task by the job manager;
/// `cmd_rx`/`cancel` are the two ways the manager talks to it while it runs.
pub async fn run(
    params: JobParams,
    storage: Arc<dyn StorageSource>,
    output: Option<Arc<dyn OutputSink>>,
    on_step: OnStep,
    on_updates: OnUpdates,
    mut cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let mut engine = Engine::new(params, storage, output, on_step, on_updates).await?;

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Stopped);
        }
        if engine.step_ts >= engine.params.to {
            return Ok(());
        }
        engine.step_id += 1;

        while let Ok(cmd) = cmd_rx.try_recv() {
            if engine.handle_command(cmd).await {
                return Err(EngineError::Stopped);
            }
        }

        while engine.paused {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Stopped),
                chunk = engine.stream.rx.recv() => {
                    if let Some(Ok(events)) = chunk {
                        engine.pending.extend(events);
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if engine.handle_command(cmd).await {
                                return Err(EngineError::Stopped);
                            }
                        }
                        None => return Err(EngineError::Stopped),
                    }
                }
            }
        }

        engine.drain_stream_nonblocking();
        let current_ts = engine.step_ts;
        let updates = engine.apply_pending_up_to(current_ts);
        engine.emit(engine.step_id, current_ts, updates).await?;
        engine
            .cache
            .insert(current_ts, engine.step_id, engine.state.clone());

        if engine.step_once {
            engine.paused = true;
            engine.step_once = false;
        }

        let sleep_for = std::time::Duration::from_secs_f64(
            (engine.params.step.num_milliseconds() as f64 / 1000.0) / engine.params.speed,
        );
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = cancel.cancelled() => return Err(EngineError::Stopped),
        }

        engine.step_ts += engine.params.step;
        if engine.step_ts > engine.params.to {
            // StepForward landing past the end of the range clamps to it
            // rather than leaving the job one step short of completion.
            engine.step_ts = engine.params.to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Event, MemoryStore};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[derive(Default)]
    struct TestSink {
        payloads: parking_lot::Mutex<Vec<StepPayload>>,
    }

    impl TestSink {
        fn payloads(&self) -> Vec<StepPayload> {
            self.payloads.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl OutputSink for TestSink {
        async fn send(&self, payload: &StepPayload) -> Result<(), OutputError> {
            self.payloads.lock().push(payload.clone());
            Ok(())
        }
    }

    /// Spawns an engine against an in-memory archive and sink, handing back
    /// everything a test needs to drive it through the command channel.
    fn harness(
        params: JobParams,
        store: MemoryStore,
    ) -> (
        Arc<TestSink>,
        EngineHandle,
        tokio::task::JoinHandle<Result<(), EngineError>>,
        Arc<parking_lot::Mutex<Option<StepInfo>>>,
    ) {
        let sink = Arc::new(TestSink::default());
        let last_step = Arc::new(parking_lot::Mutex::new(None));
        let on_step: OnStep = {
            let last_step = last_step.clone();
            Arc::new(move |info: StepInfo| {
                *last_step.lock() = Some(info);
            })
        };
        let on_updates: OnUpdates = Arc::new(|_info, _updates| {});

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let handle = EngineHandle { cmd_tx, cancel: cancel.clone() };
        let storage: Arc<dyn StorageSource> = Arc::new(store);
        let output: Option<Arc<dyn OutputSink>> = Some(sink.clone());
        let task = tokio::spawn(run(params, storage, output, on_step, on_updates, cmd_rx, cancel));
        (sink, handle, task, last_step)
    }

    #[tokio::test]
    async fn warmup_values_appear_in_first_emitted_step() {
        let store = MemoryStore::new(vec![
            Event { sensor_id: 1, ts: ts(0), value: 10.0 },
            Event { sensor_id: 2, ts: ts(0), value: 20.0 },
            Event { sensor_id: 1, ts: ts(1), value: 11.0 },
            Event { sensor_id: 2, ts: ts(2), value: 22.0 },
        ]);
        let params = JobParams {
            sensors: vec![1, 2],
            from: ts(0),
            to: ts(3),
            step: chrono::Duration::seconds(1),
            window: chrono::Duration::seconds(10),
            speed: 50.0,
            batch_size: 16,
            save_output: true,
        };
        let (sink, _handle, task, _last_step) = harness(params, store);
        task.await.unwrap().unwrap();

        let payloads = sink.payloads();
        assert!(!payloads.is_empty());
        assert_eq!(payloads[0].step_ts, ts(0));
        let mut first: Vec<_> = payloads[0].updates.iter().map(|u| (u.id, u.value)).collect();
        first.sort_by_key(|(id, _)| *id);
        assert_eq!(first, vec![(1, 10.0), (2, 20.0)]);

        // Later archive events must eventually reach the sink with their
        // updated values, whichever step they land on.
        let mut latest: HashMap<u64, f64> = HashMap::new();
        for payload in &payloads {
            for update in &payload.updates {
                latest.insert(update.id, update.value);
            }
        }
        assert_eq!(latest.get(&1), Some(&11.0));
        assert_eq!(latest.get(&2), Some(&22.0));

        for payload in &payloads {
            assert!((1..=3).contains(&payload.step_id));
        }
    }

    #[tokio::test]
    async fn seek_with_apply_emits_exactly_one_synthetic_payload() {
        let store = MemoryStore::new(vec![
            Event { sensor_id: 1, ts: ts(0), value: 1.0 },
            Event { sensor_id: 2, ts: ts(0), value: 2.0 },
        ]);
        let params = JobParams {
            sensors: vec![1, 2],
            from: ts(0),
            to: ts(6),
            step: chrono::Duration::seconds(1),
            window: chrono::Duration::seconds(10),
            speed: 100.0,
            batch_size: 16,
            save_output: true,
        };
        let (sink, handle, task, last_step) = harness(params, store);

        handle.send(CommandKind::Pause).await.unwrap();
        for _ in 0..3 {
            handle.send(CommandKind::StepForward).await.unwrap();
        }
        let before = sink.payloads().len();

        handle.send(CommandKind::Seek { ts: ts(2), apply: true }).await.unwrap();

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), before + 1);
        let synthetic = payloads.last().unwrap();
        assert_eq!(synthetic.step_ts, ts(2));
        let mut ids: Vec<_> = synthetic.updates.iter().map(|u| u.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(last_step.lock().as_ref().unwrap().step_ts, ts(2));

        handle.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn step_backward_without_apply_sends_nothing_and_forward_replays_same_value() {
        let store = MemoryStore::new(vec![Event { sensor_id: 2, ts: ts(3), value: 99.0 }]);
        let params = JobParams {
            sensors: vec![2],
            from: ts(0),
            to: ts(6),
            step: chrono::Duration::seconds(1),
            window: chrono::Duration::seconds(10),
            speed: 100.0,
            batch_size: 16,
            save_output: true,
        };
        let (sink, handle, task, _last_step) = harness(params, store);

        handle.send(CommandKind::Pause).await.unwrap();
        for _ in 0..4 {
            handle.send(CommandKind::StepForward).await.unwrap();
        }
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        let original = payloads[0].clone();
        assert_eq!(original.step_ts, ts(3));
        assert!(original.updates.iter().any(|u| u.id == 2 && u.value == 99.0));

        handle.send(CommandKind::StepBackward { apply: false }).await.unwrap();
        assert_eq!(sink.payloads().len(), 1, "no synthetic payload without apply");

        // Give the restarted archive stream a moment to redeliver the event
        // the backward step rewound past.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        handle.send(CommandKind::StepForward).await.unwrap();
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 2);
        let replayed = &payloads[1];
        assert_eq!(replayed.step_ts, ts(3));
        assert!(replayed.updates.iter().any(|u| u.id == 2 && u.value == 99.0));

        handle.cancel.cancel();
        let _ = task.await;
    }
}
