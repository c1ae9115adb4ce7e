//! Job manager: single-job lifecycle, pending range/seek staging, and the
//! thin translation layer between operator commands and the replay engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::engine::{self, CommandKind, EngineError, EngineHandle, JobParams, SensorCell};
use crate::error::{AppError, StorageError};
use crate::output::{OutputSink, SensorUpdate};
use crate::storage::{RangeInfo, StorageSource};
use crate::streamer::Streamer;

const COMMAND_TIMEOUT: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("command timed out")]
    Timeout,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Validation(msg) => AppError::bad_request(msg),
            ManagerError::Conflict(msg) => AppError::conflict(msg),
            ManagerError::Timeout => AppError::internal("command timed out"),
            ManagerError::Engine(EngineError::InvalidCommand(msg)) => AppError::bad_request(msg),
            ManagerError::Engine(_) => AppError::internal("engine error"),
            ManagerError::Storage(err) => err.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Pending,
    Running,
    Paused,
    Stopping,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingView {
    pub range_set: bool,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub step_secs: Option<f64>,
    pub speed: Option<f64>,
    pub window_secs: Option<f64>,
    pub save_output: Option<bool>,
    pub seek_set: bool,
    pub seek_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub status: JobStatus,
    pub sensors: Vec<u64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub step_id: u64,
    pub last_ts: Option<DateTime<Utc>>,
    pub updates_sent: u64,
    pub error: Option<String>,
    pub save_allowed: bool,
    pub pending: PendingView,
}

struct JobRecord {
    params: JobParams,
    status: JobStatus,
    step_id: u64,
    last_ts: Option<DateTime<Utc>>,
    updates_sent: u64,
    error: Option<String>,
    save_allowed: bool,
}

#[derive(Default, Clone)]
struct PendingRange {
    range_set: bool,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    step: Option<chrono::Duration>,
    speed: Option<f64>,
    window: Option<chrono::Duration>,
    save_output: Option<bool>,
    seek_set: bool,
    seek_ts: Option<DateTime<Utc>>,
}

struct Inner {
    working_list: Vec<u64>,
    batch_size: usize,
    job: Option<JobRecord>,
    engine: Option<EngineHandle>,
    pending: PendingRange,
}

/// Owns the single active (or most recently finished) job and mediates every
/// operator command against it; the replay engine itself never sees a
/// second job start while one is active.
pub struct Manager {
    storage: Arc<dyn StorageSource>,
    output: Option<Arc<dyn OutputSink>>,
    streamer: Arc<Streamer>,
    inner: Arc<Mutex<Inner>>,
}

impl Manager {
    pub fn new(
        storage: Arc<dyn StorageSource>,
        output: Option<Arc<dyn OutputSink>>,
        streamer: Arc<Streamer>,
        working_list: Vec<u64>,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            output,
            streamer,
            inner: Arc::new(Mutex::new(Inner {
                working_list,
                batch_size,
                job: None,
                engine: None,
                pending: PendingRange::default(),
            })),
        }
    }

    pub fn set_working_list(&self, ids: Vec<u64>) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock();
        if matches!(
            inner.job.as_ref().map(|j| j.status),
            Some(JobStatus::Running | JobStatus::Paused | JobStatus::Stopping)
        ) {
            return Err(ManagerError::Conflict(
                "stop the active job before changing the sensor list".into(),
            ));
        }
        inner.working_list = ids;
        Ok(())
    }

    pub fn working_list(&self) -> Vec<u64> {
        self.inner.lock().working_list.clone()
    }

    pub async fn range(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<RangeInfo, ManagerError> {
        let sensors = self.working_list();
        Ok(self.storage.range(&sensors, from, to).await?)
    }

    pub async fn sensors_count(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64, ManagerError> {
        Ok(self.range(from, to).await?.distinct_sensor_count)
    }

    pub fn set_pending_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: chrono::Duration,
        speed: Option<f64>,
        window: Option<chrono::Duration>,
        save_output: Option<bool>,
    ) -> Result<(), ManagerError> {
        if to <= from {
            return Err(ManagerError::Validation("to must be after from".into()));
        }
        let mut inner = self.inner.lock();
        inner.pending = PendingRange {
            range_set: true,
            from: Some(from),
            to: Some(to),
            step: Some(step),
            speed,
            window,
            save_output,
            seek_set: inner.pending.seek_set,
            seek_ts: inner.pending.seek_ts,
        };
        Ok(())
    }

    pub fn set_pending_seek(&self, ts: DateTime<Utc>) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock();
        inner.pending.seek_set = true;
        inner.pending.seek_ts = Some(ts);
        Ok(())
    }

    /// Starts a job from the staged pending range (and pending seek, if any).
    pub async fn start(&self) -> Result<(), ManagerError> {
        let (params, seek_ts) = {
            let inner = self.inner.lock();
            if matches!(
                inner.job.as_ref().map(|j| j.status),
                Some(JobStatus::Running | JobStatus::Paused | JobStatus::Stopping)
            ) {
                return Err(ManagerError::Conflict("job is already active".into()));
            }
            if !inner.pending.range_set {
                return Err(ManagerError::Validation("no pending range staged".into()));
            }
            if inner.working_list.is_empty() {
                return Err(ManagerError::Validation("working sensor list is empty".into()));
            }
            let params = JobParams {
                sensors: inner.working_list.clone(),
                from: inner.pending.from.unwrap(),
                to: inner.pending.to.unwrap(),
                step: inner.pending.step.unwrap(),
                window: inner.pending.window.unwrap_or_else(|| chrono::Duration::seconds(60)),
                speed: inner.pending.speed.unwrap_or(1.0),
                batch_size: inner.batch_size,
                save_output: inner.pending.save_output.unwrap_or(true),
            };
            let seek_ts = inner.pending.seek_set.then_some(inner.pending.seek_ts).flatten();
            (params, seek_ts)
        };
        params.validate()?;

        self.streamer.reset(&[]);

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let handle = EngineHandle {
            cmd_tx,
            cancel: cancel.clone(),
        };

        let storage = self.storage.clone();
        let output = self.output.clone();
        let streamer = self.streamer.clone();
        let on_step = {
            let job_inner = self.inner.clone();
            Arc::new(move |info: engine::StepInfo| {
                let mut inner = job_inner.lock();
                if let Some(job) = inner.job.as_mut() {
                    job.step_id = info.step_id;
                    job.last_ts = Some(info.step_ts);
                }
            })
        };
        let on_updates = {
            let streamer = streamer.clone();
            let job_inner = self.inner.clone();
            Arc::new(move |info: engine::StepInfo, updates: Vec<SensorUpdate>| {
                if !updates.is_empty() {
                    let mut inner = job_inner.lock();
                    if let Some(job) = inner.job.as_mut() {
                        job.updates_sent += updates.len() as u64;
                    }
                }
                streamer.publish(&info, &updates);
            })
        };

        {
            let mut inner = self.inner.lock();
            inner.job = Some(JobRecord {
                params: params.clone(),
                status: JobStatus::Running,
                step_id: 0,
                last_ts: Some(params.from),
                updates_sent: 0,
                error: None,
                save_allowed: params.save_output,
            });
            inner.engine = Some(handle);
            inner.pending = PendingRange::default();
        }

        let task_params = params.clone();
        let engine_task = tokio::spawn(async move {
            engine::run(
                task_params,
                storage,
                output,
                on_step,
                on_updates,
                cmd_rx,
                cancel,
            )
            .await
        });

        let job_inner = self.inner.clone();
        tokio::spawn(async move {
            let result = engine_task.await;
            let mut inner = job_inner.lock();
            if let Some(job) = inner.job.as_mut() {
                match &result {
                    Ok(Ok(())) | Ok(Err(EngineError::Stopped)) => {
                        if !matches!(job.status, JobStatus::Failed) {
                            job.status = JobStatus::Done;
                        }
                    }
                    Ok(Err(err)) => {
                        job.status = JobStatus::Failed;
                        job.error = Some(err.to_string());
                    }
                    Err(join_err) => {
                        job.status = JobStatus::Failed;
                        job.error = Some(format!("engine task panicked: {join_err}"));
                    }
                }
            }
            tracing::info!(?result, "replay job finished");
        });

        if let Some(ts) = seek_ts {
            let _ = self.seek(ts, false).await;
            let _ = self.resume().await;
        }

        Ok(())
    }

    async fn dispatch(&self, kind: CommandKind) -> Result<(), ManagerError> {
        let handle = {
            let inner = self.inner.lock();
            match &inner.engine {
                Some(handle) => {
                    // CancellationToken/Sender clones are cheap; avoid holding
                    // the lock across the await below.
                    EngineHandle {
                        cmd_tx: handle.cmd_tx.clone(),
                        cancel: handle.cancel.clone(),
                    }
                }
                None => return Err(ManagerError::Validation("no active job".into())),
            }
        };
        match tokio::time::timeout(COMMAND_TIMEOUT, handle.send(kind)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ManagerError::Timeout),
        }
    }

    pub async fn pause(&self) -> Result<(), ManagerError> {
        self.dispatch(CommandKind::Pause).await?;
        self.set_status(JobStatus::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), ManagerError> {
        self.dispatch(CommandKind::Resume).await?;
        self.set_status(JobStatus::Running);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ManagerError> {
        let has_job = {
            let mut inner = self.inner.lock();
            if let Some(job) = inner.job.as_mut() {
                if matches!(job.status, JobStatus::Done | JobStatus::Failed | JobStatus::Idle) {
                    return Ok(());
                }
                job.status = JobStatus::Stopping;
                true
            } else {
                false
            }
        };
        if !has_job {
            return Ok(());
        }
        let result = self.dispatch(CommandKind::Stop).await;
        self.set_status(JobStatus::Done);
        match result {
            Ok(()) | Err(ManagerError::Engine(EngineError::Stopped)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn apply(&self) -> Result<(), ManagerError> {
        self.dispatch(CommandKind::Apply).await
    }

    pub async fn step_forward(&self) -> Result<(), ManagerError> {
        self.dispatch(CommandKind::StepForward).await?;
        self.set_status(JobStatus::Paused);
        Ok(())
    }

    pub async fn step_backward(&self, apply: bool) -> Result<(), ManagerError> {
        self.dispatch(CommandKind::StepBackward { apply }).await?;
        self.set_status(JobStatus::Paused);
        Ok(())
    }

    pub async fn seek(&self, ts: DateTime<Utc>, apply: bool) -> Result<(), ManagerError> {
        self.dispatch(CommandKind::Seek { ts, apply }).await
    }

    pub async fn set_save_output(&self, flag: bool) -> Result<(), ManagerError> {
        self.dispatch(CommandKind::SaveOutput { flag }).await?;
        let mut inner = self.inner.lock();
        if let Some(job) = inner.job.as_mut() {
            job.save_allowed = flag;
        }
        Ok(())
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.engine.take() {
            handle.cancel.cancel();
        }
        inner.job = None;
        inner.pending = PendingRange::default();
        drop(inner);
        self.streamer.reset(&[]);
    }

    fn set_status(&self, status: JobStatus) {
        let mut inner = self.inner.lock();
        if let Some(job) = inner.job.as_mut() {
            job.status = status;
        }
    }

    pub fn status(&self) -> JobView {
        let inner = self.inner.lock();
        let pending = PendingView {
            range_set: inner.pending.range_set,
            from: inner.pending.from,
            to: inner.pending.to,
            step_secs: inner.pending.step.map(|d| d.num_milliseconds() as f64 / 1000.0),
            speed: inner.pending.speed,
            window_secs: inner.pending.window.map(|d| d.num_milliseconds() as f64 / 1000.0),
            save_output: inner.pending.save_output,
            seek_set: inner.pending.seek_set,
            seek_ts: inner.pending.seek_ts,
        };
        match &inner.job {
            Some(job) => JobView {
                status: job.status,
                sensors: job.params.sensors.clone(),
                from: Some(job.params.from),
                to: Some(job.params.to),
                step_id: job.step_id,
                last_ts: job.last_ts,
                updates_sent: job.updates_sent,
                error: job.error.clone(),
                save_allowed: job.save_allowed,
                pending,
            },
            None => JobView {
                status: if pending.range_set {
                    JobStatus::Pending
                } else {
                    JobStatus::Idle
                },
                sensors: inner.working_list.clone(),
                from: None,
                to: None,
                step_id: 0,
                last_ts: None,
                updates_sent: 0,
                error: None,
                save_allowed: true,
                pending,
            },
        }
    }

    /// Computes sensor state at `ts` with no side effects (no cache write,
    /// no job mutation, no output delivery).
    pub async fn snapshot_at(&self, ts: DateTime<Utc>) -> Result<HashMap<u64, SensorCell>, ManagerError> {
        let sensors = self.working_list();
        if sensors.is_empty() {
            return Err(ManagerError::Validation("working sensor list is empty".into()));
        }
        let params = JobParams {
            sensors,
            from: ts,
            to: ts + chrono::Duration::seconds(1),
            step: chrono::Duration::seconds(1),
            window: chrono::Duration::seconds(60),
            speed: 1.0,
            batch_size: 1,
            save_output: false,
        };
        Ok(engine::snapshot_at(&self.storage, &params, ts).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ConsoleSink;
    use crate::storage::{Event, MemoryStore};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn test_manager() -> Manager {
        let store = MemoryStore::new(vec![Event { sensor_id: 1, ts: ts(0), value: 1.0 }]);
        Manager::new(
            Arc::new(store),
            Some(Arc::new(ConsoleSink)),
            Arc::new(Streamer::new()),
            vec![1],
            16,
        )
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected_with_conflict() {
        let manager = test_manager();
        manager
            .set_pending_range(
                ts(0),
                ts(5),
                chrono::Duration::seconds(1),
                Some(1000.0),
                None,
                Some(false),
            )
            .unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.status().status, JobStatus::Running);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ManagerError::Conflict(_)));

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn step_bookkeeping_updates_job_record_on_each_step() {
        let manager = test_manager();
        manager
            .set_pending_range(
                ts(0),
                ts(5),
                chrono::Duration::seconds(1),
                Some(500.0),
                None,
                Some(false),
            )
            .unwrap();
        manager.start().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let view = manager.status();
        assert!(view.step_id >= 1, "on_step should advance step_id past its initial 0");
        assert!(view.last_ts.is_some());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn job_reaches_done_status_after_natural_completion() {
        let manager = test_manager();
        manager
            .set_pending_range(
                ts(0),
                ts(1),
                chrono::Duration::seconds(1),
                Some(1000.0),
                None,
                Some(false),
            )
            .unwrap();
        manager.start().await.unwrap();

        let mut status = manager.status().status;
        for _ in 0..50 {
            if matches!(status, JobStatus::Done | JobStatus::Failed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            status = manager.status().status;
        }
        assert_eq!(status, JobStatus::Done);

        // A finished job must not block a fresh start.
        manager
            .set_pending_range(
                ts(0),
                ts(1),
                chrono::Duration::seconds(1),
                Some(1000.0),
                None,
                Some(false),
            )
            .unwrap();
        manager.start().await.unwrap();
        manager.stop().await.unwrap();
    }
}
