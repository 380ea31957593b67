//! The orchestrator.
//!
//! All mutable scheduler state (the running job, counters, the paused flag)
//! lives inside one actor task. Callers talk to it through a cloneable
//! [`SchedulerHandle`]; timed triggers are separate tasks that send it
//! messages. A backup runs in its own task and reports back when done, so
//! the actor never blocks on pipeline I/O.

pub mod ops;
pub mod trigger;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use keeper_types::{
    BackupFormat, BackupId, BackupJob, BackupKind, BackupRecord, IntegrityReport, JobOptions,
    JobTrigger,
};

use crate::app::Services;
use crate::config::ScheduleConfig;
use crate::engine::BackupEngine;
use crate::error::{KeeperError, Result};
use crate::notify::{Event, EventKind};
use crate::retention::SweepOutcome;

pub use self::ops::{CheckItem, ConfigCheck, IntegritySweep, Operations, RestoreOutcome};
pub use self::trigger::{DailyAt, Interval, Timer, Trigger};

const COMMAND_BUFFER: usize = 64;

/// Process-lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_backups: u64,
    pub successful_backups: u64,
    pub failed_backups: u64,
    pub last_backup: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub next_backup: Option<DateTime<Utc>>,
}

/// A configured timed task as shown in status output.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    pub task: String,
    pub rule: String,
    pub next: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub paused: bool,
    pub current_job: Option<BackupJob>,
    pub stats: SchedulerStats,
    pub schedule: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started(BackupId),
    /// Another backup was running; nothing happened.
    Skipped { running: BackupId },
    /// The scheduler is shutting down.
    ShuttingDown,
}

/// What a timed trigger asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledTask {
    Backup(BackupKind),
    Cleanup,
    Integrity,
    Summary,
}

impl ScheduledTask {
    fn label(self) -> String {
        match self {
            ScheduledTask::Backup(kind) => format!("{} backup", kind.as_str()),
            ScheduledTask::Cleanup => "cleanup".into(),
            ScheduledTask::Integrity => "integrity".into(),
            ScheduledTask::Summary => "summary".into(),
        }
    }
}

struct BackupRequest {
    kind: BackupKind,
    format: Option<BackupFormat>,
    options: JobOptions,
    trigger: JobTrigger,
}

enum Command {
    Trigger {
        request: BackupRequest,
        reply: oneshot::Sender<TriggerOutcome>,
        done: Option<oneshot::Sender<Result<BackupRecord>>>,
    },
    Fire(ScheduledTask),
    Finished {
        job_id: BackupId,
        result: Result<BackupRecord>,
    },
    Pause(oneshot::Sender<bool>),
    Resume(oneshot::Sender<bool>),
    Status(oneshot::Sender<SchedulerStatus>),
}

struct ScheduledTimer {
    task: ScheduledTask,
    timer: Timer,
}

/// State owned by the actor task.
struct Actor {
    ops: Operations,
    engine: Arc<BackupEngine>,
    timers: Arc<Vec<ScheduledTimer>>,
    tx: mpsc::WeakSender<Command>,
    current: Option<BackupJob>,
    waiter: Option<oneshot::Sender<Result<BackupRecord>>>,
    stats: SchedulerStats,
    paused: bool,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.stats.next_backup = self.next_backup(Utc::now());
        while let Some(command) = rx.recv().await {
            match command {
                Command::Trigger {
                    request,
                    reply,
                    done,
                } => {
                    let outcome = self.start_backup(request, done);
                    let _ = reply.send(outcome);
                }
                Command::Fire(task) => self.fire(task),
                Command::Finished { job_id, result } => self.finish(job_id, result),
                Command::Pause(reply) => {
                    let changed = !self.paused;
                    self.paused = true;
                    if changed {
                        tracing::info!("scheduler paused");
                    }
                    let _ = reply.send(changed);
                }
                Command::Resume(reply) => {
                    let changed = self.paused;
                    self.paused = false;
                    if changed {
                        tracing::info!("scheduler resumed");
                    }
                    let _ = reply.send(changed);
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.status());
                }
            }
        }
        tracing::debug!("scheduler actor stopped");
    }

    fn start_backup(
        &mut self,
        request: BackupRequest,
        done: Option<oneshot::Sender<Result<BackupRecord>>>,
    ) -> TriggerOutcome {
        if let Some(current) = &self.current {
            tracing::warn!(
                running = %current.id,
                kind = request.kind.as_str(),
                "backup already running, trigger skipped"
            );
            return TriggerOutcome::Skipped {
                running: current.id.clone(),
            };
        }
        let Some(tx) = self.tx.upgrade() else {
            return TriggerOutcome::ShuttingDown;
        };

        let format = request
            .format
            .unwrap_or(self.ops.services().config.source.format);
        let job = BackupJob::new(request.kind, format, request.options, request.trigger);
        let id = job.id.clone();
        self.current = Some(job.clone());
        self.waiter = done;

        let engine = self.engine.clone();
        let ops = self.ops.clone();
        tokio::spawn(async move {
            let job_id = job.id.clone();
            let result = match tokio::spawn(execute_job(engine, ops, job)).await {
                Ok(result) => result,
                Err(e) => Err(KeeperError::Other(format!("backup task panicked: {e}"))),
            };
            let _ = tx.send(Command::Finished { job_id, result }).await;
        });
        TriggerOutcome::Started(id)
    }

    fn fire(&mut self, task: ScheduledTask) {
        if self.paused {
            tracing::debug!(task = %task.label(), "scheduler paused, timed trigger dropped");
            return;
        }
        tracing::info!(task = %task.label(), "timed trigger fired");
        match task {
            ScheduledTask::Backup(kind) => {
                let request = BackupRequest {
                    kind,
                    format: None,
                    options: JobOptions::default(),
                    trigger: JobTrigger::Scheduled,
                };
                self.start_backup(request, None);
            }
            ScheduledTask::Cleanup => {
                let ops = self.ops.clone();
                let busy = self.current.as_ref().map(|j| j.id.clone());
                tokio::spawn(async move {
                    if let Err(e) = ops.cleanup(busy.as_ref()).await {
                        tracing::error!(error = %e, "scheduled cleanup failed");
                    }
                });
            }
            ScheduledTask::Integrity => {
                let ops = self.ops.clone();
                let busy = self.current.as_ref().map(|j| j.id.clone());
                tokio::spawn(async move {
                    if let Err(e) = ops.integrity_sweep(busy.as_ref()).await {
                        tracing::error!(error = %e, "scheduled integrity sweep failed");
                    }
                });
            }
            ScheduledTask::Summary => {
                let ops = self.ops.clone();
                let stats = self.stats.clone();
                tokio::spawn(async move { send_summary(&ops, stats).await });
            }
        }
    }

    fn finish(&mut self, job_id: BackupId, result: Result<BackupRecord>) {
        let now = Utc::now();
        if self.current.as_ref().map(|j| &j.id) != Some(&job_id) {
            tracing::warn!(backup_id = %job_id, "completion for unknown job ignored");
            return;
        }
        self.current = None;
        self.stats.total_backups += 1;
        match &result {
            Ok(_) => {
                self.stats.successful_backups += 1;
                self.stats.last_backup = Some(now);
            }
            Err(_) => {
                self.stats.failed_backups += 1;
                self.stats.last_failure = Some(now);
            }
        }
        self.stats.next_backup = self.next_backup(now);
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }

    fn next_backup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.timers
            .iter()
            .filter(|t| matches!(t.task, ScheduledTask::Backup(_)))
            .map(|t| t.timer.trigger.next_after(now))
            .min()
    }

    fn status(&self) -> SchedulerStatus {
        let now = Utc::now();
        SchedulerStatus {
            running: self.current.is_some(),
            paused: self.paused,
            current_job: self.current.clone(),
            stats: self.stats.clone(),
            schedule: self
                .timers
                .iter()
                .map(|t| ScheduleEntry {
                    task: t.task.label(),
                    rule: t.timer.trigger.to_string(),
                    next: Some(t.timer.trigger.next_after(now)),
                })
                .collect(),
        }
    }
}

fn build_timers(schedule: &ScheduleConfig) -> Result<Vec<ScheduledTimer>> {
    let mut timers = Vec::new();
    for kind in BackupKind::ALL {
        if let Some(config) = schedule.backup_trigger(kind) {
            timers.push(ScheduledTimer {
                task: ScheduledTask::Backup(kind),
                timer: Timer::from_config(config)?,
            });
        }
    }
    let others = [
        (ScheduledTask::Cleanup, &schedule.cleanup),
        (ScheduledTask::Integrity, &schedule.integrity),
        (ScheduledTask::Summary, &schedule.summary),
    ];
    for (task, config) in others {
        if let Some(config) = config {
            timers.push(ScheduledTimer {
                task,
                timer: Timer::from_config(config)?,
            });
        }
    }
    Ok(timers)
}

/// The configured timed tasks and when each would next fire after `now`,
/// whether or not a daemon is running.
pub fn configured_schedule(schedule: &ScheduleConfig, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
    Ok(build_timers(schedule)?
        .iter()
        .map(|t| ScheduleEntry {
            task: t.task.label(),
            rule: t.timer.trigger.to_string(),
            next: schedule.enabled.then(|| t.timer.trigger.next_after(now)),
        })
        .collect())
}

/// Engine run, post-backup verification and notification for one job.
async fn execute_job(engine: Arc<BackupEngine>, ops: Operations, job: BackupJob) -> Result<BackupRecord> {
    let services = ops.services().clone();
    let job_id = job.id.clone();
    match engine.run(job).await {
        Ok(mut record) => {
            if services.config.integrity.verify_after_backup {
                match ops.verify_record(&mut record).await {
                    Ok(report) if report.valid => {
                        tracing::info!(backup_id = %record.id, "backup verified");
                    }
                    Ok(report) => {
                        services
                            .notifications
                            .notify(Event::new(
                                EventKind::Warning,
                                Some(record.id.clone()),
                                serde_json::json!({ "verification": report }),
                            ))
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(backup_id = %record.id, error = %e, "post-backup verification could not run");
                        record.warnings.push(format!("verification could not run: {e}"));
                    }
                }
            }
            services
                .notifications
                .notify(Event::new(
                    EventKind::Success,
                    Some(record.id.clone()),
                    serde_json::json!({
                        "kind": record.kind,
                        "format": record.format,
                        "raw_size": record.raw_size,
                        "stored_size": record.stored_size,
                        "duration_ms": record.duration_ms,
                        "verified": record.verified,
                        "locations": record.locations,
                        "warnings": record.warnings,
                    }),
                ))
                .await;
            Ok(record)
        }
        Err(e) => {
            services
                .notifications
                .notify(Event::new(
                    EventKind::Failure,
                    Some(job_id),
                    serde_json::json!({
                        "stage": e.failed_stage(),
                        "error": e.to_string(),
                    }),
                ))
                .await;
            Err(e)
        }
    }
}

async fn send_summary(ops: &Operations, stats: SchedulerStats) {
    let storage = ops.services().storage.stats().await;
    ops.services()
        .notifications
        .notify(Event::new(
            EventKind::Summary,
            None,
            serde_json::json!({ "stats": stats, "storage": storage }),
        ))
        .await;
}

/// Cloneable front door to the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    ops: Operations,
}

/// Owns the actor and timer tasks. Dropping it without [`Scheduler::stop`]
/// leaves the tasks running until the runtime shuts down.
pub struct Scheduler {
    handle: SchedulerHandle,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the actor. Timed triggers are only armed when `with_timers`
    /// is set and `schedule.enabled` is true.
    pub fn start(services: Services, with_timers: bool) -> Result<Self> {
        let engine = Arc::new(BackupEngine::new(&services)?);
        let schedule = &services.config.schedule;
        let timers = build_timers(schedule)?;
        let arm = with_timers && schedule.enabled;
        let timers = Arc::new(if arm { timers } else { Vec::new() });

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ops = Operations::new(services);
        let actor = Actor {
            ops: ops.clone(),
            engine,
            timers: timers.clone(),
            tx: tx.downgrade(),
            current: None,
            waiter: None,
            stats: SchedulerStats::default(),
            paused: false,
        };

        let mut tasks = vec![tokio::spawn(actor.run(rx))];
        for index in 0..timers.len() {
            tasks.push(tokio::spawn(run_timer(
                timers.clone(),
                index,
                tx.clone(),
                shutdown_rx.clone(),
            )));
        }
        if arm {
            tracing::info!(timers = timers.len(), "scheduler started");
        }

        Ok(Self {
            handle: SchedulerHandle { tx, ops },
            shutdown,
            tasks,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop the timers, wait for a running backup to finish and shut the
    /// actor down.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let Scheduler { handle, tasks, .. } = self;
        let mut tasks = tasks.into_iter();
        let actor = tasks.next();
        for task in tasks {
            let _ = task.await;
        }
        loop {
            match handle.get_status().await {
                Ok(status) if status.running => {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await
                }
                _ => break,
            }
        }
        drop(handle);
        if let Some(actor) = actor {
            // Other handle clones keep the channel open; don't wait forever.
            if tokio::time::timeout(std::time::Duration::from_secs(1), actor).await.is_err() {
                tracing::debug!("scheduler handles still alive at stop");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

async fn run_timer(
    timers: Arc<Vec<ScheduledTimer>>,
    index: usize,
    tx: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(entry) = timers.get(index) else {
        return;
    };
    if entry.timer.run_on_start && tx.send(Command::Fire(entry.task)).await.is_err() {
        return;
    }
    loop {
        let delay = entry.timer.delay_from(Utc::now());
        tracing::debug!(task = %entry.task.label(), delay_secs = delay.as_secs(), "timer armed");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
        if tx.send(Command::Fire(entry.task)).await.is_err() {
            return;
        }
    }
}

impl SchedulerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| KeeperError::Other("scheduler is not running".into()))?;
        rx.await
            .map_err(|_| KeeperError::Other("scheduler dropped the request".into()))
    }

    /// Start a backup unless one is already running. Returns at once.
    pub async fn trigger_backup(&self, kind: BackupKind, options: JobOptions) -> Result<TriggerOutcome> {
        let request = BackupRequest {
            kind,
            format: None,
            options,
            trigger: JobTrigger::Manual,
        };
        self.request(|reply| Command::Trigger {
            request,
            reply,
            done: None,
        })
        .await
    }

    /// Run a backup and wait for its result. Refused with an error when
    /// another backup is running. Works while paused.
    pub async fn run_manual_backup(
        &self,
        kind: BackupKind,
        format: Option<BackupFormat>,
        options: JobOptions,
    ) -> Result<BackupRecord> {
        let (done, done_rx) = oneshot::channel();
        let request = BackupRequest {
            kind,
            format,
            options,
            trigger: JobTrigger::Manual,
        };
        let outcome = self
            .request(|reply| Command::Trigger {
                request,
                reply,
                done: Some(done),
            })
            .await?;
        match outcome {
            TriggerOutcome::Started(_) => done_rx
                .await
                .map_err(|_| KeeperError::Other("backup task vanished".into()))?,
            TriggerOutcome::Skipped { running } => Err(KeeperError::Other(format!(
                "backup '{running}' is already running"
            ))),
            TriggerOutcome::ShuttingDown => Err(KeeperError::Other("scheduler is shutting down".into())),
        }
    }

    /// Returns whether the state changed.
    pub async fn pause(&self) -> Result<bool> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<bool> {
        self.request(Command::Resume).await
    }

    pub async fn get_status(&self) -> Result<SchedulerStatus> {
        self.request(Command::Status).await
    }

    pub async fn get_stats(&self) -> Result<SchedulerStats> {
        Ok(self.get_status().await?.stats)
    }

    /// Deliver a timed task as if its trigger had fired.
    pub async fn fire(&self, task: ScheduledTask) -> Result<()> {
        self.tx
            .send(Command::Fire(task))
            .await
            .map_err(|_| KeeperError::Other("scheduler is not running".into()))
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.ops.list_backups().await
    }

    /// Apply retention now, leaving a running backup alone.
    pub async fn run_cleanup(&self) -> Result<SweepOutcome> {
        let busy = self.running_job().await?;
        self.ops.cleanup(busy.as_ref()).await
    }

    /// Check every stored backup except one still being written.
    pub async fn run_integrity_check(&self) -> Result<IntegritySweep> {
        let busy = self.running_job().await?;
        self.ops.integrity_sweep(busy.as_ref()).await
    }

    async fn running_job(&self) -> Result<Option<BackupId>> {
        Ok(self.get_status().await?.current_job.map(|j| j.id))
    }

    pub async fn check_backup(&self, id: &BackupId) -> Result<IntegrityReport> {
        self.ops.verify_one(id).await
    }

    pub async fn restore(&self, id: &BackupId, destination: &Path) -> Result<RestoreOutcome> {
        self.ops.restore(id, destination).await
    }

    pub async fn send_summary(&self) -> Result<()> {
        let stats = self.get_stats().await?;
        send_summary(&self.ops, stats).await;
        Ok(())
    }

    pub async fn verify_configuration(&self) -> Result<ConfigCheck> {
        self.ops.verify_configuration().await
    }
}
