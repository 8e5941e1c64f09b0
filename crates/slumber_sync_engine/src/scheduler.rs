//! Periodic background reconciliation.
//!
//! The host platform wakes the app at most once per scheduled instant and
//! gives it a bounded window to finish. [`BackgroundScheduler`] turns each
//! wake-up into one reconciliation, reports the result exactly once and
//! always books the next wake-up, whether or not the cycle succeeded.

use crate::channel::MessageChannel;
use crate::config::{RetryConfig, SyncConfig};
use crate::coordinator::{ReconcileTrigger, ReconciliationSession, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::store::EntityStore;
use parking_lot::Mutex;
use slumber_codec::Timestamp;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identifier the host uses for the reconciliation task.
pub const RECONCILE_TASK_ID: &str = "slumber.reconcile";

/// Something that can run one reconciliation cycle.
pub trait Reconciler: Send + Sync + 'static {
    /// Runs one cycle.
    fn run_reconciliation(
        &self,
        trigger: ReconcileTrigger,
    ) -> impl Future<Output = SyncResult<ReconciliationSession>> + Send;
}

impl<C: MessageChannel, S: EntityStore> Reconciler for SyncCoordinator<C, S> {
    fn run_reconciliation(
        &self,
        trigger: ReconcileTrigger,
    ) -> impl Future<Output = SyncResult<ReconciliationSession>> + Send {
        self.reconcile(trigger)
    }
}

/// Platform background-task facility.
pub trait SchedulerHost: Send + Sync + 'static {
    /// Asks to be woken at or after `at`. Replaces any earlier request.
    fn schedule_wakeup(&self, at: Timestamp) -> SyncResult<()>;
}

/// Kind of a woken task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Run a reconciliation.
    Reconcile,
    /// An identifier this app never registered.
    Unrecognized(String),
}

impl TaskKind {
    /// Maps a host task identifier to a kind.
    pub fn from_identifier(identifier: &str) -> Self {
        if identifier == RECONCILE_TASK_ID {
            TaskKind::Reconcile
        } else {
            TaskKind::Unrecognized(identifier.to_string())
        }
    }

    /// The host task identifier.
    pub fn identifier(&self) -> &str {
        match self {
            TaskKind::Reconcile => RECONCILE_TASK_ID,
            TaskKind::Unrecognized(identifier) => identifier,
        }
    }
}

/// What the app reports back to the host for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskReport {
    /// The task ran to completion.
    Succeeded,
    /// The task failed or ran out of time.
    Failed,
}

/// Reports a task's completion to the host exactly once.
///
/// Dropping an uncompleted handle reports [`TaskReport::Failed`].
#[derive(Debug)]
pub struct TaskCompletion {
    tx: Option<oneshot::Sender<TaskReport>>,
}

impl TaskCompletion {
    /// Creates a handle and the receiver the host listens on.
    pub fn channel() -> (Self, oneshot::Receiver<TaskReport>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Reports the outcome.
    pub fn complete(mut self, report: TaskReport) {
        self.finish(report);
    }

    fn finish(&mut self, report: TaskReport) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(report);
        }
    }
}

impl Drop for TaskCompletion {
    fn drop(&mut self) {
        self.finish(TaskReport::Failed);
    }
}

/// One wake-up handed to the app by the host.
#[derive(Debug)]
pub struct BackgroundTask {
    /// What the host woke the app for.
    pub kind: TaskKind,
    /// Time the host allows before it considers the task expired.
    pub window: Duration,
    /// Completion handle.
    pub completion: TaskCompletion,
}

impl BackgroundTask {
    /// Creates a task and the receiver for its report.
    pub fn new(kind: TaskKind, window: Duration) -> (Self, oneshot::Receiver<TaskReport>) {
        let (completion, report) = TaskCompletion::channel();
        (
            Self {
                kind,
                window,
                completion,
            },
            report,
        )
    }
}

/// Drives periodic reconciliation from host wake-ups.
pub struct BackgroundScheduler<R: Reconciler, H: SchedulerHost> {
    reconciler: Arc<R>,
    host: Arc<H>,
    interval: Duration,
    retry: RetryConfig,
    consecutive_failures: AtomicU32,
}

impl<R: Reconciler, H: SchedulerHost> BackgroundScheduler<R, H> {
    /// Creates a scheduler using the interval and retry policy from `config`.
    pub fn new(reconciler: Arc<R>, host: Arc<H>, config: &SyncConfig) -> Self {
        Self {
            reconciler,
            host,
            interval: config.reconcile_interval,
            retry: config.retry.clone(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Books the first wake-up one interval from now.
    pub fn start(&self) -> SyncResult<Timestamp> {
        self.schedule_next(self.interval)
    }

    /// Books a wake-up `after` from now.
    pub fn schedule_next(&self, after: Duration) -> SyncResult<Timestamp> {
        let at = Timestamp::now().saturating_add(after);
        self.host.schedule_wakeup(at)?;
        debug!(%at, delay = ?after, "background wake-up scheduled");
        Ok(at)
    }

    /// Cycles that failed in a row.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Delay before the next wake-up.
    ///
    /// The regular interval, or a backoff delay capped at that interval
    /// while cycles keep failing.
    pub fn next_delay(&self) -> Duration {
        match self.consecutive_failures() {
            0 => self.interval,
            failures => self.retry.delay_for_attempt(failures).min(self.interval),
        }
    }

    /// Runs one woken task to completion and books the next wake-up.
    ///
    /// An unrecognized task is reported failed without touching the
    /// reconciler and without rescheduling.
    pub async fn handle_task(&self, task: BackgroundTask) -> TaskReport {
        let BackgroundTask {
            kind,
            window,
            completion,
        } = task;

        if let TaskKind::Unrecognized(identifier) = &kind {
            warn!(task = %identifier, "unrecognized background task");
            completion.complete(TaskReport::Failed);
            return TaskReport::Failed;
        }

        let cycle = self
            .reconciler
            .run_reconciliation(ReconcileTrigger::SchedulerTick);
        let report = match tokio::time::timeout(window, cycle).await {
            Ok(Ok(session)) => {
                debug!(sequence = session.sequence, outcome = ?session.outcome, "background reconciliation done");
                TaskReport::Succeeded
            }
            Ok(Err(err)) => {
                warn!(error = %err, "background reconciliation failed");
                TaskReport::Failed
            }
            Err(_) => {
                warn!(window = ?window, "background reconciliation exceeded its window");
                TaskReport::Failed
            }
        };
        completion.complete(report);

        match report {
            TaskReport::Succeeded => self.consecutive_failures.store(0, Ordering::SeqCst),
            TaskReport::Failed => {
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            }
        }
        if let Err(err) = self.schedule_next(self.next_delay()) {
            warn!(error = %err, "could not book next background wake-up");
        }
        report
    }

    /// Handles tasks until the host drops its sender.
    pub async fn run(&self, mut tasks: mpsc::UnboundedReceiver<BackgroundTask>) {
        info!(interval = ?self.interval, "background scheduler running");
        while let Some(task) = tasks.recv().await {
            self.handle_task(task).await;
        }
        debug!("background scheduler stopped");
    }
}

/// In-process [`SchedulerHost`] backed by Tokio timers.
///
/// Each wake-up becomes a [`BackgroundTask`] on a channel, to be consumed
/// by [`BackgroundScheduler::run`]. Only the most recent request is kept.
pub struct TokioHost {
    tasks: mpsc::UnboundedSender<BackgroundTask>,
    window: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
    wakeups: Mutex<Vec<Timestamp>>,
}

impl TokioHost {
    /// Creates a host granting `window` per task, and the task receiver.
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<BackgroundTask>) {
        let (tasks, rx) = mpsc::unbounded_channel();
        (
            Self {
                tasks,
                window,
                pending: Mutex::new(None),
                wakeups: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Delivers a task immediately, as a host would on an expedited wake-up.
    pub fn submit(&self, kind: TaskKind) -> SyncResult<oneshot::Receiver<TaskReport>> {
        let (task, report) = BackgroundTask::new(kind, self.window);
        self.tasks
            .send(task)
            .map_err(|_| SyncError::Scheduler("task receiver dropped".into()))?;
        Ok(report)
    }

    /// Every wake-up requested so far.
    pub fn wakeups(&self) -> Vec<Timestamp> {
        self.wakeups.lock().clone()
    }
}

impl SchedulerHost for TokioHost {
    fn schedule_wakeup(&self, at: Timestamp) -> SyncResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| SyncError::Scheduler(err.to_string()))?;
        let delay = at.duration_since(Timestamp::now()).unwrap_or_default();
        let tasks = self.tasks.clone();
        let window = self.window;

        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let (task, report) = BackgroundTask::new(TaskKind::Reconcile, window);
            if tasks.send(task).is_ok() {
                tokio::spawn(async move {
                    if let Ok(report) = report.await {
                        debug!(?report, "background task reported");
                    }
                });
            }
        });

        if let Some(previous) = self.pending.lock().replace(handle) {
            previous.abort();
        }
        self.wakeups.lock().push(at);
        Ok(())
    }
}
