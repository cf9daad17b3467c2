//! Task engine: persisted tasks executed on a bounded worker pool.
//!
//! `submit` stores a `pending` row and queues it; a dispatcher hands queued
//! tasks to workers as semaphore permits free up. Each worker moves its task
//! to `running`, runs the executor under a time limit and records exactly
//! one terminal status.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use panelgate_core::config::TaskConfig;
use serde_json::Value;
use sqlx::SqliteConnection;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, instrument, warn};

use super::executor::{ExecutionError, ExecutorRegistry, TaskExecutor};
use super::types::{TaskType, TaskView};
use crate::audit::{AuditSink, NullAudit, attempt};
use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::storage::PanelDatabase;
use crate::storage::queries_tasks::insert_task;

/// Error recorded on tasks found `running` at startup.
const ORPHANED_MESSAGE: &str = "Interrupted by server restart";

/// Tries at moving a task to `running` before it is failed instead.
const START_ATTEMPTS: u32 = 4;
/// Delay before the second try; doubled for each one after.
const START_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the task engine.
#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    /// Tasks allowed to execute at once.
    pub workers: usize,
    /// Hard limit on a single execution.
    pub max_runtime: Duration,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self::from(&TaskConfig::default())
    }
}

impl From<&TaskConfig> for TaskEngineConfig {
    fn from(c: &TaskConfig) -> Self {
        Self {
            workers: c.workers.max(1),
            max_runtime: Duration::from_secs(c.max_runtime_secs),
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone)]
struct Job {
    task_id: String,
    task_type: TaskType,
    payload: Value,
}

/// A task persisted inside a caller's transaction that still has to be
/// handed to the workers once that transaction commits.
#[must_use = "a prepared task only runs after TaskEngine::dispatch"]
#[derive(Debug)]
pub struct PreparedTask {
    job: Job,
}

impl PreparedTask {
    pub fn task_id(&self) -> &str {
        &self.job.task_id
    }
}

/// State shared by workers; holds no queue sender so the dispatcher stops
/// once every `TaskEngine` handle is dropped.
struct Worker {
    db: PanelDatabase,
    executors: ExecutorRegistry,
    max_runtime: Duration,
}

#[derive(Clone)]
pub struct TaskEngine {
    worker: Arc<Worker>,
    queue: mpsc::UnboundedSender<Job>,
    audit: Arc<dyn AuditSink>,
}

impl TaskEngine {
    /// Create the engine and spawn its dispatcher. Must be called within a
    /// Tokio runtime.
    pub fn start(db: PanelDatabase, executors: ExecutorRegistry, config: TaskEngineConfig) -> Self {
        let worker = Arc::new(Worker {
            db,
            executors,
            max_runtime: config.max_runtime,
        });
        let (queue, rx) = mpsc::unbounded_channel();
        let workers = config.workers.max(1);

        info!(
            workers,
            max_runtime_secs = config.max_runtime.as_secs(),
            executors = worker.executors.len(),
            "Task engine started"
        );
        tokio::spawn(dispatch_loop(Arc::clone(&worker), rx, workers));

        Self {
            worker,
            queue,
            audit: Arc::new(NullAudit),
        }
    }

    /// Record direct submissions in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Persist a `pending` task and queue it. Returns without waiting for
    /// execution.
    pub async fn submit(&self, user_id: &str, task_type: &str, payload: Value) -> Result<String> {
        let result = self.persist_and_queue(user_id, task_type, payload).await;
        self.audit
            .append(attempt(Some(user_id), "tasks", task_type, &result));
        result
    }

    #[instrument(skip(self, payload))]
    async fn persist_and_queue(
        &self,
        user_id: &str,
        task_type: &str,
        payload: Value,
    ) -> Result<String> {
        let task_type = self.executable_type(task_type)?;
        let task_id = uuid::Uuid::new_v4().to_string();
        self.worker
            .db
            .create_task(&task_id, user_id, task_type.as_str(), &payload.to_string())
            .await?;

        info!(task_id = %task_id, user_id, task_type = %task_type, "Task submitted");
        self.enqueue(Job {
            task_id: task_id.clone(),
            task_type,
            payload,
        });
        Ok(task_id)
    }

    /// Persist a `pending` task inside the caller's transaction. The task
    /// must be passed to [`dispatch`](Self::dispatch) after commit.
    pub async fn prepare_in(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        task_type: TaskType,
        payload: Value,
    ) -> Result<PreparedTask> {
        let task_type = self.executable_type(task_type.as_str())?;
        let task_id = uuid::Uuid::new_v4().to_string();
        insert_task(conn, &task_id, user_id, task_type.as_str(), &payload.to_string()).await?;
        Ok(PreparedTask {
            job: Job {
                task_id,
                task_type,
                payload,
            },
        })
    }

    /// Queue a task whose row has been committed.
    pub fn dispatch(&self, prepared: PreparedTask) -> String {
        let task_id = prepared.job.task_id.clone();
        info!(task_id = %task_id, task_type = %prepared.job.task_type, "Task submitted");
        self.enqueue(prepared.job);
        task_id
    }

    /// Current status of a task.
    pub async fn status(&self, task_id: &str) -> Result<TaskView> {
        self.worker.db.get_task(task_id).await?.try_into()
    }

    /// Status visible only to the task's owner or an administrator.
    pub async fn status_for(&self, actor: &Principal, task_id: &str) -> Result<TaskView> {
        let view = self.status(task_id).await?;
        if !actor.owns_or_admin(&view.owner_id) {
            return Err(Error::Forbidden(format!("task {task_id} belongs to another user")));
        }
        Ok(view)
    }

    /// Fail tasks a previous process left `running`. Call before serving.
    pub async fn reconcile_orphaned(&self) -> Result<u64> {
        let count = self.worker.db.fail_orphaned_tasks(ORPHANED_MESSAGE).await?;
        if count > 0 {
            warn!(count, "Orphaned running tasks marked failed");
        }
        Ok(count)
    }

    /// Re-queue tasks that were persisted but never started.
    pub async fn resume_pending(&self) -> Result<usize> {
        let rows = self.worker.db.list_pending_tasks().await?;
        let mut resumed = 0;
        for row in rows {
            let payload = serde_json::from_str(&row.payload).unwrap_or(Value::Null);
            match self.executable_type(&row.task_type) {
                Ok(task_type) => {
                    self.enqueue(Job {
                        task_id: row.id,
                        task_type,
                        payload,
                    });
                    resumed += 1;
                }
                Err(e) => {
                    warn!(task_id = %row.id, error = %e, "Pending task cannot be resumed");
                    self.worker.db.fail_task(&row.id, &e.to_string()).await?;
                }
            }
        }
        if resumed > 0 {
            info!(resumed, "Pending tasks re-queued");
        }
        Ok(resumed)
    }

    fn executable_type(&self, name: &str) -> Result<TaskType> {
        let task_type: TaskType = name.parse()?;
        if !self.worker.executors.contains(task_type) {
            return Err(Error::Validation(format!(
                "no executor registered for {task_type}"
            )));
        }
        Ok(task_type)
    }

    fn enqueue(&self, job: Job) {
        if let Err(e) = self.queue.send(job) {
            // Row stays pending and is picked up by resume_pending on restart.
            error!(task_id = %e.0.task_id, "Task queue closed, task left pending");
        }
    }
}

async fn dispatch_loop(worker: Arc<Worker>, mut rx: mpsc::UnboundedReceiver<Job>, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers));
    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            worker.run(job).await;
            drop(permit);
        });
    }
    debug!("Task dispatcher stopped");
}

impl Worker {
    async fn run(&self, job: Job) {
        let task_id = job.task_id.as_str();

        let started = retry_with_backoff(START_ATTEMPTS, START_BACKOFF, || {
            self.db.mark_task_running(task_id)
        })
        .await;
        match started {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id, "Task no longer pending, skipped");
                return;
            }
            Err(e) => {
                error!(task_id, error = %e, "Failed to mark task running");
                // Never started, so failing it cannot cause a second run.
                let message = format!("task could not be started: {e}");
                if let Err(e) = self.db.fail_task(task_id, &message).await {
                    error!(task_id, error = %e, "Task left pending until the next start");
                }
                return;
            }
        }

        let outcome = match self.executors.get(job.task_type) {
            Some(executor) => self.execute(executor, job.payload).await,
            None => Err(ExecutionError::Failed(format!(
                "no executor registered for {}",
                job.task_type
            ))),
        };

        let recorded = match &outcome {
            Ok(result) => self.db.complete_task(task_id, &result.to_string()).await,
            Err(e) => self.db.fail_task(task_id, &e.to_string()).await,
        };

        match (recorded, outcome) {
            (Ok(_), Ok(_)) => info!(task_id, task_type = %job.task_type, "Task completed"),
            (Ok(_), Err(e)) => warn!(task_id, task_type = %job.task_type, error = %e, "Task failed"),
            (Err(db_err), _) => {
                // Left running; reconciled to failed on the next start.
                error!(task_id, error = %db_err, "Failed to record task outcome");
            }
        }
    }

    async fn execute(
        &self,
        executor: Arc<dyn TaskExecutor>,
        payload: Value,
    ) -> std::result::Result<Value, ExecutionError> {
        // Spawned so a panicking executor surfaces as a JoinError.
        let mut handle = tokio::spawn(async move { executor.execute(payload).await });
        match tokio::time::timeout(self.max_runtime, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(ExecutionError::Panicked),
            Ok(Err(join_err)) => Err(ExecutionError::Failed(join_err.to_string())),
            Err(_) => {
                handle.abort();
                Err(ExecutionError::TimedOut(self.max_runtime))
            }
        }
    }
}

/// Run `op` up to `attempts` times, sleeping `backoff` (doubling) between
/// failures. Returns the last error if every try fails.
async fn retry_with_backoff<T, E, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut delay = backoff;
    let mut tried = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if tried < attempts => {
                warn!(attempt = tried, error = %e, "Retrying after transient error");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                tried += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
