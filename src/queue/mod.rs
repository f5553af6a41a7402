//! Named, durable job queues.
//!
//! A [`JobQueue`] is built once at startup from the set of [`JobHandler`]s the
//! process serves. Each handler gets its own queue keyed by
//! [`JobHandler::key`], with its own journal file. Producers call
//! [`JobQueue::add`], which returns once the job is journaled; workers started
//! by [`JobQueue::process`] execute it later.
//!
//! Delivery is at-least-once. A job that was pending or running when the
//! process stopped is handed to a worker again on the next start. Failed
//! attempts are retried per [`RetryPolicy`]; the last failure is terminal and
//! reported as a [`JobOutcome::Failed`].

mod job;
mod worker;

pub use job::{Job, JobError, JobHandler, JobOutcome, JobStatus, JournalEvent};

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::info;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::compactor::Compact;
use crate::observability;
use crate::wal::{Wal, WalError, WalWriter};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("queue registered twice: {0}")]
    DuplicateQueue(&'static str),
    #[error("workers already started")]
    AlreadyProcessing,
    #[error("payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[from] WalError),
    #[error("journal could not be opened: {0}")]
    Io(#[from] io::Error),
}

/// How failed attempts are retried. `max_attempts` counts the first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub workers_per_queue: usize,
    pub retry: RetryPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            workers_per_queue: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// One registered queue: its handler, journal, job table and ready list.
pub(super) struct NamedQueue {
    pub(super) key: &'static str,
    pub(super) handler: Arc<dyn JobHandler>,
    journal: WalWriter<JournalEvent>,
    pub(super) jobs: DashMap<Ulid, Job>,
    ready_tx: mpsc::UnboundedSender<Ulid>,
    pub(super) ready_rx: Mutex<mpsc::UnboundedReceiver<Ulid>>,
    /// Journal appends hold this shared; compaction holds it exclusively.
    compaction_gate: RwLock<()>,
}

impl NamedQueue {
    fn open(handler: Arc<dyn JobHandler>, path: &Path) -> Result<Self, QueueError> {
        let key = handler.key();
        let events: Vec<JournalEvent> = Wal::replay(path)?;
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let queue = Self {
            key,
            handler,
            journal: WalWriter::spawn(Wal::open(path)?),
            jobs: DashMap::new(),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            compaction_gate: RwLock::new(()),
        };
        for event in events {
            queue.apply(event);
        }

        // Anything without a terminal record goes back to the workers, oldest first.
        let mut unfinished: Vec<Ulid> = queue
            .jobs
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| *e.key())
            .collect();
        unfinished.sort();
        for id in &unfinished {
            if let Some(mut job) = queue.jobs.get_mut(id) {
                job.status = JobStatus::Pending;
            }
            let _ = queue.ready_tx.send(*id);
        }
        if !unfinished.is_empty() {
            info!("Queue {key}: redelivering {} unfinished job(s)", unfinished.len());
        }
        Ok(queue)
    }

    fn apply(&self, event: JournalEvent) {
        match event {
            JournalEvent::Enqueued { id, payload, enqueued_at, attempts } => {
                self.jobs.insert(
                    id,
                    Job {
                        id,
                        queue: self.key.to_string(),
                        payload,
                        status: JobStatus::Pending,
                        attempts,
                        last_error: None,
                        enqueued_at,
                    },
                );
            }
            JournalEvent::Started { id, attempt } => {
                self.set_status(id, JobStatus::Processing, attempt, None);
            }
            JournalEvent::Completed { id } => {
                if let Some(mut job) = self.jobs.get_mut(&id) {
                    job.status = JobStatus::Completed;
                }
            }
            JournalEvent::Failed { id, attempt, error, terminal } => {
                let status = if terminal { JobStatus::Failed } else { JobStatus::Pending };
                self.set_status(id, status, attempt, Some(error));
            }
        }
    }

    fn set_status(&self, id: Ulid, status: JobStatus, attempts: u32, error: Option<String>) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.status = status;
            job.attempts = attempts;
            if error.is_some() {
                job.last_error = error;
            }
        }
    }

    /// Journal a worker-side transition and apply it to the job table under
    /// one shared gate guard. Compaction snapshots the table, so the two must
    /// never be observed apart.
    ///
    /// Append failures are logged, not propagated: the worst case is one extra
    /// delivery after a restart.
    pub(super) async fn transition(&self, event: JournalEvent) {
        let _gate = self.compaction_gate.read().await;
        if let Err(e) = self.journal.append(event.clone()).await {
            tracing::error!("Queue {}: journal append failed: {e}", self.key);
        }
        self.apply(event);
    }
}

/// Registers handlers and opens their journals.
pub struct JobQueueBuilder {
    data_dir: PathBuf,
    options: QueueOptions,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl JobQueueBuilder {
    pub fn register(mut self, handler: impl JobHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Open one journal per handler and queue up any unfinished jobs.
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<JobQueue, QueueError> {
        let mut queues = HashMap::new();
        for handler in self.handlers {
            let key = handler.key();
            if queues.contains_key(key) {
                return Err(QueueError::DuplicateQueue(key));
            }
            let path = self.data_dir.join(journal_file_name(key));
            queues.insert(key, Arc::new(NamedQueue::open(handler, &path)?));
        }
        Ok(JobQueue {
            inner: Arc::new(QueueInner {
                queues,
                options: self.options,
                started: AtomicBool::new(false),
                clock: Arc::new(SystemClock),
            }),
        })
    }
}

fn journal_file_name(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("queue-{safe}.wal")
}

struct QueueInner {
    queues: HashMap<&'static str, Arc<NamedQueue>>,
    options: QueueOptions,
    started: AtomicBool,
    clock: Arc<dyn Clock>,
}

/// Handle to the process-wide set of queues. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("queues", &self.keys())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl JobQueue {
    pub fn builder(data_dir: impl Into<PathBuf>, options: QueueOptions) -> JobQueueBuilder {
        JobQueueBuilder {
            data_dir: data_dir.into(),
            options,
            handlers: Vec::new(),
        }
    }

    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.inner.queues.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Journal `payload` on queue `key` and make it visible to workers.
    /// Returns once the job is durable; does not wait for it to run.
    pub async fn add<T: Serialize + ?Sized>(&self, key: &str, payload: &T) -> Result<Ulid, QueueError> {
        let queue = self
            .inner
            .queues
            .get(key)
            .ok_or_else(|| QueueError::UnknownQueue(key.to_string()))?;
        let payload = serde_json::to_string(payload)?;
        let id = Ulid::new();
        let enqueued_at = self.inner.clock.now_ms();

        {
            let _gate = queue.compaction_gate.read().await;
            queue
                .journal
                .append(JournalEvent::Enqueued {
                    id,
                    payload: payload.clone(),
                    enqueued_at,
                    attempts: 0,
                })
                .await?;
            queue.apply(JournalEvent::Enqueued { id, payload, enqueued_at, attempts: 0 });
        }
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = queue.ready_tx.send(id);

        metrics::counter!(observability::JOBS_ENQUEUED_TOTAL, "queue" => queue.key).increment(1);
        info!("Queue {}: job {id} enqueued", queue.key);
        Ok(id)
    }

    /// Start `workers_per_queue` workers on every registered queue.
    ///
    /// Every job's final result arrives on the returned [`Workers::outcomes`].
    /// Can only be called once per queue set.
    pub fn process(&self) -> Result<Workers, QueueError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyProcessing);
        }
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for queue in self.inner.queues.values() {
            for _ in 0..self.inner.options.workers_per_queue.max(1) {
                handles.push(tokio::spawn(worker::run(
                    queue.clone(),
                    self.inner.options.retry,
                    outcome_tx.clone(),
                )));
            }
            info!(
                "Queue {}: {} worker(s) started",
                queue.key,
                self.inner.options.workers_per_queue.max(1)
            );
        }
        Ok(Workers { handles, outcomes })
    }

    pub fn job(&self, key: &str, id: &Ulid) -> Option<Job> {
        self.inner
            .queues
            .get(key)
            .and_then(|q| q.jobs.get(id).map(|e| e.value().clone()))
    }

    /// Jobs of `key` that have not reached a terminal state.
    pub fn unfinished(&self, key: &str) -> Vec<Job> {
        let Some(queue) = self.inner.queues.get(key) else {
            return Vec::new();
        };
        let mut jobs: Vec<Job> = queue
            .jobs
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.value().clone())
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }
}

/// Running workers plus the outcome stream they report to.
pub struct Workers {
    handles: Vec<JoinHandle<()>>,
    pub outcomes: mpsc::UnboundedReceiver<JobOutcome>,
}

impl Workers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop all workers. A job cut off mid-run is redelivered on next start.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[async_trait]
impl Compact for JobQueue {
    fn name(&self) -> &'static str {
        "jobs"
    }

    async fn appends_since_compact(&self) -> u64 {
        let mut total = 0;
        for queue in self.inner.queues.values() {
            total += queue.journal.appends_since_compact().await;
        }
        total
    }

    /// Keep only unfinished jobs, in the journal and in memory.
    async fn compact(&self) -> Result<(), WalError> {
        for queue in self.inner.queues.values() {
            let _exclusive = queue.compaction_gate.write().await;
            queue.jobs.retain(|_, job| !job.status.is_terminal());
            let mut live: Vec<Job> = queue.jobs.iter().map(|e| e.value().clone()).collect();
            live.sort_by_key(|j| j.id);
            let events = live
                .into_iter()
                .map(|job| JournalEvent::Enqueued {
                    id: job.id,
                    payload: job.payload,
                    enqueued_at: job.enqueued_at,
                    attempts: job.attempts,
                })
                .collect();
            queue.journal.compact(events).await?;
        }
        Ok(())
    }
}
