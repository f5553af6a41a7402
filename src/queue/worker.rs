use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::observability;

use super::job::{JobError, JobOutcome, JournalEvent};
use super::{NamedQueue, RetryPolicy};

/// Pull job ids off the queue until it closes. Several workers may share one queue.
pub(super) async fn run(
    queue: Arc<NamedQueue>,
    retry: RetryPolicy,
    outcomes: mpsc::UnboundedSender<JobOutcome>,
) {
    loop {
        let next = {
            let mut ready = queue.ready_rx.lock().await;
            ready.recv().await
        };
        let Some(id) = next else { break };
        if let Some(outcome) = process_job(&queue, id, retry).await {
            // Nobody listening is fine; the outcome is already logged.
            let _ = outcomes.send(outcome);
        }
    }
    tracing::debug!("worker for {} stopped", queue.key);
}

async fn process_job(queue: &NamedQueue, id: Ulid, retry: RetryPolicy) -> Option<JobOutcome> {
    let (payload, mut attempts) = {
        let job = queue.jobs.get(&id)?;
        if job.status.is_terminal() {
            return None;
        }
        (job.payload.clone(), job.attempts)
    };

    loop {
        attempts += 1;
        queue.transition(JournalEvent::Started { id, attempt: attempts }).await;

        let started = Instant::now();
        let result = match serde_json::from_str(&payload) {
            Ok(value) => AssertUnwindSafe(queue.handler.handle(value))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(JobError::Delivery("handler panicked".into()))),
            Err(e) => Err(JobError::from(e)),
        };
        metrics::histogram!(observability::JOB_DURATION_SECONDS, "queue" => queue.key)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                queue.transition(JournalEvent::Completed { id }).await;
                metrics::counter!(observability::JOBS_COMPLETED_TOTAL, "queue" => queue.key).increment(1);
                info!("Queue {}: job {id} completed", queue.key);
                return Some(JobOutcome::Completed { queue: queue.key, job_id: id, attempts });
            }
            Err(e) => {
                let terminal = attempts >= retry.max_attempts || matches!(e, JobError::Payload(_));
                let message = e.to_string();
                queue
                    .transition(JournalEvent::Failed {
                        id,
                        attempt: attempts,
                        error: message.clone(),
                        terminal,
                    })
                    .await;

                if terminal {
                    metrics::counter!(observability::JOBS_FAILED_TOTAL, "queue" => queue.key).increment(1);
                    error!("Queue {}: FAILED job {id} after {attempts} attempt(s): {message}", queue.key);
                    return Some(JobOutcome::Failed {
                        queue: queue.key,
                        job_id: id,
                        attempts,
                        error: message,
                    });
                }

                warn!(
                    "Queue {}: job {id} attempt {attempts} failed, retrying in {:?}: {message}",
                    queue.key, retry.delay
                );
                tokio::time::sleep(retry.delay).await;
            }
        }
    }
}
