//! Single-process FIFO job queue with N workers (spec §4.9).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use settld_core::{constants::backoff_delay_ms, SettldError};

pub type VerifyHandler = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub ok: bool,
    pub dead_letter: bool,
    pub error: Option<String>,
}

struct Job {
    payload: Value,
    attempt: u32,
    respond: oneshot::Sender<JobOutcome>,
}

/// FIFO job queue: `submit` enqueues a payload and returns a future resolved
/// on the job's terminal outcome, retried up to `max_attempts` times with
/// `backoffMs·2^(attempt-1)` delay between tries (spec §4.9, §5).
pub struct VerifyQueue {
    sender: mpsc::UnboundedSender<Job>,
    closed: Arc<AtomicBool>,
    pending: Arc<AtomicU64>,
    max_attempts: u32,
    backoff_ms: u64,
}

impl VerifyQueue {
    pub fn new(handler: VerifyHandler, workers: usize, max_attempts: u32, backoff_ms: u64) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let closed = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicU64::new(0));

        for worker_id in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let closed = Arc::clone(&closed);
            let pending = Arc::clone(&pending);
            let resubmit = sender.clone();

            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else { break };

                    if closed.load(Ordering::Acquire) {
                        pending.fetch_sub(1, Ordering::AcqRel);
                        let _ = job.respond.send(JobOutcome {
                            ok: false,
                            dead_letter: false,
                            error: Some(SettldError::VerifyQueueClosed.code().to_string()),
                        });
                        continue;
                    }

                    match handler(job.payload.clone()).await {
                        Ok(()) => {
                            pending.fetch_sub(1, Ordering::AcqRel);
                            let _ = job.respond.send(JobOutcome { ok: true, dead_letter: false, error: None });
                        }
                        Err(e) if job.attempt < max_attempts => {
                            let delay = backoff_delay_ms(backoff_ms, job.attempt);
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            warn!(worker_id, attempt = job.attempt, error = %e, "verify queue job failed, requeueing");
                            let requeued = Job { payload: job.payload, attempt: job.attempt + 1, respond: job.respond };
                            if resubmit.send(requeued).is_err() {
                                pending.fetch_sub(1, Ordering::AcqRel);
                            }
                        }
                        Err(e) => {
                            pending.fetch_sub(1, Ordering::AcqRel);
                            warn!(worker_id, attempts = job.attempt, error = %e, "verify queue job exhausted retries, dead-lettering");
                            let _ = job.respond.send(JobOutcome { ok: false, dead_letter: true, error: Some(e) });
                        }
                    }
                }
            });
        }

        VerifyQueue { sender, closed, pending, max_attempts, backoff_ms }
    }

    /// Enqueues `payload`. The returned future resolves once the job reaches
    /// a terminal state (delivered, or dead-lettered after `max_attempts`).
    pub async fn submit(&self, payload: Value) -> JobOutcome {
        if self.closed.load(Ordering::Acquire) {
            return JobOutcome { ok: false, dead_letter: false, error: Some(SettldError::VerifyQueueClosed.code().to_string()) };
        }
        let (tx, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(Job { payload, attempt: 1, respond: tx }).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return JobOutcome { ok: false, dead_letter: false, error: Some(SettldError::VerifyQueueClosed.code().to_string()) };
        }
        rx.await.unwrap_or(JobOutcome {
            ok: false,
            dead_letter: false,
            error: Some(SettldError::VerifyQueueClosed.code().to_string()),
        })
    }

    /// Stops accepting new work and causes any job a worker has not yet
    /// started to resolve immediately with `VERIFY_QUEUE_CLOSED`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn size(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits until the queue is empty or `timeout_ms` elapses.
    pub async fn drain(&self, timeout_ms: u64) -> Result<(), SettldError> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while self.size() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err(SettldError::VerifyQueueDrainTimeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms
    }
}
