use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::error::Result;
use crate::types::RunId;

/// Retry and delay options for one job.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub delay: Option<Duration>,
    /// Total tries, including the first.
    pub attempts: u32,
    /// Base backoff between tries; doubles per failed attempt.
    pub backoff: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: None,
            attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// A unit of queued work. IDs are deterministic; enqueueing an ID that
/// is already pending or running is an idempotent no-op.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: Value,
    pub opts: JobOptions,
}

impl Job {
    pub fn new(queue: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            payload,
            opts: JobOptions::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.opts.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.opts.attempts = attempts.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with this ID is already pending or running.
    Duplicate,
}

/// Executes jobs pulled off a queue. Errors trigger broker-level retry
/// up to the job's attempt budget.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job, attempt: u32) -> std::result::Result<(), String>;
}

/// Per-queue job intake with retries, delays, deduplication, and a
/// concurrency limit. External brokers (BullMQ/PGBoss style) implement
/// the same interface out of tree.
#[async_trait]
pub trait JobBroker: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome>;

    /// Attach a worker pool to a queue. Idempotent per queue name: the
    /// first registration wins.
    async fn process(&self, queue: &str, concurrency: usize, handler: Arc<dyn JobHandler>)
        -> Result<()>;

    /// Best-effort removal of pending jobs belonging to a run. Running
    /// jobs are left to finish; their results are discarded upstream.
    async fn drain_run(&self, run_id: RunId) -> Result<usize>;

    async fn pending(&self, queue: &str) -> Result<usize>;
}

/// In-process broker backed by per-queue FIFO deques and tokio tasks.
pub struct InProcessBroker {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
}

struct QueueState {
    name: String,
    pending: Mutex<VecDeque<Job>>,
    /// IDs pending or currently executing.
    inflight: Mutex<HashSet<String>>,
    notify: Notify,
    started: Mutex<bool>,
}

impl InProcessBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
        })
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: name.to_string(),
                    pending: Mutex::new(VecDeque::new()),
                    inflight: Mutex::new(HashSet::new()),
                    notify: Notify::new(),
                    started: Mutex::new(false),
                })
            })
            .clone()
    }
}

#[async_trait]
impl JobBroker for InProcessBroker {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        let state = self.queue(&job.queue);

        {
            let mut inflight = state.inflight.lock().unwrap();
            if !inflight.insert(job.id.clone()) {
                tracing::debug!(queue = %job.queue, job_id = %job.id, "duplicate job suppressed");
                return Ok(EnqueueOutcome::Duplicate);
            }
        }

        match job.opts.delay {
            Some(delay) => {
                // Delayed jobs park on a timer task, then join the FIFO.
                let state = state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state.pending.lock().unwrap().push_back(job);
                    state.notify.notify_one();
                });
            }
            None => {
                state.pending.lock().unwrap().push_back(job);
                state.notify.notify_one();
            }
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn process(
        &self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        let state = self.queue(queue);
        {
            let mut started = state.started.lock().unwrap();
            if *started {
                return Ok(());
            }
            *started = true;
        }

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        tokio::spawn(async move {
            loop {
                let job = loop {
                    if let Some(job) = state.pending.lock().unwrap().pop_front() {
                        break job;
                    }
                    state.notify.notified().await;
                };

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let handler = handler.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let mut backoff = job.opts.backoff;
                    for attempt in 1..=job.opts.attempts {
                        match handler.run(&job, attempt).await {
                            Ok(()) => break,
                            Err(reason) if attempt < job.opts.attempts => {
                                tracing::warn!(
                                    queue = %state.name,
                                    job_id = %job.id,
                                    attempt,
                                    %reason,
                                    "job attempt failed, retrying"
                                );
                                tokio::time::sleep(backoff).await;
                                backoff *= 2;
                            }
                            Err(reason) => {
                                tracing::error!(
                                    queue = %state.name,
                                    job_id = %job.id,
                                    attempt,
                                    %reason,
                                    "job exhausted its retry budget"
                                );
                            }
                        }
                    }
                    state.inflight.lock().unwrap().remove(&job.id);
                });
            }
        });
        Ok(())
    }

    async fn drain_run(&self, run_id: RunId) -> Result<usize> {
        let prefix = format!("{run_id}__");
        let queues: Vec<Arc<QueueState>> = self.queues.lock().unwrap().values().cloned().collect();

        let mut removed = 0;
        for state in queues {
            let mut pending = state.pending.lock().unwrap();
            let before = pending.len();
            let mut inflight = state.inflight.lock().unwrap();
            pending.retain(|job| {
                let drop = job.id.starts_with(&prefix);
                if drop {
                    inflight.remove(&job.id);
                }
                !drop
            });
            removed += before - pending.len();
        }
        Ok(removed)
    }

    async fn pending(&self, queue: &str) -> Result<usize> {
        Ok(self.queue(queue).pending.lock().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Countdown {
        runs: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl JobHandler for Countdown {
        async fn run(&self, _job: &Job, attempt: u32) -> std::result::Result<(), String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if attempt <= self.fail_first {
                Err("transient".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn duplicate_ids_execute_once() {
        let broker = InProcessBroker::new();
        let handler = Arc::new(Countdown {
            runs: AtomicU32::new(0),
            fail_first: 0,
        });
        broker.process("q", 2, handler.clone()).await.unwrap();

        let job = Job::new("q", "run__step", serde_json::json!({}));
        assert_eq!(
            broker.enqueue(job.clone()).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            broker.enqueue(job).await.unwrap(),
            EnqueueOutcome::Duplicate
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_jobs_retry_up_to_budget() {
        let broker = InProcessBroker::new();
        let handler = Arc::new(Countdown {
            runs: AtomicU32::new(0),
            fail_first: 2,
        });
        broker.process("q", 1, handler.clone()).await.unwrap();

        let mut job = Job::new("q", "retry-job", serde_json::json!({}));
        job.opts.attempts = 3;
        job.opts.backoff = Duration::from_millis(5);
        broker.enqueue(job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn delayed_jobs_run_after_the_delay() {
        let broker = InProcessBroker::new();
        let handler = Arc::new(Countdown {
            runs: AtomicU32::new(0),
            fail_first: 0,
        });
        broker.process("q", 1, handler.clone()).await.unwrap();

        let job =
            Job::new("q", "later", serde_json::json!({})).with_delay(Duration::from_millis(50));
        broker.enqueue(job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_removes_pending_jobs_for_a_run() {
        let broker = InProcessBroker::new();
        let run_id = RunId::new();
        // No worker attached: jobs stay pending.
        broker
            .enqueue(Job::new("q", format!("{run_id}__a"), serde_json::json!({})))
            .await
            .unwrap();
        broker
            .enqueue(Job::new("q", format!("{run_id}__b"), serde_json::json!({})))
            .await
            .unwrap();
        broker
            .enqueue(Job::new("q", "other__c", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(broker.drain_run(run_id).await.unwrap(), 2);
        assert_eq!(broker.pending("q").await.unwrap(), 1);

        // Drained IDs can be enqueued again.
        assert_eq!(
            broker
                .enqueue(Job::new("q", format!("{run_id}__a"), serde_json::json!({})))
                .await
                .unwrap(),
            EnqueueOutcome::Enqueued
        );
    }
}
