use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::storage::Store;

/// Lease duration for distributed job ownership. A holder renews by
/// re-acquiring on each fire.
const LEASE_MS: i64 = 60_000;

/// Task kinds wired by the service. Payloads are plain JSON so jobs
/// survive restarts.
pub const TASK_AWAIT_TIMEOUT: &str = "await.timeout";
pub const TASK_AWAIT_FIRE: &str = "await.fire";
pub const TASK_TRIGGER_CRON: &str = "trigger.cron";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSchedule {
    OneTime { execute_at_ms: i64 },
    Recurring { cron: String, timezone: Option<String> },
}

/// A persisted scheduler job. The handler is addressed by task kind;
/// the payload is handed back verbatim on fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub schedule: JobSchedule,
    pub task: String,
    #[serde(default)]
    pub payload: Value,
}

impl ScheduledJob {
    pub fn one_time(
        id: impl Into<String>,
        execute_at: DateTime<Utc>,
        task: &str,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            schedule: JobSchedule::OneTime {
                execute_at_ms: execute_at.timestamp_millis(),
            },
            task: task.to_string(),
            payload,
        }
    }

    pub fn recurring(
        id: impl Into<String>,
        cron: impl Into<String>,
        timezone: Option<String>,
        task: &str,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            schedule: JobSchedule::Recurring {
                cron: cron.into(),
                timezone,
            },
            task: task.to_string(),
            payload,
        }
    }
}

type TaskHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One-shot and recurring job timer backed by the `scheduler:locks`
/// index. Job metadata persists across restarts; overdue one-time jobs
/// fire immediately on recovery, so their handlers must be idempotent.
/// With several instances, a leased lock decides who fires.
pub struct Scheduler {
    store: Arc<dyn Store>,
    config: RuntimeConfig,
    handlers: RwLock<HashMap<String, TaskHandler>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    instance_id: String,
    // Handle to ourselves for timer tasks; set once at construction.
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: RuntimeConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            config,
            handlers: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            instance_id: Uuid::new_v4().to_string(),
            self_ref: self_ref.clone(),
        })
    }

    /// Register the executor for one task kind.
    pub fn register_task<F, Fut>(&self, task: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers.write().unwrap().insert(task.to_string(), handler);
    }

    /// Persist and arm a job. Returns its id.
    pub async fn schedule(&self, job: ScheduledJob) -> Result<String> {
        let next = next_fire(&job.schedule, Utc::now())?;
        let key = self.config.scheduler_index();
        let id = job.id.clone();
        self.store
            .index_add(
                &key,
                &id,
                next.timestamp_millis(),
                serde_json::json!({
                    "job": &job,
                    "holder": Value::Null,
                    "lease_until": 0,
                }),
            )
            .await?;
        self.arm(job);
        Ok(id)
    }

    /// Cancel a job's timer and drop its persisted metadata. The entry
    /// goes first: callers may be running inside the very timer task
    /// being aborted, and the abort cuts them off at their next await.
    pub async fn unschedule(&self, id: &str) -> Result<()> {
        let key = self.config.scheduler_index();
        self.store.index_delete(&key, id).await?;
        if let Some(handle) = self.timers.lock().unwrap().remove(id) {
            handle.abort();
        }
        Ok(())
    }

    /// Re-arm persisted jobs after a restart. Overdue one-time jobs fire
    /// immediately.
    pub async fn recover(&self) -> Result<usize> {
        let key = self.config.scheduler_index();
        let count = self.store.index_count(&key).await?;
        let entries = self.store.index_read(&key, 0, count.max(1)).await?;

        let mut recovered = 0;
        for entry in entries {
            let job: ScheduledJob = match serde_json::from_value(entry.metadata["job"].clone()) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(job = %entry.id, error = %e, "dropping undecodable scheduler job");
                    self.store.index_delete(&key, &entry.id).await?;
                    continue;
                }
            };
            self.arm(job);
            recovered += 1;
        }
        Ok(recovered)
    }

    fn arm(&self, job: ScheduledJob) {
        let id = job.id.clone();
        if let Some(existing) = self.timers.lock().unwrap().remove(&id) {
            existing.abort();
        }

        let Some(scheduler) = self.self_ref.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let key = scheduler.config.scheduler_index();
            loop {
                let next = match next_fire(&job.schedule, Utc::now()) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!(job = %job.id, error = %e, "cannot compute next fire time");
                        break;
                    }
                };

                let now = Utc::now();
                if next > now {
                    let wait = (next - now)
                        .to_std()
                        .unwrap_or(std::time::Duration::from_millis(1));
                    tokio::time::sleep(wait).await;
                }

                if scheduler.acquire_lease(&job.id).await {
                    let handler = scheduler
                        .handlers
                        .read()
                        .unwrap()
                        .get(&job.task)
                        .cloned();
                    match handler {
                        Some(handler) => handler(job.payload.clone()).await,
                        None => {
                            tracing::warn!(job = %job.id, task = %job.task, "no handler for scheduled task");
                        }
                    }
                }

                match &job.schedule {
                    JobSchedule::OneTime { .. } => {
                        if let Err(e) = scheduler.store.index_delete(&key, &job.id).await {
                            tracing::warn!(job = %job.id, error = %e, "failed to clear one-time job");
                        }
                        break;
                    }
                    JobSchedule::Recurring { .. } => {
                        // Refresh the persisted score so recovery sees the
                        // next occurrence.
                        if let Ok(next) = next_fire(&job.schedule, Utc::now()) {
                            let millis = next.timestamp_millis();
                            let _ = scheduler
                                .store
                                .index_update_with_retry(&key, &job.id, &move |metadata| {
                                    crate::storage::set_field(
                                        metadata,
                                        "next_fire_ms",
                                        Value::from(millis),
                                    );
                                })
                                .await;
                        }
                    }
                }
            }
            scheduler.timers.lock().unwrap().remove(&job.id);
        });

        self.timers.lock().unwrap().insert(id, handle);
    }

    /// Claim (or renew) the job lease via a versioned update. Exactly one
    /// instance wins a contended claim.
    async fn acquire_lease(&self, id: &str) -> bool {
        let key = self.config.scheduler_index();
        let entry = match self.store.index_get(&key, id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(job = id, error = %e, "lease read failed");
                return false;
            }
        };

        let now = Utc::now().timestamp_millis();
        let lease_until = entry.metadata["lease_until"].as_i64().unwrap_or(0);
        let holder = entry.metadata["holder"].as_str().unwrap_or_default();
        if lease_until > now && holder != self.instance_id {
            return false;
        }

        let patch = serde_json::json!({
            "holder": self.instance_id,
            "lease_until": now + LEASE_MS,
        });
        match self.store.index_update(&key, id, patch, entry.version).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::warn!(job = id, error = %e, "lease claim failed");
                false
            }
        }
    }

    /// Abort every armed timer. Used on shutdown.
    pub fn shutdown(&self) {
        let mut timers = self.timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

/// Parse a cron expression, accepting the classic five-field form by
/// prepending a seconds column.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Next occurrence of a cron expression in the given timezone (UTC when
/// unset or unknown).
pub fn next_cron_occurrence(
    expr: &str,
    timezone: Option<&str>,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let schedule = parse_cron(expr)?;
    let tz: Tz = match timezone {
        Some(name) => name.parse().map_err(|_| Error::InvalidCron {
            expr: expr.to_string(),
            reason: format!("unknown timezone {name}"),
        })?,
        None => chrono_tz::UTC,
    };
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| Error::InvalidCron {
            expr: expr.to_string(),
            reason: "no upcoming occurrence".to_string(),
        })
}

fn next_fire(schedule: &JobSchedule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule {
        JobSchedule::OneTime { execute_at_ms } => Ok(DateTime::<Utc>::from_timestamp_millis(
            *execute_at_ms,
        )
        .unwrap_or(now)),
        JobSchedule::Recurring { cron, timezone } => {
            next_cron_occurrence(cron, timezone.as_deref(), now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn scheduler() -> Arc<Scheduler> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Scheduler::new(store, RuntimeConfig::default())
    }

    #[tokio::test]
    async fn one_time_jobs_fire_once_and_clean_up() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        scheduler.register_task("test", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        scheduler
            .schedule(ScheduledJob::one_time(
                "job-1",
                Utc::now() + chrono::Duration::milliseconds(30),
                "test",
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let key = scheduler.config.scheduler_index();
        assert!(scheduler.store.index_get(&key, "job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overdue_jobs_fire_on_recovery() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = RuntimeConfig::default();

        // Seed an overdue one-time job as a previous process would have.
        let job = ScheduledJob::one_time(
            "stale",
            Utc::now() - chrono::Duration::seconds(30),
            "test",
            serde_json::json!({"n": 1}),
        );
        store
            .index_add(
                &config.scheduler_index(),
                "stale",
                Utc::now().timestamp_millis() - 30_000,
                serde_json::json!({"job": job, "holder": null, "lease_until": 0}),
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(store, config);
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        scheduler.register_task("test", move |payload| {
            let counter = counter.clone();
            async move {
                assert_eq!(payload["n"], 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(scheduler.recover().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unschedule_cancels_the_timer() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        scheduler.register_task("test", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        scheduler
            .schedule(ScheduledJob::one_time(
                "job-2",
                Utc::now() + chrono::Duration::milliseconds(80),
                "test",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        scheduler.unschedule("job-2").await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn five_field_cron_is_accepted() {
        assert!(parse_cron("*/15 * * * *").is_ok());
        assert!(parse_cron("0 0 * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn cron_occurrences_respect_timezones() {
        let after = Utc::now();
        let utc_next = next_cron_occurrence("0 0 * * *", None, after).unwrap();
        assert!(utc_next > after);

        let tokyo = next_cron_occurrence("0 0 * * *", Some("Asia/Tokyo"), after).unwrap();
        assert!(tokyo > after);
        assert!(next_cron_occurrence("0 0 * * *", Some("Not/AZone"), after).is_err());
    }
}
