use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::fabric::StreamFabric;
use crate::orchestrator::load_run_record;
use crate::registry::FlowRegistry;
use crate::scheduler::{
    next_cron_occurrence, ScheduledJob, Scheduler, TASK_AWAIT_FIRE, TASK_AWAIT_TIMEOUT,
};
use crate::storage::Store;
use crate::types::{AwaitConfig, AwaitPosition, AwaitingStatus, EventType, FlowEvent, RunId};
use crate::worker::{AwaitHook, StepContext};

/// Default expiry for webhook and event awaits.
const DEFAULT_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// One armed event-await, matched against `emit` and `trigger.fired`
/// traffic on the bus.
#[derive(Debug, Clone)]
struct EventAwait {
    run_id: RunId,
    flow: String,
    step: String,
    name: String,
    filter_key: Option<String>,
    filter_value: Option<Value>,
}

/// Registration, resolution, and timeout for the four await kinds.
///
/// The manager only publishes `await.*` events; the orchestrator owns the
/// run-record transitions those events imply. Resolution and timeout are
/// idempotent against the persisted await status, which makes overdue
/// timer replay after a restart safe.
pub struct AwaitManager {
    store: Arc<dyn Store>,
    fabric: Arc<StreamFabric>,
    scheduler: Arc<Scheduler>,
    registry: Arc<FlowRegistry>,
    config: RuntimeConfig,
    event_awaits: Mutex<Vec<EventAwait>>,
}

impl AwaitManager {
    pub fn new(
        store: Arc<dyn Store>,
        fabric: Arc<StreamFabric>,
        scheduler: Arc<Scheduler>,
        registry: Arc<FlowRegistry>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            fabric,
            scheduler,
            registry,
            config,
            event_awaits: Mutex::new(Vec::new()),
        });
        manager.clone().spawn_event_listener();
        manager
    }

    /// Wire the scheduler task kinds this manager owns.
    pub fn attach_scheduler_tasks(self: Arc<Self>) {
        let manager = self.clone();
        self.scheduler.register_task(TASK_AWAIT_TIMEOUT, move |payload| {
            let manager = manager.clone();
            async move {
                manager.handle_timeout_task(payload).await;
            }
        });

        let manager = self.clone();
        self.scheduler.register_task(TASK_AWAIT_FIRE, move |payload| {
            let manager = manager.clone();
            async move {
                manager.handle_fire_task(payload).await;
            }
        });
    }

    /// Register an await for `(run, step)`. Publishes `await.registered`
    /// and arranges both the resolver and the timeout one-shot.
    pub async fn register(
        &self,
        run_id: RunId,
        flow_name: &str,
        step_name: &str,
        await_config: &AwaitConfig,
        position: AwaitPosition,
        step_data: &Value,
    ) -> Result<()> {
        let now = Utc::now();
        let timeout_ms = self.timeout_ms(await_config, now)?;
        let timeout_at = now + ChronoDuration::milliseconds(timeout_ms as i64);
        let timeout_action = await_config.timeout_action();
        let kind = await_config.kind();

        tracing::info!(
            run_id = %run_id,
            flow = flow_name,
            step = step_name,
            await_type = %kind,
            %position,
            "registering await"
        );

        self.invoke_register_hook(run_id, flow_name, step_name, await_config, position, timeout_at)
            .await;

        let mut data = serde_json::json!({
            "await_type": kind,
            "position": position,
            "config": await_config,
            "timeout_action": timeout_action,
            "timeout_at": timeout_at,
        });
        if let AwaitConfig::Webhook { path, .. } = await_config {
            let url = path
                .clone()
                .unwrap_or_else(|| self.webhook_path(flow_name, run_id, step_name));
            data["webhook_path"] = Value::from(url);
        }

        self.fabric.publish(
            FlowEvent::new(EventType::AwaitRegistered, run_id, flow_name)
                .with_step(step_name)
                .with_data(data),
        );

        // Arrange the resolver.
        let payload = serde_json::json!({
            "run_id": run_id,
            "flow": flow_name,
            "step": step_name,
        });
        match await_config {
            AwaitConfig::Webhook { .. } => {
                // Resolved by a POST to the webhook path.
            }
            AwaitConfig::Event {
                name, filter_key, ..
            } => {
                self.event_awaits.lock().unwrap().push(EventAwait {
                    run_id,
                    flow: flow_name.to_string(),
                    step: step_name.to_string(),
                    name: name.clone(),
                    filter_key: filter_key.clone(),
                    filter_value: filter_key
                        .as_ref()
                        .and_then(|k| step_data.get(k))
                        .cloned(),
                });
            }
            AwaitConfig::Schedule { cron, timezone, .. } => {
                let fire_at = next_cron_occurrence(cron, timezone.as_deref(), now)?;
                self.scheduler
                    .schedule(ScheduledJob::one_time(
                        fire_job_id(run_id, step_name),
                        fire_at,
                        TASK_AWAIT_FIRE,
                        payload.clone(),
                    ))
                    .await?;
            }
            AwaitConfig::Time { delay_ms, .. } => {
                self.scheduler
                    .schedule(ScheduledJob::one_time(
                        fire_job_id(run_id, step_name),
                        now + ChronoDuration::milliseconds(*delay_ms as i64),
                        TASK_AWAIT_FIRE,
                        payload.clone(),
                    ))
                    .await?;
            }
        }

        // Arrange the timeout.
        self.scheduler
            .schedule(ScheduledJob::one_time(
                timeout_job_id(run_id, step_name),
                timeout_at,
                TASK_AWAIT_TIMEOUT,
                payload,
            ))
            .await?;

        Ok(())
    }

    /// Resolve an awaiting step with external trigger data. Returns
    /// `false` when the await is unknown or no longer awaiting.
    pub async fn resolve(
        &self,
        run_id: RunId,
        flow_name: &str,
        step_name: &str,
        trigger_data: Value,
    ) -> Result<bool> {
        let Some((record, _)) =
            load_run_record(self.store.as_ref(), &self.config, flow_name, run_id).await?
        else {
            return Ok(false);
        };
        let Some(awaiting) = record.awaiting_steps.get(step_name) else {
            return Ok(false);
        };
        if awaiting.status != AwaitingStatus::Awaiting {
            return Ok(false);
        }

        tracing::info!(
            run_id = %run_id,
            flow = flow_name,
            step = step_name,
            await_type = %awaiting.await_type,
            "await resolved"
        );

        self.invoke_resolve_hook(run_id, flow_name, step_name, &trigger_data)
            .await;

        self.fabric.publish(
            FlowEvent::new(EventType::AwaitResolved, run_id, flow_name)
                .with_step(step_name)
                .with_data(serde_json::json!({
                    "await_type": awaiting.await_type,
                    "position": awaiting.position,
                    "trigger_data": trigger_data,
                })),
        );

        self.clear_arrangements(run_id, step_name).await;
        Ok(true)
    }

    /// Path served by the HTTP layer for webhook awaits.
    pub fn webhook_path(&self, flow_name: &str, run_id: RunId, step_name: &str) -> String {
        format!("/api/_webhook/await/{flow_name}/{run_id}/{step_name}")
    }

    /// Entry point for the webhook route.
    pub async fn resolve_webhook(
        &self,
        flow_name: &str,
        run_id: RunId,
        step_name: &str,
        body: Value,
    ) -> Result<bool> {
        self.resolve(run_id, flow_name, step_name, body).await
    }

    async fn handle_fire_task(&self, payload: Value) {
        let Some((run_id, flow, step)) = decode_payload(&payload) else {
            tracing::warn!(%payload, "malformed await fire payload");
            return;
        };
        if let Err(e) = self
            .resolve(run_id, &flow, &step, serde_json::json!({ "fired_at": Utc::now() }))
            .await
        {
            tracing::warn!(run_id = %run_id, step = %step, error = %e, "scheduled await fire failed");
        }
    }

    async fn handle_timeout_task(&self, payload: Value) {
        let Some((run_id, flow, step)) = decode_payload(&payload) else {
            tracing::warn!(%payload, "malformed await timeout payload");
            return;
        };

        let record = match load_run_record(self.store.as_ref(), &self.config, &flow, run_id).await
        {
            Ok(Some((record, _))) => record,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "await timeout record read failed");
                return;
            }
        };
        let Some(awaiting) = record.awaiting_steps.get(&step) else {
            return;
        };
        // Already resolved or timed out: replayed timer, nothing to do.
        if awaiting.status != AwaitingStatus::Awaiting {
            return;
        }

        tracing::warn!(
            run_id = %run_id,
            flow = %flow,
            step = %step,
            action = ?awaiting.timeout_action,
            "await timed out"
        );

        self.invoke_timeout_hook(run_id, &flow, &step).await;

        self.fabric.publish(
            FlowEvent::new(EventType::AwaitTimeout, run_id, flow.clone())
                .with_step(step.clone())
                .with_data(serde_json::json!({
                    "await_type": awaiting.await_type,
                    "position": awaiting.position,
                    "timeout_action": awaiting.timeout_action,
                })),
        );

        self.clear_arrangements(run_id, &step).await;
    }

    /// Drop the event matchers and timers for a settled await. A timer
    /// unscheduling itself aborts mid-call; whatever it leaves armed is
    /// harmless because resolution and timeout are idempotent.
    async fn clear_arrangements(&self, run_id: RunId, step_name: &str) {
        self.event_awaits
            .lock()
            .unwrap()
            .retain(|a| !(a.run_id == run_id && a.step == step_name));
        if let Err(e) = self.scheduler.unschedule(&timeout_job_id(run_id, step_name)).await {
            tracing::debug!(run_id = %run_id, step = step_name, error = %e, "timeout unschedule failed");
        }
        if let Err(e) = self.scheduler.unschedule(&fire_job_id(run_id, step_name)).await {
            tracing::debug!(run_id = %run_id, step = step_name, error = %e, "fire unschedule failed");
        }
    }

    fn timeout_ms(&self, await_config: &AwaitConfig, now: DateTime<Utc>) -> Result<u64> {
        Ok(match await_config {
            AwaitConfig::Webhook { timeout_ms, .. } | AwaitConfig::Event { timeout_ms, .. } => {
                timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
            }
            AwaitConfig::Time { delay_ms, .. } => *delay_ms,
            AwaitConfig::Schedule { cron, timezone, .. } => {
                let next = next_cron_occurrence(cron, timezone.as_deref(), now)?;
                (next - now).num_milliseconds().max(0) as u64
            }
        })
    }

    fn handler_ctx(&self, run_id: RunId, flow: &str, step: &str) -> Option<(Arc<dyn crate::worker::StepHandler>, StepContext)> {
        let analyzed = self.registry.flow(flow)?;
        let worker_id = &analyzed.step(step)?.worker_id;
        let handler = self.registry.handler(worker_id)?;
        let ctx = StepContext::new(run_id, flow, step, 1, self.fabric.clone());
        Some((handler, ctx))
    }

    async fn invoke_register_hook(
        &self,
        run_id: RunId,
        flow: &str,
        step: &str,
        await_config: &AwaitConfig,
        position: AwaitPosition,
        timeout_at: DateTime<Utc>,
    ) {
        let Some((handler, ctx)) = self.handler_ctx(run_id, flow, step) else {
            return;
        };
        let hook = AwaitHook {
            await_type: await_config.kind(),
            position,
            timeout_at: Some(timeout_at),
            config: serde_json::to_value(await_config).unwrap_or(Value::Null),
        };
        if let Err(e) = handler.on_await_register(&hook, &ctx).await {
            tracing::warn!(run_id = %run_id, step, error = %e, "onAwaitRegister hook failed");
        }
    }

    async fn invoke_resolve_hook(&self, run_id: RunId, flow: &str, step: &str, resolved: &Value) {
        let Some((handler, ctx)) = self.handler_ctx(run_id, flow, step) else {
            return;
        };
        if let Err(e) = handler.on_await_resolve(resolved, &ctx).await {
            tracing::warn!(run_id = %run_id, step, error = %e, "onAwaitResolve hook failed");
        }
    }

    async fn invoke_timeout_hook(&self, run_id: RunId, flow: &str, step: &str) {
        let Some((handler, ctx)) = self.handler_ctx(run_id, flow, step) else {
            return;
        };
        if let Err(e) = handler.on_await_timeout(&ctx).await {
            tracing::warn!(run_id = %run_id, step, error = %e, "onAwaitTimeout hook failed");
        }
    }

    /// Event awaits resolve off bus traffic: `emit` events by token name
    /// and `trigger.fired` events by trigger name, with optional
    /// filter-key equality against the awaiting step's data.
    fn spawn_event_listener(self: Arc<Self>) {
        let mut rx = self.fabric.subscribe_bus();
        let manager = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                let (name, data) = match event.event_type {
                    EventType::Emit => {
                        let Some(name) = event.emit_name() else { continue };
                        (
                            name.to_string(),
                            event.data.get("data").cloned().unwrap_or(Value::Null),
                        )
                    }
                    EventType::TriggerFired => {
                        let Some(name) = event.data.get("trigger").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        (
                            name.to_string(),
                            event.data.get("payload").cloned().unwrap_or(Value::Null),
                        )
                    }
                    _ => continue,
                };

                let Some(manager) = manager.upgrade() else { break };
                let matches: Vec<EventAwait> = {
                    let awaits = manager.event_awaits.lock().unwrap();
                    awaits
                        .iter()
                        .filter(|a| {
                            if a.name != name {
                                return false;
                            }
                            match (&a.filter_key, &a.filter_value) {
                                (Some(key), expected) => {
                                    data.get(key) == expected.as_ref()
                                }
                                (None, _) => true,
                            }
                        })
                        .cloned()
                        .collect()
                };

                for pending in matches {
                    if let Err(e) = manager
                        .resolve(pending.run_id, &pending.flow, &pending.step, data.clone())
                        .await
                    {
                        tracing::warn!(
                            run_id = %pending.run_id,
                            step = %pending.step,
                            error = %e,
                            "event await resolution failed"
                        );
                    }
                }
            }
        });
    }
}

fn timeout_job_id(run_id: RunId, step: &str) -> String {
    format!("await-timeout:{run_id}:{step}")
}

fn fire_job_id(run_id: RunId, step: &str) -> String {
    format!("await-fire:{run_id}:{step}")
}

fn decode_payload(payload: &Value) -> Option<(RunId, String, String)> {
    let run_id = payload
        .get("run_id")
        .and_then(|v| serde_json::from_value::<RunId>(v.clone()).ok())?;
    let flow = payload.get("flow")?.as_str()?.to_string();
    let step = payload.get("step")?.as_str()?.to_string();
    Some((run_id, flow, step))
}
