use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Job, JobHandler};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::fabric::StreamFabric;
use crate::registry::FlowRegistry;
use crate::storage::Store;
use crate::types::{AwaitKind, AwaitPosition, EventType, FlowEvent, RunId, StepJobPayload};

/// Execution context handed to a step handler. Emits, logs, and state
/// snapshots published here flow through the fabric and are persisted by
/// the orchestrator in publish order.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub flow_name: String,
    pub step_name: String,
    pub attempt: u32,
    fabric: Arc<StreamFabric>,
}

impl StepContext {
    pub fn new(
        run_id: RunId,
        flow_name: impl Into<String>,
        step_name: impl Into<String>,
        attempt: u32,
        fabric: Arc<StreamFabric>,
    ) -> Self {
        Self {
            run_id,
            flow_name: flow_name.into(),
            step_name: step_name.into(),
            attempt,
            fabric,
        }
    }

    /// Emit a named event token into the run.
    pub fn emit(&self, name: &str, data: Value) {
        self.fabric.publish(
            FlowEvent::new(EventType::Emit, self.run_id, self.flow_name.clone())
                .with_step(self.step_name.clone())
                .with_data(serde_json::json!({ "name": name, "data": data })),
        );
    }

    /// Append a log line to the run stream.
    pub fn log(&self, message: impl Into<String>) {
        self.fabric.publish(
            FlowEvent::new(EventType::Log, self.run_id, self.flow_name.clone())
                .with_step(self.step_name.clone())
                .with_data(serde_json::json!({ "message": message.into() })),
        );
    }

    /// Publish a state snapshot visible to UI subscribers.
    pub fn set_state(&self, key: &str, value: Value) {
        self.fabric.publish(
            FlowEvent::new(EventType::State, self.run_id, self.flow_name.clone())
                .with_step(self.step_name.clone())
                .with_data(serde_json::json!({ "key": key, "value": value })),
        );
    }
}

/// Data passed to the await hooks.
#[derive(Debug, Clone)]
pub struct AwaitHook {
    pub await_type: AwaitKind,
    pub position: AwaitPosition,
    pub timeout_at: Option<chrono::DateTime<chrono::Utc>>,
    pub config: Value,
}

/// A worker function. The registry owns one handler per `workerId`;
/// cross-language workers sit behind the same trait via a sidecar.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext, input: Value) -> Result<Value>;

    /// Called once when an await is registered for this step.
    async fn on_await_register(&self, _hook: &AwaitHook, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the await resolves, with the trigger data.
    async fn on_await_resolve(&self, _resolved: &Value, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the await times out.
    async fn on_await_timeout(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}

/// Broker-side executor for step jobs: resolves the handler, publishes
/// the step lifecycle events, and enforces the step timeout.
pub struct StepRunner {
    registry: Arc<FlowRegistry>,
    fabric: Arc<StreamFabric>,
    store: Arc<dyn Store>,
    config: RuntimeConfig,
}

impl StepRunner {
    pub fn new(
        registry: Arc<FlowRegistry>,
        fabric: Arc<StreamFabric>,
        store: Arc<dyn Store>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            fabric,
            store,
            config,
        }
    }

    async fn run_discarded(&self, payload: &StepJobPayload) -> Result<bool> {
        let key = self.config.flow_runs_index(&payload.flow_name);
        let Some(entry) = self
            .store
            .index_get(&key, &payload.flow_id.to_string())
            .await?
        else {
            return Ok(false);
        };
        let status = entry
            .metadata
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("running");
        Ok(matches!(status, "canceled" | "completed" | "failed" | "stalled"))
    }
}

#[async_trait]
impl JobHandler for StepRunner {
    async fn run(&self, job: &Job, attempt: u32) -> std::result::Result<(), String> {
        let payload: StepJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(|e| e.to_string())?;

        // Canceled or already-terminal runs keep their queue positions
        // until drained; discard instead of executing.
        match self.run_discarded(&payload).await {
            Ok(true) => {
                tracing::debug!(run_id = %payload.flow_id, step = %payload.step, "discarding job for finished run");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => return Err(e.to_string()),
        }

        let flow = self
            .registry
            .flow(&payload.flow_name)
            .ok_or_else(|| format!("unknown flow {}", payload.flow_name))?;
        let step = flow
            .step(&payload.step)
            .ok_or_else(|| format!("unknown step {} in flow {}", payload.step, payload.flow_name))?;
        let handler = self
            .registry
            .handler(&step.worker_id)
            .ok_or_else(|| format!("no handler registered for worker {}", step.worker_id))?;

        let ctx = StepContext::new(
            payload.flow_id,
            payload.flow_name.clone(),
            payload.step.clone(),
            attempt,
            self.fabric.clone(),
        );

        self.fabric.publish(
            FlowEvent::new(EventType::StepStarted, payload.flow_id, &payload.flow_name)
                .with_step(&payload.step)
                .with_attempt(attempt),
        );

        let outcome = match step.step_timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    handler.run(&ctx, payload.input.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::StepFailure {
                        step: payload.step.clone(),
                        message: format!("step timed out after {ms} ms"),
                    }),
                }
            }
            None => handler.run(&ctx, payload.input.clone()).await,
        };

        match outcome {
            Ok(output) => {
                self.fabric.publish(
                    FlowEvent::new(EventType::StepCompleted, payload.flow_id, &payload.flow_name)
                        .with_step(&payload.step)
                        .with_attempt(attempt)
                        .with_data(serde_json::json!({ "output": output })),
                );
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let event_type = if attempt < job.opts.attempts {
                    EventType::StepRetry
                } else {
                    EventType::StepFailed
                };
                self.fabric.publish(
                    FlowEvent::new(event_type, payload.flow_id, &payload.flow_name)
                        .with_step(&payload.step)
                        .with_attempt(attempt)
                        .with_data(serde_json::json!({ "error": message })),
                );
                Err(message)
            }
        }
    }
}
