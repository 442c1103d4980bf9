use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::analyzer::AnalyzedFlow;
use crate::awaits::AwaitManager;
use crate::broker::{Job, JobBroker};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::fabric::StreamFabric;
use crate::registry::FlowRegistry;
use crate::storage::{ReadOptions, Store};
use crate::trigger::TriggerRuntime;
use crate::types::{
    AwaitPosition, AwaitingStatus, AwaitingStep, EventType, FlowEvent, RunId, RunMeta, RunRecord,
    RunStatus, StepJobPayload, TimeoutAction,
};

/// Read one run record (and its index version) by flow and run id.
pub(crate) async fn load_run_record(
    store: &dyn Store,
    config: &RuntimeConfig,
    flow_name: &str,
    run_id: RunId,
) -> Result<Option<(RunRecord, u64)>> {
    let key = config.flow_runs_index(flow_name);
    let Some(entry) = store.index_get(&key, &run_id.to_string()).await? else {
        return Ok(None);
    };
    let record: RunRecord = serde_json::from_value(entry.metadata)?;
    Ok(Some((record, entry.version)))
}

/// The flow orchestrator: accepts every bus event, persists it to the
/// per-run stream, maintains the run index, and decides which steps are
/// runnable next.
///
/// Event handling is partitioned by run: each live run gets a worker
/// task that applies its events strictly in arrival order, so record
/// mutations within one run never interleave. Cross-instance safety on
/// top of that comes from the store's versioned updates and atomic
/// increments.
pub struct FlowOrchestrator {
    store: Arc<dyn Store>,
    fabric: Arc<StreamFabric>,
    broker: Arc<dyn JobBroker>,
    registry: Arc<FlowRegistry>,
    awaits: Arc<AwaitManager>,
    triggers: Arc<TriggerRuntime>,
    config: RuntimeConfig,
    run_workers: Mutex<HashMap<RunId, mpsc::UnboundedSender<FlowEvent>>>,
}

impl FlowOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        fabric: Arc<StreamFabric>,
        broker: Arc<dyn JobBroker>,
        registry: Arc<FlowRegistry>,
        awaits: Arc<AwaitManager>,
        triggers: Arc<TriggerRuntime>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            fabric,
            broker,
            registry,
            awaits,
            triggers,
            config,
            run_workers: Mutex::new(HashMap::new()),
        })
    }

    /// Attach to the bus. Must be called once before any run starts.
    pub fn start(self: Arc<Self>) {
        let mut rx = self.fabric.subscribe_bus();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::error!(skipped, "orchestrator lagged on the bus");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match (event.run_id, event.event_type) {
                    (Some(run_id), _) => Self::route_to_run(&self, run_id, event),
                    (None, EventType::TriggerFired) => {
                        let orchestrator = self.clone();
                        tokio::spawn(async move {
                            orchestrator.handle_trigger_fired(event).await;
                        });
                    }
                    (None, _) => {}
                }
            }
        });
    }

    /// Start a new run of a flow. The entry step is dispatched through
    /// the broker unless it declares a before-await.
    pub async fn start_flow(&self, flow_name: &str, input: Value) -> Result<RunId> {
        self.start_flow_with_meta(flow_name, input, RunMeta::default())
            .await
    }

    pub async fn start_flow_with_meta(
        &self,
        flow_name: &str,
        input: Value,
        mut meta: RunMeta,
    ) -> Result<RunId> {
        let flow = self
            .registry
            .flow(flow_name)
            .ok_or_else(|| Error::UnknownFlow(flow_name.to_string()))?;

        let run_id = RunId::new();
        meta.stall_timeout_ms = meta.stall_timeout_ms.or(flow.stall_timeout_ms);

        // stepCount starts at the static lower bound and is reconciled
        // as completions come in.
        let mut record = RunRecord::new(run_id, flow_name, flow.max_level + 1);
        record.meta = meta.clone();

        let key = self.config.flow_runs_index(flow_name);
        self.store
            .index_add(
                &key,
                &run_id.to_string(),
                record.started_at.timestamp_millis(),
                serde_json::to_value(&record)?,
            )
            .await?;

        tracing::info!(run_id = %run_id, flow = flow_name, "flow started");
        self.fabric.publish(
            FlowEvent::new(EventType::FlowStart, run_id, flow_name).with_data(serde_json::json!({
                "input": input,
                "meta": meta,
            })),
        );

        let entry = flow.entry_step();
        if let Some(await_config) = &entry.await_before {
            self.awaits
                .register(
                    run_id,
                    flow_name,
                    &entry.name,
                    await_config,
                    AwaitPosition::Before,
                    &input,
                )
                .await?;
        } else {
            self.enqueue_step(&flow, run_id, &entry.name, input).await?;
        }

        Ok(run_id)
    }

    /// Cooperative cancel: status flips immediately, pending jobs drain,
    /// in-flight results are discarded.
    pub async fn cancel_flow(&self, flow_name: &str, run_id: RunId) -> Result<()> {
        if load_run_record(self.store.as_ref(), &self.config, flow_name, run_id)
            .await?
            .is_none()
        {
            return Err(Error::UnknownRun(run_id));
        }
        self.fabric.publish(
            FlowEvent::new(EventType::FlowCancel, run_id, flow_name)
                .with_data(serde_json::json!({ "reason": "user requested cancellation" })),
        );
        Ok(())
    }

    /// Start a fresh run with the original input. The old run keeps its
    /// state; stalled runs are not revived.
    pub async fn restart_flow(&self, flow_name: &str, run_id: RunId) -> Result<RunId> {
        let input = self.run_input(run_id).await?;
        self.start_flow(flow_name, input).await
    }

    /// Paginated run listing, newest first.
    pub async fn list_runs(
        &self,
        flow_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<RunRecord>, usize)> {
        let key = self.config.flow_runs_index(flow_name);
        let total = self.store.index_count(&key).await?;
        let entries = self.store.index_read(&key, offset, limit).await?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<RunRecord>(entry.metadata) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(run = %entry.id, error = %e, "undecodable run record"),
            }
        }
        Ok((records, total))
    }

    pub async fn run_record(&self, flow_name: &str, run_id: RunId) -> Result<Option<RunRecord>> {
        Ok(
            load_run_record(self.store.as_ref(), &self.config, flow_name, run_id)
                .await?
                .map(|(record, _)| record),
        )
    }

    /// Events of one run, in persistence order.
    pub async fn run_events(&self, run_id: RunId, opts: &ReadOptions) -> Result<Vec<FlowEvent>> {
        self.store
            .stream_read(&self.config.run_stream(run_id), opts)
            .await
    }

    /// Purge the run index and event streams for a flow.
    pub async fn clear_history(&self, flow_name: &str) -> Result<usize> {
        let key = self.config.flow_runs_index(flow_name);
        let count = self.store.index_count(&key).await?;
        let entries = self.store.index_read(&key, 0, count.max(1)).await?;

        for entry in &entries {
            if let Some(run_id) = RunId::parse(&entry.id) {
                match self.store.stream_delete(&self.config.run_stream(run_id)).await {
                    Ok(()) => {}
                    Err(Error::NotSupported(op)) => {
                        tracing::debug!(run = %entry.id, op, "backend kept run stream");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.store.index_clear(&key).await
    }

    /// Resolve a webhook await addressed by `(flow, run, step)`.
    pub async fn resolve_webhook(
        &self,
        flow_name: &str,
        run_id: RunId,
        step_name: &str,
        body: Value,
    ) -> Result<bool> {
        self.awaits
            .resolve_webhook(flow_name, run_id, step_name, body)
            .await
    }

    // --- Event routing ---

    fn route_to_run(this: &Arc<Self>, run_id: RunId, event: FlowEvent) {
        let mut workers = this.run_workers.lock().unwrap();
        let sender = workers.entry(run_id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let orchestrator = this.clone();
            tokio::spawn(async move {
                orchestrator.run_worker(run_id, rx).await;
            });
            tx
        });
        if sender.send(event).is_err() {
            // Worker already exited; drop the stale sender so the next
            // event spawns a fresh one.
            workers.remove(&run_id);
        }
    }

    async fn run_worker(self: Arc<Self>, run_id: RunId, mut rx: mpsc::UnboundedReceiver<FlowEvent>) {
        while let Some(event) = rx.recv().await {
            match self.handle_run_event(&event).await {
                Ok(terminal) => {
                    if terminal {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        run_id = %run_id,
                        event = %event.event_type,
                        error = %e,
                        "run event handling failed"
                    );
                }
            }
        }
        self.run_workers.lock().unwrap().remove(&run_id);
    }

    async fn handle_trigger_fired(&self, event: FlowEvent) {
        let Some(name) = event.data.get("trigger").and_then(|v| v.as_str()) else {
            return;
        };
        let flows = self.triggers.auto_subscribed_flows(name);
        if flows.is_empty() {
            return;
        }

        let body = event.data.get("payload").cloned().unwrap_or(Value::Null);
        let input = match self.triggers.resolve_payload(&body).await {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(trigger = name, error = %e, "could not resolve trigger payload");
                body
            }
        };
        let kind = self.triggers.get(name).map(|t| t.kind);

        for flow in flows {
            let meta = RunMeta {
                trigger_name: Some(name.to_string()),
                trigger_type: kind,
                stall_timeout_ms: None,
            };
            match self.start_flow_with_meta(&flow, input.clone(), meta).await {
                Ok(run_id) => {
                    tracing::info!(trigger = name, flow = %flow, run_id = %run_id, "trigger started flow");
                }
                Err(e) => {
                    tracing::error!(trigger = name, flow = %flow, error = %e, "trigger start failed");
                }
            }
        }
    }

    // --- Per-run event handling ---

    async fn handle_run_event(&self, event: &FlowEvent) -> Result<bool> {
        let run_id = event.run_id.expect("run events always carry a run id");
        let flow_name = event
            .flow_name
            .clone()
            .ok_or_else(|| Error::TransientStore("run event without flow name".to_string()))?;

        let Some((record, _)) =
            load_run_record(self.store.as_ref(), &self.config, &flow_name, run_id).await?
        else {
            tracing::warn!(run_id = %run_id, "event for unknown run dropped");
            return Ok(false);
        };

        // Absorbing states: late events from in-flight jobs are discarded.
        if record.status.is_terminal() || record.status == RunStatus::Stalled {
            tracing::debug!(
                run_id = %run_id,
                status = %record.status,
                event = %event.event_type,
                "discarding event for settled run"
            );
            return Ok(true);
        }

        // At most one terminal event per run stream.
        if event.event_type.is_terminal() && self.has_terminal_event(run_id).await? {
            return Ok(true);
        }

        let stored = self
            .store
            .stream_append(&self.config.run_stream(run_id), event.clone())
            .await?;
        self.fabric
            .publish_topic(&StreamFabric::run_topic(run_id), stored.clone());

        let flow = self
            .registry
            .flow(&flow_name)
            .ok_or_else(|| Error::UnknownFlow(flow_name.clone()))?;

        match stored.event_type {
            EventType::FlowStart => {
                self.stats_add(&flow_name, "total_runs", 1).await;
                self.stats_add(&flow_name, "running", 1).await;
                Ok(false)
            }
            EventType::Emit => {
                let token = stored.emit_name().map(str::to_string);
                if let Some(token) = token {
                    self.update_record(&flow_name, run_id, move |record| {
                        record.emitted_events.insert(token.clone());
                        record.last_activity_at = Utc::now();
                    })
                    .await?;
                }
                self.evaluate_ready(&flow, run_id).await?;
                Ok(false)
            }
            EventType::StepStarted | EventType::StepRetry => {
                self.update_record(&flow_name, run_id, |record| {
                    record.last_activity_at = Utc::now();
                })
                .await?;
                Ok(false)
            }
            EventType::Log | EventType::State => Ok(false),
            EventType::StepCompleted => self.on_step_completed(&flow, run_id, &stored).await,
            EventType::StepFailed => {
                self.update_record(&flow_name, run_id, |record| {
                    record.last_activity_at = Utc::now();
                })
                .await?;
                self.check_completion(&flow, run_id).await?;
                Ok(false)
            }
            EventType::AwaitRegistered => self.on_await_registered(&flow_name, run_id, &stored).await,
            EventType::AwaitResolved => self.on_await_resolved(&flow, run_id, &stored).await,
            EventType::AwaitTimeout => self.on_await_timeout(&flow, run_id, &stored).await,
            EventType::FlowCancel => {
                let previous = record.status;
                self.update_record(&flow_name, run_id, |record| {
                    record.status = RunStatus::Canceled;
                    record.completed_at = Some(Utc::now());
                    record.last_activity_at = Utc::now();
                })
                .await?;
                self.stats_transition(&flow_name, previous, "canceled").await;
                let drained = self.broker.drain_run(run_id).await.unwrap_or(0);
                tracing::info!(run_id = %run_id, drained, "run canceled");
                Ok(true)
            }
            EventType::FlowStalled => {
                let previous = record.status;
                self.update_record(&flow_name, run_id, |record| {
                    record.status = RunStatus::Stalled;
                    record.last_activity_at = Utc::now();
                })
                .await?;
                self.stats_transition(&flow_name, previous, "stalled").await;
                Ok(true)
            }
            EventType::FlowCompleted | EventType::FlowFailed => {
                let terminal = if stored.event_type == EventType::FlowCompleted {
                    RunStatus::Completed
                } else {
                    RunStatus::Failed
                };
                let previous = record.status;
                self.update_record(&flow_name, run_id, move |record| {
                    record.status = terminal;
                    record.completed_at = Some(Utc::now());
                    record.last_activity_at = Utc::now();
                })
                .await?;
                self.stats_transition(&flow_name, previous, terminal.as_str())
                    .await;
                tracing::info!(run_id = %run_id, status = %terminal, "run finished");
                Ok(true)
            }
            EventType::TriggerRegistered
            | EventType::TriggerUpdated
            | EventType::TriggerFired
            | EventType::SubscriptionAdded
            | EventType::SubscriptionRemoved => Ok(false),
        }
    }

    async fn on_step_completed(
        &self,
        flow: &Arc<AnalyzedFlow>,
        run_id: RunId,
        event: &FlowEvent,
    ) -> Result<bool> {
        let step_name = event
            .step_name
            .clone()
            .ok_or_else(|| Error::TransientStore("step.completed without step name".to_string()))?;

        let key = self.config.flow_runs_index(&flow.id);
        let completed = self
            .store
            .index_increment(&key, &run_id.to_string(), "completed_steps", 1)
            .await?;

        let step_for_record = step_name.clone();
        let record = self
            .update_record(&flow.id, run_id, move |record| {
                record.completed_step_names.insert(step_for_record.clone());
                record.last_activity_at = Utc::now();
                // Reconcile the static lower bound with observed work.
                record.step_count = record.step_count.max(completed as u32);
            })
            .await?;

        let step = flow
            .step(&step_name)
            .ok_or_else(|| Error::UnknownFlow(format!("{}::{step_name}", flow.id)))?;

        // An after-await suspends downstream dispatch until resolution.
        if let Some(await_config) = &step.await_after {
            let fresh = match record.awaiting_steps.get(&step_name) {
                None => true,
                Some(a) => a.status == AwaitingStatus::Timeout,
            };
            if fresh {
                let input = self.run_input(run_id).await.unwrap_or(Value::Null);
                self.awaits
                    .register(
                        run_id,
                        &flow.id,
                        &step_name,
                        await_config,
                        AwaitPosition::After,
                        &input,
                    )
                    .await?;
                return Ok(false);
            }
        }

        self.evaluate_ready(flow, run_id).await?;
        self.check_completion(flow, run_id).await?;
        Ok(false)
    }

    async fn on_await_registered(
        &self,
        flow_name: &str,
        run_id: RunId,
        event: &FlowEvent,
    ) -> Result<bool> {
        let step_name = event
            .step_name
            .clone()
            .ok_or_else(|| Error::TransientStore("await event without step name".to_string()))?;
        let awaiting: AwaitingStep = AwaitingStep {
            await_type: serde_json::from_value(event.data["await_type"].clone())?,
            position: serde_json::from_value(event.data["position"].clone())?,
            registered_at: event.ts,
            timeout_at: serde_json::from_value(event.data["timeout_at"].clone()).ok(),
            status: AwaitingStatus::Awaiting,
            resolved_at: None,
            timeout_action: serde_json::from_value(event.data["timeout_action"].clone())
                .unwrap_or(TimeoutAction::Fail),
        };

        let previous = load_run_record(self.store.as_ref(), &self.config, flow_name, run_id)
            .await?
            .map(|(r, _)| r.status);
        let record = self
            .update_record(flow_name, run_id, move |record| {
                record.awaiting_steps.insert(step_name.clone(), awaiting.clone());
                if record.status == RunStatus::Running {
                    record.status = RunStatus::Awaiting;
                }
                record.last_activity_at = Utc::now();
            })
            .await?;

        if previous == Some(RunStatus::Running) && record.status == RunStatus::Awaiting {
            self.stats_add(flow_name, "running", -1).await;
            self.stats_add(flow_name, "awaiting", 1).await;
        }
        Ok(false)
    }

    async fn on_await_resolved(
        &self,
        flow: &Arc<AnalyzedFlow>,
        run_id: RunId,
        event: &FlowEvent,
    ) -> Result<bool> {
        let step_name = event
            .step_name
            .clone()
            .ok_or_else(|| Error::TransientStore("await event without step name".to_string()))?;

        let previous = load_run_record(self.store.as_ref(), &self.config, &flow.id, run_id)
            .await?
            .map(|(r, _)| r.status);
        let step = step_name.clone();
        let record = self
            .update_record(&flow.id, run_id, move |record| {
                if let Some(awaiting) = record.awaiting_steps.get_mut(&step) {
                    awaiting.status = AwaitingStatus::Resolved;
                    awaiting.resolved_at = Some(Utc::now());
                }
                if record.status == RunStatus::Awaiting && !record.has_active_awaits() {
                    record.status = RunStatus::Running;
                }
                record.last_activity_at = Utc::now();
            })
            .await?;
        if previous == Some(RunStatus::Awaiting) && record.status == RunStatus::Running {
            self.stats_add(&flow.id, "awaiting", -1).await;
            self.stats_add(&flow.id, "running", 1).await;
        }

        let position: AwaitPosition = serde_json::from_value(event.data["position"].clone())
            .unwrap_or(AwaitPosition::Before);
        match position {
            AwaitPosition::Before => {
                let input = self.run_input(run_id).await.unwrap_or(Value::Null);
                self.enqueue_step(flow, run_id, &step_name, input).await?;
            }
            AwaitPosition::After => {
                self.evaluate_ready(flow, run_id).await?;
                self.check_completion(flow, run_id).await?;
            }
        }
        Ok(false)
    }

    async fn on_await_timeout(
        &self,
        flow: &Arc<AnalyzedFlow>,
        run_id: RunId,
        event: &FlowEvent,
    ) -> Result<bool> {
        let step_name = event
            .step_name
            .clone()
            .ok_or_else(|| Error::TransientStore("await event without step name".to_string()))?;
        let action: TimeoutAction = serde_json::from_value(event.data["timeout_action"].clone())
            .unwrap_or(TimeoutAction::Fail);
        let position: AwaitPosition = serde_json::from_value(event.data["position"].clone())
            .unwrap_or(AwaitPosition::Before);

        let previous = load_run_record(self.store.as_ref(), &self.config, &flow.id, run_id)
            .await?
            .map(|(r, _)| r.status);
        let step = step_name.clone();
        let record = self
            .update_record(&flow.id, run_id, move |record| {
                if let Some(awaiting) = record.awaiting_steps.get_mut(&step) {
                    awaiting.status = AwaitingStatus::Timeout;
                }
                if record.status == RunStatus::Awaiting
                    && !record.has_active_awaits()
                    && action != TimeoutAction::Fail
                {
                    record.status = RunStatus::Running;
                }
                record.last_activity_at = Utc::now();
            })
            .await?;
        let flipped_to_running =
            previous == Some(RunStatus::Awaiting) && record.status == RunStatus::Running;

        match action {
            TimeoutAction::Fail => {
                self.fabric.publish(
                    FlowEvent::new(EventType::FlowFailed, run_id, flow.id.clone()).with_data(
                        serde_json::json!({
                            "reason": "await timeout",
                            "step": step_name,
                        }),
                    ),
                );
            }
            TimeoutAction::Continue => {
                if flipped_to_running {
                    self.stats_add(&flow.id, "awaiting", -1).await;
                    self.stats_add(&flow.id, "running", 1).await;
                }
                match position {
                    AwaitPosition::Before => {
                        let input = self.run_input(run_id).await.unwrap_or(Value::Null);
                        self.enqueue_step(flow, run_id, &step_name, input).await?;
                    }
                    AwaitPosition::After => {
                        self.evaluate_ready(flow, run_id).await?;
                        self.check_completion(flow, run_id).await?;
                    }
                }
            }
            TimeoutAction::Retry => {
                if flipped_to_running {
                    self.stats_add(&flow.id, "awaiting", -1).await;
                    self.stats_add(&flow.id, "running", 1).await;
                }
                let step = flow
                    .step(&step_name)
                    .ok_or_else(|| Error::UnknownFlow(format!("{}::{step_name}", flow.id)))?;
                match position {
                    AwaitPosition::Before => {
                        // Wait again for the external signal.
                        if let Some(await_config) = &step.await_before {
                            let input = self.run_input(run_id).await.unwrap_or(Value::Null);
                            self.awaits
                                .register(
                                    run_id,
                                    &flow.id,
                                    &step_name,
                                    await_config,
                                    AwaitPosition::Before,
                                    &input,
                                )
                                .await?;
                        }
                    }
                    AwaitPosition::After => {
                        // Re-run the step; its completion re-registers
                        // the after-await.
                        let input = self.run_input(run_id).await.unwrap_or(Value::Null);
                        self.enqueue_step(flow, run_id, &step_name, input).await?;
                    }
                }
            }
        }
        Ok(false)
    }

    // --- Step readiness and completion ---

    /// Evaluate every not-yet-started step, in level order then declared
    /// order, dispatching the ones whose subscriptions are satisfied.
    async fn evaluate_ready(&self, flow: &Arc<AnalyzedFlow>, run_id: RunId) -> Result<()> {
        let Some((record, _)) =
            load_run_record(self.store.as_ref(), &self.config, &flow.id, run_id).await?
        else {
            return Ok(());
        };
        if record.status.is_terminal() || record.status == RunStatus::Stalled {
            return Ok(());
        }

        let touched = self
            .store
            .stream_read(
                &self.config.run_stream(run_id),
                &ReadOptions::of_types([
                    EventType::StepStarted,
                    EventType::StepFailed,
                ]),
            )
            .await?;
        let started: HashSet<&str> = touched
            .iter()
            .filter_map(|e| e.step_name.as_deref())
            .collect();

        let mut candidates: Vec<&crate::analyzer::AnalyzedStep> = flow
            .steps
            .iter()
            .skip(1)
            .filter(|s| !started.contains(s.name.as_str()))
            .filter(|s| !record.completed_step_names.contains(&s.name))
            .collect();
        candidates.sort_by_key(|s| s.level);

        for step in candidates {
            if let Some(awaiting) = record.awaiting_steps.get(&step.name) {
                if awaiting.position == AwaitPosition::Before
                    && awaiting.status == AwaitingStatus::Awaiting
                {
                    continue;
                }
            }
            if !self.tokens_satisfied(flow, &record, step) {
                continue;
            }

            let registered_before = record
                .awaiting_steps
                .get(&step.name)
                .map(|a| a.position == AwaitPosition::Before)
                .unwrap_or(false);
            if step.await_before.is_some() && !registered_before {
                let input = self.run_input(run_id).await.unwrap_or(Value::Null);
                self.awaits
                    .register(
                        run_id,
                        &flow.id,
                        &step.name,
                        step.await_before.as_ref().unwrap(),
                        AwaitPosition::Before,
                        &input,
                    )
                    .await?;
                continue;
            }

            let input = self.run_input(run_id).await.unwrap_or(Value::Null);
            self.enqueue_step(flow, run_id, &step.name, input).await?;
        }
        Ok(())
    }

    fn tokens_satisfied(
        &self,
        flow: &AnalyzedFlow,
        record: &RunRecord,
        step: &crate::analyzer::AnalyzedStep,
    ) -> bool {
        step.effective_subscribes.iter().all(|token| {
            if record.emitted_events.contains(token) {
                return true;
            }
            if let Some(name) = token.strip_prefix("step:") {
                return record.completed_step_names.contains(name);
            }
            // queue:/worker: forms never land in emittedEvents; fall back
            // to the statically resolved emitters.
            let emitters = flow.emitters_of(token);
            !emitters.is_empty()
                && emitters
                    .iter()
                    .all(|s| record.completed_step_names.contains(*s))
        })
    }

    /// Terminal analysis: when every step has settled, exactly one
    /// terminal event goes out; failures dominate.
    async fn check_completion(&self, flow: &Arc<AnalyzedFlow>, run_id: RunId) -> Result<()> {
        let Some((record, _)) =
            load_run_record(self.store.as_ref(), &self.config, &flow.id, run_id).await?
        else {
            return Ok(());
        };
        if record.status.is_terminal() || record.has_active_awaits() {
            return Ok(());
        }

        let events = self
            .store
            .stream_read(
                &self.config.run_stream(run_id),
                &ReadOptions::of_types([EventType::StepCompleted, EventType::StepFailed]),
            )
            .await?;

        // Latest event wins per step: a retried failure that later
        // completes counts as completed.
        let mut outcome: HashMap<&str, EventType> = HashMap::new();
        for event in &events {
            if let Some(step) = event.step_name.as_deref() {
                outcome.insert(step, event.event_type);
            }
        }

        let all_settled = flow.step_names().all(|s| outcome.contains_key(s));
        if !all_settled {
            return Ok(());
        }

        let any_failed = outcome.values().any(|t| *t == EventType::StepFailed);
        let (event_type, completed, failed) = (
            if any_failed {
                EventType::FlowFailed
            } else {
                EventType::FlowCompleted
            },
            outcome
                .values()
                .filter(|t| **t == EventType::StepCompleted)
                .count(),
            outcome
                .values()
                .filter(|t| **t == EventType::StepFailed)
                .count(),
        );

        self.fabric.publish(
            FlowEvent::new(event_type, run_id, flow.id.clone()).with_data(serde_json::json!({
                "completed_steps": completed,
                "failed_steps": failed,
            })),
        );
        Ok(())
    }

    // --- Helpers ---

    async fn enqueue_step(
        &self,
        flow: &Arc<AnalyzedFlow>,
        run_id: RunId,
        step_name: &str,
        input: Value,
    ) -> Result<()> {
        let step = flow
            .step(step_name)
            .ok_or_else(|| Error::UnknownFlow(format!("{}::{step_name}", flow.id)))?;
        let payload = StepJobPayload {
            flow_id: run_id,
            flow_name: flow.id.clone(),
            step: step_name.to_string(),
            input,
        };
        let job = Job::new(
            step.queue.as_str(),
            payload.job_id(),
            serde_json::to_value(&payload)?,
        )
        .with_attempts(self.config.job_attempts);
        // Duplicate IDs are idempotent success: the step is scheduled.
        self.broker.enqueue(job).await?;
        Ok(())
    }

    /// Original input of a run, recovered from its `flow.start` event.
    async fn run_input(&self, run_id: RunId) -> Result<Value> {
        let events = self
            .store
            .stream_read(
                &self.config.run_stream(run_id),
                &ReadOptions::of_types([EventType::FlowStart]),
            )
            .await?;
        events
            .first()
            .map(|e| e.data.get("input").cloned().unwrap_or(Value::Null))
            .ok_or(Error::UnknownRun(run_id))
    }

    async fn has_terminal_event(&self, run_id: RunId) -> Result<bool> {
        let events = self
            .store
            .stream_read(
                &self.config.run_stream(run_id),
                &ReadOptions::of_types([
                    EventType::FlowCompleted,
                    EventType::FlowFailed,
                    EventType::FlowCancel,
                    EventType::FlowStalled,
                ]),
            )
            .await?;
        Ok(!events.is_empty())
    }

    async fn update_record(
        &self,
        flow_name: &str,
        run_id: RunId,
        mutate: impl Fn(&mut RunRecord) + Send + Sync,
    ) -> Result<RunRecord> {
        let key = self.config.flow_runs_index(flow_name);
        let entry = self
            .store
            .index_update_with_retry(&key, &run_id.to_string(), &move |metadata| {
                let Ok(mut record) = serde_json::from_value::<RunRecord>(metadata.clone()) else {
                    return;
                };
                mutate(&mut record);
                if let Ok(value) = serde_json::to_value(&record) {
                    *metadata = value;
                }
            })
            .await?;
        Ok(serde_json::from_value(entry.metadata)?)
    }

    async fn stats_add(&self, flow_name: &str, field: &str, delta: i64) {
        let key = self.config.flow_stats_index();
        match self.store.index_increment(&key, flow_name, field, delta).await {
            Ok(value) => {
                self.fabric.publish_topic(
                    StreamFabric::FLOW_STATS_TOPIC,
                    FlowEvent::unscoped(EventType::State).with_data(serde_json::json!({
                        "flow": flow_name,
                        "field": field,
                        "value": value,
                    })),
                );
            }
            Err(e) => {
                tracing::warn!(flow = flow_name, field, error = %e, "stats update failed");
            }
        }
    }

    async fn stats_transition(&self, flow_name: &str, previous: RunStatus, target: &str) {
        let gauge = match previous {
            RunStatus::Running => "running",
            RunStatus::Awaiting => "awaiting",
            // Stalled runs were already removed from both gauges.
            _ => {
                self.stats_add(flow_name, target, 1).await;
                return;
            }
        };
        self.stats_add(flow_name, gauge, -1).await;
        self.stats_add(flow_name, target, 1).await;
    }
}
