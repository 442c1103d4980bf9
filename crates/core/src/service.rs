use serde_json::Value;
use std::sync::Arc;

use crate::awaits::AwaitManager;
use crate::broker::{InProcessBroker, JobBroker};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::fabric::StreamFabric;
use crate::orchestrator::FlowOrchestrator;
use crate::registry::FlowRegistry;
use crate::scheduler::{ScheduledJob, Scheduler, TASK_TRIGGER_CRON};
use crate::stall::StallDetector;
use crate::storage::{MemoryStore, Store};
use crate::trigger::{RegisterTrigger, TriggerRuntime};
use crate::types::{SubscriptionMode, TriggerKind, WorkerManifest};
use crate::worker::{StepHandler, StepRunner};

/// The assembled flow runtime: store, fabric, broker, registry,
/// triggers, awaits, orchestrator, scheduler, and stall detector wired
/// together and recovered from persisted state.
pub struct NventService {
    pub config: RuntimeConfig,
    pub store: Arc<dyn Store>,
    pub fabric: Arc<StreamFabric>,
    pub broker: Arc<dyn JobBroker>,
    pub registry: Arc<FlowRegistry>,
    pub triggers: Arc<TriggerRuntime>,
    pub scheduler: Arc<Scheduler>,
    pub awaits: Arc<AwaitManager>,
    pub orchestrator: Arc<FlowOrchestrator>,
    pub detector: Arc<StallDetector>,
}

pub struct NventServiceBuilder {
    config: RuntimeConfig,
    store: Option<Arc<dyn Store>>,
    broker: Option<Arc<dyn JobBroker>>,
    manifests: Vec<WorkerManifest>,
    handlers: Vec<(String, Arc<dyn StepHandler>)>,
}

impl NventService {
    pub fn builder() -> NventServiceBuilder {
        NventServiceBuilder {
            config: RuntimeConfig::default(),
            store: None,
            broker: None,
            manifests: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Register a trigger and, for schedule-kind triggers, arm its
    /// recurring cron job.
    pub async fn register_trigger(&self, opts: RegisterTrigger) -> Result<()> {
        let schedule = opts.schedule.clone();
        let name = opts.name.clone();
        let trigger = self.triggers.register_trigger(opts).await?;

        if trigger.kind == TriggerKind::Schedule {
            if let Some(schedule) = schedule {
                self.scheduler
                    .schedule(ScheduledJob::recurring(
                        format!("trigger-cron:{name}"),
                        schedule.cron,
                        schedule.timezone,
                        TASK_TRIGGER_CRON,
                        serde_json::json!({ "trigger": name }),
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl NventServiceBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn JobBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn manifests(mut self, manifests: impl IntoIterator<Item = WorkerManifest>) -> Self {
        self.manifests.extend(manifests);
        self
    }

    pub fn handler(mut self, worker_id: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.push((worker_id.into(), handler));
        self
    }

    /// Wire everything up and run recovery. Ordering matters: the
    /// orchestrator must be on the bus before triggers hydrate or the
    /// detector publishes, and scheduler recovery goes last so replayed
    /// timers find their handlers attached.
    pub async fn build(self) -> Result<NventService> {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let broker = self
            .broker
            .unwrap_or_else(|| InProcessBroker::new() as Arc<dyn JobBroker>);

        let fabric = StreamFabric::new();

        let registry = Arc::new(FlowRegistry::new());
        let flows = registry.load_manifests(&self.manifests)?;
        for (worker_id, handler) in self.handlers {
            registry.register_handler(worker_id, handler);
        }

        let scheduler = Scheduler::new(store.clone(), config.clone());
        let triggers = TriggerRuntime::new(store.clone(), fabric.clone(), config.clone());
        let awaits = AwaitManager::new(
            store.clone(),
            fabric.clone(),
            scheduler.clone(),
            registry.clone(),
            config.clone(),
        );
        awaits.clone().attach_scheduler_tasks();

        // Cron-fired triggers loop back through the trigger runtime.
        {
            let triggers = triggers.clone();
            scheduler.register_task(TASK_TRIGGER_CRON, move |payload: Value| {
                let triggers = triggers.clone();
                async move {
                    let Some(name) = payload.get("trigger").and_then(|v| v.as_str()) else {
                        return;
                    };
                    if let Err(e) = triggers
                        .emit_trigger(name, serde_json::json!({}), None)
                        .await
                    {
                        tracing::warn!(trigger = name, error = %e, "cron trigger fire failed");
                    }
                }
            });
        }

        let orchestrator = FlowOrchestrator::new(
            store.clone(),
            fabric.clone(),
            broker.clone(),
            registry.clone(),
            awaits.clone(),
            triggers.clone(),
            config.clone(),
        );
        orchestrator.clone().start();

        // One worker pool per queue the flows reference.
        for queue in registry.queues() {
            let runner = Arc::new(StepRunner::new(
                registry.clone(),
                fabric.clone(),
                store.clone(),
                config.clone(),
            ));
            broker
                .process(&queue, config.queue_concurrency, runner)
                .await?;
        }

        triggers.hydrate().await?;

        // Manifest-declared trigger subscriptions, auto mode. Unknown
        // triggers are registered as plain event triggers first.
        for flow in &flows {
            for trigger_name in &flow.trigger_subscriptions {
                if triggers.get(trigger_name).is_none() {
                    triggers
                        .register_trigger(RegisterTrigger::new(trigger_name, TriggerKind::Event))
                        .await?;
                }
                triggers
                    .subscribe_trigger(trigger_name, &flow.id, SubscriptionMode::Auto)
                    .await?;
            }
        }

        let detector = StallDetector::new(
            store.clone(),
            fabric.clone(),
            registry.clone(),
            config.clone(),
        );
        detector.recover_on_startup().await?;
        detector.clone().start();

        scheduler.recover().await?;

        Ok(NventService {
            config,
            store,
            fabric,
            broker,
            registry,
            triggers,
            scheduler,
            awaits,
            orchestrator,
            detector,
        })
    }
}
