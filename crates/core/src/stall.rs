use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::fabric::StreamFabric;
use crate::orchestrator::load_run_record;
use crate::registry::FlowRegistry;
use crate::storage::Store;
use crate::types::{EventType, FlowEvent, RunId, RunRecord, RunStatus};

pub const REASON_RESTART: &str = "Server restart - flow state lost";
pub const REASON_AWAIT_TIMEOUT: &str = "Await pattern timed out";
pub const REASON_NO_ACTIVITY: &str = "No activity within stall timeout";

/// What startup recovery did.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub stalled: usize,
    /// Runs whose status was corrected from running to awaiting.
    pub corrected: usize,
    /// Flow-stats entries patched or dropped.
    pub stats_patched: usize,
}

/// Reconciles run state that in-memory orchestration lost: startup
/// recovery, a lazy per-run check, and a periodic sweep.
pub struct StallDetector {
    store: Arc<dyn Store>,
    fabric: Arc<StreamFabric>,
    registry: Arc<FlowRegistry>,
    config: RuntimeConfig,
}

impl StallDetector {
    pub fn new(
        store: Arc<dyn Store>,
        fabric: Arc<StreamFabric>,
        registry: Arc<FlowRegistry>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            fabric,
            registry,
            config,
        })
    }

    /// Startup pass. Runs before any new traffic, so stalled transitions
    /// are applied directly against the store and the stats gauges are
    /// recomputed wholesale afterwards.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for flow_name in self.registry.flow_names() {
            for record in self.flow_runs(&flow_name).await? {
                let active: Vec<_> = record.active_awaits().collect();
                let overdue = active
                    .iter()
                    .any(|(_, a)| a.timeout_at.map(|t| t < now).unwrap_or(false));

                match record.status {
                    RunStatus::Running if active.is_empty() => {
                        self.mark_stalled_direct(&record, REASON_RESTART).await?;
                        report.stalled += 1;
                    }
                    RunStatus::Running | RunStatus::Awaiting if overdue => {
                        self.mark_stalled_direct(&record, REASON_AWAIT_TIMEOUT).await?;
                        report.stalled += 1;
                    }
                    RunStatus::Running => {
                        // Valid awaits survived the restart; the status
                        // just never made it to the index.
                        self.patch_status(&record, RunStatus::Awaiting).await?;
                        report.corrected += 1;
                    }
                    _ => {}
                }
            }
        }

        report.stats_patched = self.repair_flow_stats().await?;
        tracing::info!(
            stalled = report.stalled,
            corrected = report.corrected,
            stats_patched = report.stats_patched,
            "startup recovery finished"
        );
        Ok(report)
    }

    /// Lazy check for a single run.
    pub async fn is_stalled(&self, flow_name: &str, run_id: RunId) -> Result<bool> {
        let Some((record, _)) =
            load_run_record(self.store.as_ref(), &self.config, flow_name, run_id).await?
        else {
            return Ok(false);
        };
        if record.status != RunStatus::Running || record.has_active_awaits() {
            return Ok(false);
        }
        let timeout = self.stall_timeout_ms(flow_name, &record);
        let idle = (Utc::now() - record.last_activity_at).num_milliseconds();
        Ok(idle > timeout as i64)
    }

    /// Arm the periodic sweep.
    pub fn start(self: Arc<Self>) {
        let detector = self;
        let interval = Duration::from_millis(detector.config.check_interval_ms.max(1000));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match detector.sweep().await {
                    Ok(0) => {}
                    Ok(stalled) => tracing::warn!(stalled, "stall sweep marked runs"),
                    Err(e) => tracing::error!(error = %e, "stall sweep failed"),
                }
            }
        });
    }

    /// One sweep over all live runs. Stall transitions go through the
    /// bus so the orchestrator applies them like any other event.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut marked = 0;

        for flow_name in self.registry.flow_names() {
            for record in self.flow_runs(&flow_name).await? {
                if record.status != RunStatus::Running && record.status != RunStatus::Awaiting {
                    continue;
                }

                let active: Vec<_> = record.active_awaits().collect();
                let overdue = active
                    .iter()
                    .any(|(_, a)| a.timeout_at.map(|t| t < now).unwrap_or(false));

                if !active.is_empty() {
                    if overdue {
                        self.publish_stalled(&record, REASON_AWAIT_TIMEOUT);
                        marked += 1;
                    }
                    // Valid awaits: not stalled, whatever the clock says.
                    continue;
                }

                let timeout = self.stall_timeout_ms(&flow_name, &record);
                let idle = (now - record.last_activity_at).num_milliseconds();
                if record.status == RunStatus::Running && idle > timeout as i64 {
                    self.publish_stalled(&record, REASON_NO_ACTIVITY);
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    /// Drop stats entries for unregistered flows and recompute the
    /// running/awaiting gauges from the run indices. Cumulative counters
    /// are left alone.
    async fn repair_flow_stats(&self) -> Result<usize> {
        let stats_key = self.config.flow_stats_index();
        let count = self.store.index_count(&stats_key).await?;
        let entries = self.store.index_read(&stats_key, 0, count.max(1)).await?;
        let known = self.registry.flow_names();

        let mut patched = 0;
        for entry in entries {
            if !known.contains(&entry.id) {
                tracing::warn!(flow = %entry.id, "dropping stats for unknown flow");
                self.store.index_delete(&stats_key, &entry.id).await?;
                patched += 1;
                continue;
            }

            let mut running = 0i64;
            let mut awaiting = 0i64;
            for record in self.flow_runs(&entry.id).await? {
                match record.status {
                    RunStatus::Running => running += 1,
                    RunStatus::Awaiting => awaiting += 1,
                    _ => {}
                }
            }

            let stale = entry.metadata["running"].as_i64().unwrap_or(0) != running
                || entry.metadata["awaiting"].as_i64().unwrap_or(0) != awaiting;
            if stale {
                self.store
                    .index_update_with_retry(&stats_key, &entry.id, &move |metadata| {
                        crate::storage::set_field(metadata, "running", Value::from(running));
                        crate::storage::set_field(metadata, "awaiting", Value::from(awaiting));
                    })
                    .await?;
                patched += 1;
            }
        }
        Ok(patched)
    }

    fn stall_timeout_ms(&self, flow_name: &str, record: &RunRecord) -> u64 {
        record
            .meta
            .stall_timeout_ms
            .or_else(|| self.registry.flow(flow_name).and_then(|f| f.stall_timeout_ms))
            .unwrap_or(self.config.stall_timeout_ms)
    }

    async fn flow_runs(&self, flow_name: &str) -> Result<Vec<RunRecord>> {
        let key = self.config.flow_runs_index(flow_name);
        let count = self.store.index_count(&key).await?;
        let entries = self.store.index_read(&key, 0, count.max(1)).await?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<RunRecord>(entry.metadata) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(run = %entry.id, error = %e, "undecodable run record"),
            }
        }
        Ok(records)
    }

    fn publish_stalled(&self, record: &RunRecord, reason: &str) {
        tracing::warn!(run_id = %record.run_id, flow = %record.flow_name, reason, "marking run stalled");
        self.fabric.publish(
            FlowEvent::new(EventType::FlowStalled, record.run_id, record.flow_name.clone())
                .with_data(serde_json::json!({
                    "reason": reason,
                    "previousStatus": record.status,
                })),
        );
    }

    /// Direct stalled transition for startup recovery: append the event,
    /// patch the record, skip per-event stats (gauges are recomputed
    /// right after).
    async fn mark_stalled_direct(&self, record: &RunRecord, reason: &str) -> Result<()> {
        tracing::warn!(run_id = %record.run_id, flow = %record.flow_name, reason, "recovered run is stalled");
        let event = FlowEvent::new(
            EventType::FlowStalled,
            record.run_id,
            record.flow_name.clone(),
        )
        .with_data(serde_json::json!({
            "reason": reason,
            "previousStatus": record.status,
        }));
        let stored = self
            .store
            .stream_append(&self.config.run_stream(record.run_id), event)
            .await?;
        self.fabric
            .publish_topic(&StreamFabric::run_topic(record.run_id), stored);
        self.patch_status(record, RunStatus::Stalled).await
    }

    async fn patch_status(&self, record: &RunRecord, status: RunStatus) -> Result<()> {
        let key = self.config.flow_runs_index(&record.flow_name);
        self.store
            .index_update_with_retry(&key, &record.run_id.to_string(), &move |metadata| {
                crate::storage::set_field(
                    metadata,
                    "status",
                    serde_json::to_value(status).unwrap_or(Value::Null),
                );
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{
        AwaitKind, AwaitPosition, AwaitingStatus, AwaitingStep, TimeoutAction, WorkerManifest,
        WorkerRole,
    };

    fn registry_with_flow(flow: &str) -> Arc<FlowRegistry> {
        let registry = FlowRegistry::new();
        registry
            .load_manifests(&[WorkerManifest {
                flow_names: vec![flow.to_string()],
                role: WorkerRole::Entry,
                step: "s1".to_string(),
                queue: "q".to_string(),
                worker_id: "w1".to_string(),
                subscribes: vec![],
                emits: vec![],
                trigger_subscriptions: vec![],
                await_before: None,
                await_after: None,
                step_timeout_ms: None,
                stall_timeout_ms: None,
            }])
            .unwrap();
        Arc::new(registry)
    }

    async fn seed_run(
        store: &dyn Store,
        config: &RuntimeConfig,
        record: &RunRecord,
    ) {
        store
            .index_add(
                &config.flow_runs_index(&record.flow_name),
                &record.run_id.to_string(),
                record.started_at.timestamp_millis(),
                serde_json::to_value(record).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn restart_marks_abandoned_running_runs() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = RuntimeConfig::default();
        let registry = registry_with_flow("orders");
        let fabric = StreamFabric::new();

        let mut record = RunRecord::new(RunId::new(), "orders", 2);
        record.last_activity_at = Utc::now() - chrono::Duration::hours(1);
        seed_run(store.as_ref(), &config, &record).await;

        let detector = StallDetector::new(store.clone(), fabric, registry, config.clone());
        let report = detector.recover_on_startup().await.unwrap();
        assert_eq!(report.stalled, 1);

        let (after, _) = load_run_record(store.as_ref(), &config, "orders", record.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, RunStatus::Stalled);

        let events = store
            .stream_read(&config.run_stream(record.run_id), &Default::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::FlowStalled);
        assert_eq!(events[0].data["reason"], REASON_RESTART);
        assert_eq!(events[0].data["previousStatus"], "running");
    }

    #[tokio::test]
    async fn overdue_awaits_stall_and_valid_awaits_correct_status() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = RuntimeConfig::default();
        let registry = registry_with_flow("orders");
        let fabric = StreamFabric::new();

        let awaiting = |timeout_at| AwaitingStep {
            await_type: AwaitKind::Webhook,
            position: AwaitPosition::Before,
            registered_at: Utc::now() - chrono::Duration::hours(2),
            timeout_at: Some(timeout_at),
            status: AwaitingStatus::Awaiting,
            resolved_at: None,
            timeout_action: TimeoutAction::Fail,
        };

        // Overdue await on an awaiting run.
        let mut overdue = RunRecord::new(RunId::new(), "orders", 2);
        overdue.status = RunStatus::Awaiting;
        overdue
            .awaiting_steps
            .insert("s1".to_string(), awaiting(Utc::now() - chrono::Duration::hours(1)));
        seed_run(store.as_ref(), &config, &overdue).await;

        // Valid await on a run still marked running.
        let mut valid = RunRecord::new(RunId::new(), "orders", 2);
        valid
            .awaiting_steps
            .insert("s1".to_string(), awaiting(Utc::now() + chrono::Duration::hours(1)));
        seed_run(store.as_ref(), &config, &valid).await;

        let detector = StallDetector::new(store.clone(), fabric, registry, config.clone());
        let report = detector.recover_on_startup().await.unwrap();
        assert_eq!(report.stalled, 1);
        assert_eq!(report.corrected, 1);

        let (a, _) = load_run_record(store.as_ref(), &config, "orders", overdue.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.status, RunStatus::Stalled);

        let (b, _) = load_run_record(store.as_ref(), &config, "orders", valid.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.status, RunStatus::Awaiting);
    }

    #[tokio::test]
    async fn stats_repair_recomputes_gauges_and_drops_unknown_flows() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = RuntimeConfig::default();
        let registry = registry_with_flow("orders");
        let fabric = StreamFabric::new();

        let mut running = RunRecord::new(RunId::new(), "orders", 2);
        running.last_activity_at = Utc::now();
        seed_run(store.as_ref(), &config, &running).await;

        let stats_key = config.flow_stats_index();
        store
            .index_add(
                &stats_key,
                "orders",
                0,
                serde_json::json!({"total_runs": 7, "running": 5, "awaiting": 2}),
            )
            .await
            .unwrap();
        store
            .index_add(&stats_key, "ghost-flow", 0, serde_json::json!({"running": 1}))
            .await
            .unwrap();

        let detector = StallDetector::new(store.clone(), fabric, registry, config.clone());
        detector.recover_on_startup().await.unwrap();

        assert!(store.index_get(&stats_key, "ghost-flow").await.unwrap().is_none());
        let entry = store.index_get(&stats_key, "orders").await.unwrap().unwrap();
        // Gauges recomputed, cumulative counters untouched. The seeded
        // run had no awaits, so recovery stalls it first.
        assert_eq!(entry.metadata["total_runs"], 7);
        assert_eq!(entry.metadata["running"], 0);
        assert_eq!(entry.metadata["awaiting"], 0);
    }

    #[tokio::test]
    async fn lazy_check_uses_stall_timeout() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = RuntimeConfig::default();
        let registry = registry_with_flow("orders");
        let fabric = StreamFabric::new();

        let mut record = RunRecord::new(RunId::new(), "orders", 2);
        record.meta.stall_timeout_ms = Some(1);
        record.last_activity_at = Utc::now() - chrono::Duration::seconds(5);
        seed_run(store.as_ref(), &config, &record).await;

        let detector = StallDetector::new(store, fabric, registry, config);
        assert!(detector.is_stalled("orders", record.run_id).await.unwrap());
    }
}
