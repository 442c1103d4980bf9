//! End-to-end flow runtime tests on the in-memory store and in-process
//! broker: linear runs, awaits, fan-out, triggers, and startup recovery.

use async_trait::async_trait;
use chrono::Utc;
use nvent_core::service::NventService;
use nvent_core::storage::{MemoryStore, ReadOptions, Store};
use nvent_core::trigger::RegisterTrigger;
use nvent_core::types::{
    AwaitConfig, EventType, FlowEvent, RunId, RunRecord, RunStatus, SubscriptionMode,
    TimeoutAction, TriggerKind, WorkerManifest, WorkerRole,
};
use nvent_core::worker::{StepContext, StepHandler};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Poll a condition until it holds or five seconds pass.
macro_rules! wait_for {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", $what);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }};
}

fn manifest(flow: &str, role: WorkerRole, step: &str) -> WorkerManifest {
    WorkerManifest {
        flow_names: vec![flow.to_string()],
        role,
        step: step.to_string(),
        queue: format!("{flow}-queue"),
        worker_id: format!("{flow}-{step}"),
        subscribes: Vec::new(),
        emits: Vec::new(),
        trigger_subscriptions: Vec::new(),
        await_before: None,
        await_after: None,
        step_timeout_ms: None,
        stall_timeout_ms: None,
    }
}

/// Emits its configured tokens, optionally dawdling first.
struct EmitHandler {
    emits: Vec<String>,
    delay: Option<Duration>,
}

impl EmitHandler {
    fn new(emits: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            emits: emits.iter().map(|s| s.to_string()).collect(),
            delay: None,
        })
    }

    fn slow(emits: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            emits: emits.iter().map(|s| s.to_string()).collect(),
            delay: Some(delay),
        })
    }
}

#[async_trait]
impl StepHandler for EmitHandler {
    async fn run(&self, ctx: &StepContext, input: Value) -> nvent_core::Result<Value> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        for token in &self.emits {
            ctx.emit(token, json!({ "from": ctx.step_name }));
        }
        Ok(input)
    }
}

struct FailHandler;

#[async_trait]
impl StepHandler for FailHandler {
    async fn run(&self, ctx: &StepContext, _input: Value) -> nvent_core::Result<Value> {
        Err(nvent_core::Error::StepFailure {
            step: ctx.step_name.clone(),
            message: "intentional failure".to_string(),
        })
    }
}

async fn status_of(service: &NventService, flow: &str, run_id: RunId) -> Option<RunStatus> {
    service
        .orchestrator
        .run_record(flow, run_id)
        .await
        .unwrap()
        .map(|r| r.status)
}

async fn record_of(service: &NventService, flow: &str, run_id: RunId) -> RunRecord {
    service
        .orchestrator
        .run_record(flow, run_id)
        .await
        .unwrap()
        .expect("run record missing")
}

async fn events_of(service: &NventService, run_id: RunId) -> Vec<FlowEvent> {
    service
        .orchestrator
        .run_events(run_id, &ReadOptions::all())
        .await
        .unwrap()
}

fn position_of(events: &[FlowEvent], event_type: EventType, step: Option<&str>) -> usize {
    events
        .iter()
        .position(|e| e.event_type == event_type && e.step_name.as_deref() == step)
        .unwrap_or_else(|| panic!("no {event_type} event for step {step:?}"))
}

#[tokio::test]
async fn linear_two_step_flow_completes_in_order() {
    let mut entry = manifest("lin", WorkerRole::Entry, "s1");
    entry.emits = vec!["done1".to_string()];
    let mut s2 = manifest("lin", WorkerRole::Step, "s2");
    s2.subscribes = vec!["done1".to_string()];

    let service = NventService::builder()
        .manifests([entry, s2])
        .handler("lin-s1", EmitHandler::new(&["done1"]))
        .handler("lin-s2", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("lin", json!({"x": 1}))
        .await
        .unwrap();

    wait_for!(
        "run completion",
        status_of(&service, "lin", run_id).await == Some(RunStatus::Completed)
    );

    let events = events_of(&service, run_id).await;
    assert_eq!(events[0].event_type, EventType::FlowStart);
    assert_eq!(events[0].data["input"], json!({"x": 1}));
    assert_eq!(events.last().unwrap().event_type, EventType::FlowCompleted);

    // s1 runs and emits before s2 does anything; the terminal event is
    // unique and last.
    let s1_started = position_of(&events, EventType::StepStarted, Some("s1"));
    let s1_emit = position_of(&events, EventType::Emit, Some("s1"));
    let s1_done = position_of(&events, EventType::StepCompleted, Some("s1"));
    let s2_started = position_of(&events, EventType::StepStarted, Some("s2"));
    let s2_done = position_of(&events, EventType::StepCompleted, Some("s2"));
    assert!(s1_started < s1_emit);
    assert!(s1_emit < s1_done);
    assert!(s1_emit < s2_started);
    assert!(s2_started < s2_done);

    let terminal_count = events.iter().filter(|e| e.event_type.is_terminal()).count();
    assert_eq!(terminal_count, 1);

    let record = record_of(&service, "lin", run_id).await;
    assert_eq!(record.completed_steps, 2);
    assert!(record.step_count >= 2);
    assert!(record.completed_at.is_some());
    assert!(record.completed_at.unwrap() >= record.started_at);
    assert!(record.emitted_events.contains("done1"));
}

#[tokio::test]
async fn webhook_await_before_suspends_and_resumes() {
    let mut entry = manifest("wh", WorkerRole::Entry, "s1");
    entry.await_before = Some(AwaitConfig::Webhook {
        timeout_ms: Some(3_600_000),
        timeout_action: TimeoutAction::Fail,
        path: None,
    });

    let service = NventService::builder()
        .manifests([entry])
        .handler("wh-s1", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("wh", json!({"order": 7}))
        .await
        .unwrap();

    wait_for!(
        "awaiting status",
        status_of(&service, "wh", run_id).await == Some(RunStatus::Awaiting)
    );

    let pre = events_of(&service, run_id).await;
    assert!(pre.iter().any(|e| e.event_type == EventType::AwaitRegistered));
    assert!(!pre.iter().any(|e| e.event_type == EventType::StepStarted));

    let resolved = service
        .orchestrator
        .resolve_webhook("wh", run_id, "s1", json!({"approved": true}))
        .await
        .unwrap();
    assert!(resolved);

    wait_for!(
        "run completion",
        status_of(&service, "wh", run_id).await == Some(RunStatus::Completed)
    );

    let all = events_of(&service, run_id).await;
    let registered = position_of(&all, EventType::AwaitRegistered, Some("s1"));
    let resolved = position_of(&all, EventType::AwaitResolved, Some("s1"));
    let started = position_of(&all, EventType::StepStarted, Some("s1"));
    let completed = position_of(&all, EventType::StepCompleted, Some("s1"));
    assert!(registered < resolved);
    assert!(resolved < started);
    assert!(started < completed);

    let resolved_event = &all[resolved];
    assert_eq!(resolved_event.data["trigger_data"], json!({"approved": true}));

    // Second webhook call is a no-op.
    let again = service
        .orchestrator
        .resolve_webhook("wh", run_id, "s1", json!({}))
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn await_timeout_with_fail_action_fails_the_run() {
    let mut entry = manifest("tmo", WorkerRole::Entry, "s1");
    entry.await_before = Some(AwaitConfig::Webhook {
        timeout_ms: Some(150),
        timeout_action: TimeoutAction::Fail,
        path: None,
    });

    let service = NventService::builder()
        .manifests([entry])
        .handler("tmo-s1", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("tmo", Value::Null)
        .await
        .unwrap();

    wait_for!(
        "run failure",
        status_of(&service, "tmo", run_id).await == Some(RunStatus::Failed)
    );

    let all = events_of(&service, run_id).await;
    let timeout = position_of(&all, EventType::AwaitTimeout, Some("s1"));
    let failed = position_of(&all, EventType::FlowFailed, None);
    assert!(timeout < failed);
    assert_eq!(all[timeout].data["timeout_action"], "fail");
    // The step never ran.
    assert!(!all.iter().any(|e| e.event_type == EventType::StepStarted));
}

#[tokio::test]
async fn time_await_after_settles_at_the_delay() {
    let mut entry = manifest("tm", WorkerRole::Entry, "s1");
    entry.await_after = Some(AwaitConfig::Time {
        delay_ms: 100,
        timeout_action: TimeoutAction::Continue,
    });

    let service = NventService::builder()
        .manifests([entry])
        .handler("tm-s1", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let started_at = Utc::now();
    let run_id = service
        .orchestrator
        .start_flow("tm", Value::Null)
        .await
        .unwrap();

    wait_for!(
        "run completion",
        status_of(&service, "tm", run_id).await == Some(RunStatus::Completed)
    );

    let all = events_of(&service, run_id).await;
    let registered = position_of(&all, EventType::AwaitRegistered, Some("s1"));
    // The one-shot resolver and the timeout are armed for the same
    // instant; whichever fires first settles the await, and with
    // `continue` both paths finish the run.
    let settled = all
        .iter()
        .position(|e| {
            matches!(
                e.event_type,
                EventType::AwaitResolved | EventType::AwaitTimeout
            )
        })
        .expect("await never settled");
    assert!(registered < settled);
    assert!(all[settled].ts - started_at >= chrono::Duration::milliseconds(100));
}

#[tokio::test]
async fn parallel_fanout_runs_concurrently_and_joins() {
    let mut entry = manifest("fan", WorkerRole::Entry, "s1");
    entry.emits = vec!["go".to_string()];
    let mut s2 = manifest("fan", WorkerRole::Step, "s2");
    s2.subscribes = vec!["go".to_string()];
    let mut s3 = manifest("fan", WorkerRole::Step, "s3");
    s3.subscribes = vec!["go".to_string()];
    let mut s4 = manifest("fan", WorkerRole::Step, "s4");
    s4.subscribes = vec!["step:s2".to_string(), "step:s3".to_string()];

    let service = NventService::builder()
        .manifests([entry, s2, s3, s4])
        .handler("fan-s1", EmitHandler::new(&["go"]))
        .handler("fan-s2", EmitHandler::slow(&[], Duration::from_millis(120)))
        .handler("fan-s3", EmitHandler::slow(&[], Duration::from_millis(120)))
        .handler("fan-s4", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("fan", Value::Null)
        .await
        .unwrap();

    wait_for!(
        "run completion",
        status_of(&service, "fan", run_id).await == Some(RunStatus::Completed)
    );

    let all = events_of(&service, run_id).await;
    let s2_started = position_of(&all, EventType::StepStarted, Some("s2"));
    let s3_started = position_of(&all, EventType::StepStarted, Some("s3"));
    let s2_done = position_of(&all, EventType::StepCompleted, Some("s2"));
    let s3_done = position_of(&all, EventType::StepCompleted, Some("s3"));
    let s4_started = position_of(&all, EventType::StepStarted, Some("s4"));

    // Both fan-out branches started before either finished.
    assert!(s2_started < s2_done.min(s3_done));
    assert!(s3_started < s2_done.min(s3_done));
    // The join waits for both.
    assert!(s4_started > s2_done);
    assert!(s4_started > s3_done);

    let record = record_of(&service, "fan", run_id).await;
    assert_eq!(record.completed_steps, 4);
}

#[tokio::test]
async fn failed_step_fails_the_run_after_retries() {
    let mut entry = manifest("fl", WorkerRole::Entry, "s1");
    entry.emits = vec!["go".to_string()];
    let mut s2 = manifest("fl", WorkerRole::Step, "s2");
    s2.subscribes = vec!["go".to_string()];

    let service = NventService::builder()
        .manifests([entry, s2])
        .handler("fl-s1", EmitHandler::new(&["go"]))
        .handler("fl-s2", Arc::new(FailHandler))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("fl", Value::Null)
        .await
        .unwrap();

    wait_for!(
        "run failure",
        status_of(&service, "fl", run_id).await == Some(RunStatus::Failed)
    );

    let all = events_of(&service, run_id).await;
    let retries = all
        .iter()
        .filter(|e| e.event_type == EventType::StepRetry)
        .count();
    let failures = all
        .iter()
        .filter(|e| e.event_type == EventType::StepFailed)
        .count();
    // Default budget is three attempts: two retries, one final failure.
    assert_eq!(retries, 2);
    assert_eq!(failures, 1);
    let final_failure = all
        .iter()
        .find(|e| e.event_type == EventType::StepFailed)
        .unwrap();
    assert_eq!(final_failure.attempt, Some(3));
}

#[tokio::test]
async fn canceled_run_discards_remaining_work() {
    let mut entry = manifest("cx", WorkerRole::Entry, "s1");
    entry.emits = vec!["go".to_string()];
    let mut s2 = manifest("cx", WorkerRole::Step, "s2");
    s2.subscribes = vec!["go".to_string()];

    let service = NventService::builder()
        .manifests([entry, s2])
        .handler("cx-s1", EmitHandler::slow(&["go"], Duration::from_millis(100)))
        .handler("cx-s2", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("cx", Value::Null)
        .await
        .unwrap();

    wait_for!("run start", !events_of(&service, run_id).await.is_empty());
    service.orchestrator.cancel_flow("cx", run_id).await.unwrap();

    wait_for!(
        "cancellation",
        status_of(&service, "cx", run_id).await == Some(RunStatus::Canceled)
    );

    // Give in-flight work time to finish and be discarded.
    tokio::time::sleep(Duration::from_millis(250)).await;

    let all = events_of(&service, run_id).await;
    let cancels = all
        .iter()
        .filter(|e| e.event_type == EventType::FlowCancel)
        .count();
    assert_eq!(cancels, 1);
    // No terminal completion after the cancel.
    assert!(!all.iter().any(|e| e.event_type == EventType::FlowCompleted));

    let record = record_of(&service, "cx", run_id).await;
    assert_eq!(record.status, RunStatus::Canceled);
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn restart_reuses_the_original_input() {
    let entry = manifest("rs", WorkerRole::Entry, "s1");

    let service = NventService::builder()
        .manifests([entry])
        .handler("rs-s1", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("rs", json!({"seed": 42}))
        .await
        .unwrap();
    wait_for!(
        "first run",
        status_of(&service, "rs", run_id).await == Some(RunStatus::Completed)
    );

    let new_run_id = service
        .orchestrator
        .restart_flow("rs", run_id)
        .await
        .unwrap();
    assert_ne!(new_run_id, run_id);

    wait_for!(
        "restarted run",
        status_of(&service, "rs", new_run_id).await == Some(RunStatus::Completed)
    );

    let all = events_of(&service, new_run_id).await;
    assert_eq!(all[0].data["input"], json!({"seed": 42}));
}

#[tokio::test]
async fn startup_recovery_stalls_abandoned_runs() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let config = nvent_core::RuntimeConfig::default();

    // A run a previous process left behind: running, stale, no awaits.
    let mut stale = RunRecord::new(RunId::new(), "rec", 1);
    stale.last_activity_at = Utc::now() - chrono::Duration::hours(1);
    store
        .index_add(
            &config.flow_runs_index("rec"),
            &stale.run_id.to_string(),
            stale.started_at.timestamp_millis(),
            serde_json::to_value(&stale).unwrap(),
        )
        .await
        .unwrap();

    let service = NventService::builder()
        .config(config)
        .store(store)
        .manifests([manifest("rec", WorkerRole::Entry, "s1")])
        .handler("rec-s1", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let record = record_of(&service, "rec", stale.run_id).await;
    assert_eq!(record.status, RunStatus::Stalled);

    let all = events_of(&service, stale.run_id).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].event_type, EventType::FlowStalled);
    assert_eq!(all[0].data["reason"], "Server restart - flow state lost");
    assert_eq!(all[0].data["previousStatus"], "running");
}

#[tokio::test]
async fn trigger_fire_starts_subscribed_flows_with_payload() {
    let entry = manifest("trg", WorkerRole::Entry, "s1");

    let service = NventService::builder()
        .manifests([entry])
        .handler("trg-s1", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    service
        .register_trigger(RegisterTrigger::new("orders-created", TriggerKind::Event))
        .await
        .unwrap();
    service
        .triggers
        .subscribe_trigger("orders-created", "trg", SubscriptionMode::Auto)
        .await
        .unwrap();

    // Payload above the threshold gets offloaded and must come back
    // resolved as the run input.
    let blob = "x".repeat(64 * 1024);
    let payload = json!({ "blob": blob });
    service
        .triggers
        .emit_trigger("orders-created", payload.clone(), None)
        .await
        .unwrap();

    wait_for!(
        "triggered run",
        service.orchestrator.list_runs("trg", 0, 10).await.unwrap().1 > 0
    );

    let (runs, _) = service.orchestrator.list_runs("trg", 0, 10).await.unwrap();
    let run_id = runs[0].run_id;
    assert_eq!(runs[0].meta.trigger_name.as_deref(), Some("orders-created"));

    wait_for!(
        "triggered run completion",
        status_of(&service, "trg", run_id).await == Some(RunStatus::Completed)
    );

    let all = events_of(&service, run_id).await;
    assert_eq!(all[0].data["input"], payload);
}

#[tokio::test]
async fn event_await_resolves_on_matching_emit() {
    let mut entry = manifest("ev", WorkerRole::Entry, "s1");
    entry.await_after = Some(AwaitConfig::Event {
        name: "external-signal".to_string(),
        filter_key: None,
        timeout_ms: Some(5_000),
        timeout_action: TimeoutAction::Fail,
    });

    let service = NventService::builder()
        .manifests([entry])
        .handler("ev-s1", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("ev", Value::Null)
        .await
        .unwrap();

    wait_for!(
        "awaiting after completion",
        status_of(&service, "ev", run_id).await == Some(RunStatus::Awaiting)
    );

    // The signal arrives as an emit on the bus (any run may produce it).
    service.fabric.publish(
        FlowEvent::new(EventType::Emit, RunId::new(), "elsewhere").with_data(json!({
            "name": "external-signal",
            "data": { "ok": true },
        })),
    );

    wait_for!(
        "run completion",
        status_of(&service, "ev", run_id).await == Some(RunStatus::Completed)
    );

    let all = events_of(&service, run_id).await;
    let resolved = position_of(&all, EventType::AwaitResolved, Some("s1"));
    assert_eq!(all[resolved].data["trigger_data"], json!({"ok": true}));
}

#[tokio::test]
async fn coexisting_awaits_keep_the_run_awaiting_until_all_resolve() {
    let mut entry = manifest("multi", WorkerRole::Entry, "s1");
    entry.emits = vec!["go".to_string()];
    let mut s2 = manifest("multi", WorkerRole::Step, "s2");
    s2.subscribes = vec!["go".to_string()];
    s2.await_before = Some(AwaitConfig::Webhook {
        timeout_ms: Some(60_000),
        timeout_action: TimeoutAction::Fail,
        path: None,
    });
    let mut s3 = manifest("multi", WorkerRole::Step, "s3");
    s3.subscribes = vec!["go".to_string()];
    s3.await_before = Some(AwaitConfig::Webhook {
        timeout_ms: Some(60_000),
        timeout_action: TimeoutAction::Fail,
        path: None,
    });

    let service = NventService::builder()
        .manifests([entry, s2, s3])
        .handler("multi-s1", EmitHandler::new(&["go"]))
        .handler("multi-s2", EmitHandler::new(&[]))
        .handler("multi-s3", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    let run_id = service
        .orchestrator
        .start_flow("multi", Value::Null)
        .await
        .unwrap();

    wait_for!(
        "both awaits registered",
        record_of(&service, "multi", run_id).await.active_awaits().count() == 2
    );

    service
        .orchestrator
        .resolve_webhook("multi", run_id, "s2", json!({}))
        .await
        .unwrap();

    wait_for!(
        "s2 resolved",
        record_of(&service, "multi", run_id).await.active_awaits().count() == 1
    );
    // One await left: still awaiting.
    assert_eq!(
        status_of(&service, "multi", run_id).await,
        Some(RunStatus::Awaiting)
    );

    service
        .orchestrator
        .resolve_webhook("multi", run_id, "s3", json!({}))
        .await
        .unwrap();

    wait_for!(
        "run completion",
        status_of(&service, "multi", run_id).await == Some(RunStatus::Completed)
    );
}

#[tokio::test]
async fn flow_stats_track_run_lifecycle() {
    let entry = manifest("st", WorkerRole::Entry, "s1");

    let service = NventService::builder()
        .manifests([entry])
        .handler("st-s1", EmitHandler::new(&[]))
        .build()
        .await
        .unwrap();

    for _ in 0..3 {
        let run_id = service
            .orchestrator
            .start_flow("st", Value::Null)
            .await
            .unwrap();
        wait_for!(
            "completion",
            status_of(&service, "st", run_id).await == Some(RunStatus::Completed)
        );
    }

    let stats = service
        .store
        .index_get(&service.config.flow_stats_index(), "st")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.metadata["total_runs"], 3);
    assert_eq!(stats.metadata["completed"], 3);
    assert_eq!(stats.metadata["running"], 0);
}
