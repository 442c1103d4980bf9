use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok().map(Self)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Awaiting,
    Completed,
    Failed,
    Canceled,
    Stalled,
}

impl RunStatus {
    /// Terminal states are absorbing; `stalled` only leaves via a new run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Awaiting => "awaiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Stalled => "stalled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-visible event types, serialized to their dotted names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "flow.start")]
    FlowStart,
    #[serde(rename = "flow.completed")]
    FlowCompleted,
    #[serde(rename = "flow.failed")]
    FlowFailed,
    #[serde(rename = "flow.cancel")]
    FlowCancel,
    #[serde(rename = "flow.stalled")]
    FlowStalled,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.retry")]
    StepRetry,
    #[serde(rename = "log")]
    Log,
    #[serde(rename = "emit")]
    Emit,
    #[serde(rename = "state")]
    State,
    #[serde(rename = "await.registered")]
    AwaitRegistered,
    #[serde(rename = "await.resolved")]
    AwaitResolved,
    #[serde(rename = "await.timeout")]
    AwaitTimeout,
    #[serde(rename = "trigger.registered")]
    TriggerRegistered,
    #[serde(rename = "trigger.updated")]
    TriggerUpdated,
    #[serde(rename = "trigger.fired")]
    TriggerFired,
    #[serde(rename = "subscription.added")]
    SubscriptionAdded,
    #[serde(rename = "subscription.removed")]
    SubscriptionRemoved,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FlowStart => "flow.start",
            Self::FlowCompleted => "flow.completed",
            Self::FlowFailed => "flow.failed",
            Self::FlowCancel => "flow.cancel",
            Self::FlowStalled => "flow.stalled",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepRetry => "step.retry",
            Self::Log => "log",
            Self::Emit => "emit",
            Self::State => "state",
            Self::AwaitRegistered => "await.registered",
            Self::AwaitResolved => "await.resolved",
            Self::AwaitTimeout => "await.timeout",
            Self::TriggerRegistered => "trigger.registered",
            Self::TriggerUpdated => "trigger.updated",
            Self::TriggerFired => "trigger.fired",
            Self::SubscriptionAdded => "subscription.added",
            Self::SubscriptionRemoved => "subscription.removed",
        }
    }

    /// Structural events drive run-index updates and step-ready evaluation.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Self::FlowStart | Self::Emit | Self::StepCompleted | Self::StepFailed
        )
    }

    /// Terminal flow events; at most one per run stream.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FlowCompleted | Self::FlowFailed | Self::FlowCancel | Self::FlowStalled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted event record. Streams are append-only; the store assigns
/// `id` (monotone per stream) and final `ts` on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    #[serde(default)]
    pub id: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl FlowEvent {
    pub fn new(event_type: EventType, run_id: RunId, flow_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            ts: Utc::now(),
            event_type,
            run_id: Some(run_id),
            flow_name: Some(flow_name.into()),
            step_name: None,
            step_id: None,
            attempt: None,
            data: serde_json::Value::Null,
        }
    }

    /// Event outside any run, e.g. trigger lifecycle.
    pub fn unscoped(event_type: EventType) -> Self {
        Self {
            id: 0,
            ts: Utc::now(),
            event_type,
            run_id: None,
            flow_name: None,
            step_name: None,
            step_id: None,
            attempt: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// The emitted token name for `emit` events, if present.
    pub fn emit_name(&self) -> Option<&str> {
        if self.event_type != EventType::Emit {
            return None;
        }
        self.data.get("name").and_then(|v| v.as_str())
    }
}

/// The four await kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitKind {
    Webhook,
    Event,
    Schedule,
    Time,
}

impl std::fmt::Display for AwaitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Webhook => "webhook",
            Self::Event => "event",
            Self::Schedule => "schedule",
            Self::Time => "time",
        };
        f.write_str(s)
    }
}

/// Whether an await blocks step dispatch or downstream dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitPosition {
    Before,
    After,
}

impl std::fmt::Display for AwaitPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Before => "before",
            Self::After => "after",
        })
    }
}

/// What happens when an await expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Fail,
    Continue,
    Retry,
}

/// Await declaration attached to a step manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AwaitConfig {
    Webhook {
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        timeout_action: TimeoutAction,
        /// Override for the generated webhook path.
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Event {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        timeout_action: TimeoutAction,
    },
    Schedule {
        cron: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        #[serde(default)]
        timeout_action: TimeoutAction,
    },
    Time {
        delay_ms: u64,
        #[serde(default)]
        timeout_action: TimeoutAction,
    },
}

impl AwaitConfig {
    pub fn kind(&self) -> AwaitKind {
        match self {
            Self::Webhook { .. } => AwaitKind::Webhook,
            Self::Event { .. } => AwaitKind::Event,
            Self::Schedule { .. } => AwaitKind::Schedule,
            Self::Time { .. } => AwaitKind::Time,
        }
    }

    pub fn timeout_action(&self) -> TimeoutAction {
        match self {
            Self::Webhook { timeout_action, .. }
            | Self::Event { timeout_action, .. }
            | Self::Schedule { timeout_action, .. }
            | Self::Time { timeout_action, .. } => *timeout_action,
        }
    }
}

/// Per-step await bookkeeping inside a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingStatus {
    Awaiting,
    Resolved,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwaitingStep {
    pub await_type: AwaitKind,
    pub position: AwaitPosition,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub status: AwaitingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub timeout_action: TimeoutAction,
}

/// How a run came to exist, plus per-run overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<TriggerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall_timeout_ms: Option<u64>,
}

/// The per-run index record, stored under `flows:<flowName>` keyed by run id.
///
/// Counter fields (`step_count`, `completed_steps`) are mutated through
/// the store's atomic increment; everything else goes through versioned
/// updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub flow_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub step_count: u32,
    pub completed_steps: u32,
    #[serde(default)]
    pub completed_step_names: BTreeSet<String>,
    #[serde(default)]
    pub emitted_events: BTreeSet<String>,
    #[serde(default)]
    pub awaiting_steps: BTreeMap<String, AwaitingStep>,
    #[serde(default)]
    pub meta: RunMeta,
}

impl RunRecord {
    pub fn new(run_id: RunId, flow_name: impl Into<String>, step_count: u32) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            flow_name: flow_name.into(),
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            last_activity_at: now,
            step_count,
            completed_steps: 0,
            completed_step_names: BTreeSet::new(),
            emitted_events: BTreeSet::new(),
            awaiting_steps: BTreeMap::new(),
            meta: RunMeta::default(),
        }
    }

    /// Steps still waiting on an external signal.
    pub fn active_awaits(&self) -> impl Iterator<Item = (&String, &AwaitingStep)> {
        self.awaiting_steps
            .iter()
            .filter(|(_, a)| a.status == AwaitingStatus::Awaiting)
    }

    pub fn has_active_awaits(&self) -> bool {
        self.active_awaits().next().is_some()
    }
}

/// Trigger kinds, per the external entry-point model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Event,
    Webhook,
    Schedule,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerScope {
    Flow,
    Run,
    Await,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Active,
    Inactive,
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSubscription {
    pub mode: SubscriptionMode,
    pub subscribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerStats {
    pub total_fires: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub active_subscribers: u64,
}

/// Cron schedule attached to a schedule-kind trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSchedule {
    pub cron: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// A named external entry point that may start flows when fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub scope: TriggerScope,
    pub status: TriggerStatus,
    #[serde(default)]
    pub subscriptions: BTreeMap<String, TriggerSubscription>,
    #[serde(default)]
    pub stats: TriggerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<TriggerSchedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Bumped on every upsert; backs optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

/// Role of a worker within its flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Entry,
    Step,
}

/// Static description of one worker function, as produced by user code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerManifest {
    /// Flows this worker participates in.
    pub flow_names: Vec<String>,
    pub role: WorkerRole,
    /// Step name within the flow.
    pub step: String,
    pub queue: String,
    pub worker_id: String,
    #[serde(default)]
    pub subscribes: Vec<String>,
    #[serde(default)]
    pub emits: Vec<String>,
    /// Trigger names this worker's flows auto-subscribe to.
    #[serde(default)]
    pub trigger_subscriptions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub await_before: Option<AwaitConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub await_after: Option<AwaitConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,
    /// Per-flow stall timeout override; the entry worker's value wins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall_timeout_ms: Option<u64>,
}

/// Payload carried by a broker job for one step dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepJobPayload {
    pub flow_id: RunId,
    pub flow_name: String,
    pub step: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl StepJobPayload {
    /// Deterministic job id; duplicate enqueues collapse to one execution.
    pub fn job_id(&self) -> String {
        format!("{}__{}", self.flow_id, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_use_dotted_wire_names() {
        let json = serde_json::to_string(&EventType::FlowStart).unwrap();
        assert_eq!(json, "\"flow.start\"");
        let json = serde_json::to_string(&EventType::AwaitRegistered).unwrap();
        assert_eq!(json, "\"await.registered\"");

        let back: EventType = serde_json::from_str("\"step.completed\"").unwrap();
        assert_eq!(back, EventType::StepCompleted);
    }

    #[test]
    fn run_record_tracks_active_awaits() {
        let mut record = RunRecord::new(RunId::new(), "orders", 3);
        assert!(!record.has_active_awaits());

        record.awaiting_steps.insert(
            "approve".to_string(),
            AwaitingStep {
                await_type: AwaitKind::Webhook,
                position: AwaitPosition::Before,
                registered_at: Utc::now(),
                timeout_at: None,
                status: AwaitingStatus::Awaiting,
                resolved_at: None,
                timeout_action: TimeoutAction::Fail,
            },
        );
        assert!(record.has_active_awaits());

        record.awaiting_steps.get_mut("approve").unwrap().status = AwaitingStatus::Resolved;
        assert!(!record.has_active_awaits());
    }

    #[test]
    fn step_job_id_is_deterministic() {
        let payload = StepJobPayload {
            flow_id: RunId::new(),
            flow_name: "orders".to_string(),
            step: "reserve".to_string(),
            input: serde_json::Value::Null,
        };
        assert_eq!(payload.job_id(), format!("{}__reserve", payload.flow_id));
    }
}
