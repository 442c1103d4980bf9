use serde::{Deserialize, Serialize};

use crate::types::RunId;

/// Runtime configuration. The `prefix` is the single tenancy knob: it is
/// prepended to every stream, index, and KV name before the store sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Default stall timeout for flows that do not declare one, in ms.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Interval between stall-detector sweeps, in ms.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Broker retry budget per step job.
    #[serde(default = "default_job_attempts")]
    pub job_attempts: u32,

    /// Per-queue worker concurrency.
    #[serde(default = "default_concurrency")]
    pub queue_concurrency: usize,

    /// Trigger payloads above this many bytes are stored in KV and
    /// replaced by a reference in the event body.
    #[serde(default = "default_payload_threshold")]
    pub payload_threshold: usize,
}

fn default_prefix() -> String {
    "nvent".to_string()
}

fn default_stall_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_check_interval_ms() -> u64 {
    15 * 60 * 1000
}

fn default_job_attempts() -> u32 {
    3
}

fn default_concurrency() -> usize {
    4
}

fn default_payload_threshold() -> usize {
    10 * 1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            stall_timeout_ms: default_stall_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
            job_attempts: default_job_attempts(),
            queue_concurrency: default_concurrency(),
            payload_threshold: default_payload_threshold(),
        }
    }
}

impl RuntimeConfig {
    /// Prefixed name of the per-run event stream.
    pub fn run_stream(&self, run_id: RunId) -> String {
        format!("{}:flow:{}", self.prefix, run_id)
    }

    /// Prefixed name of the per-flow run index.
    pub fn flow_runs_index(&self, flow_name: &str) -> String {
        format!("{}:flows:{}", self.prefix, flow_name)
    }

    /// Prefixed name of the flow-stats index.
    pub fn flow_stats_index(&self) -> String {
        format!("{}:flows", self.prefix)
    }

    /// Prefixed name of the per-trigger event stream.
    pub fn trigger_stream(&self, trigger: &str) -> String {
        format!("{}:trigger:{}", self.prefix, trigger)
    }

    /// Prefixed name of the trigger index.
    pub fn triggers_index(&self) -> String {
        format!("{}:triggers", self.prefix)
    }

    /// Prefixed name of the scheduler lease index.
    pub fn scheduler_index(&self) -> String {
        format!("{}:scheduler:locks", self.prefix)
    }

    /// Prefixed KV key for an offloaded trigger payload.
    pub fn payload_key(&self, reference: &str) -> String {
        format!("{}:payload:{}", self.prefix, reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_the_prefix() {
        let config = RuntimeConfig {
            prefix: "tenant_a".to_string(),
            ..Default::default()
        };
        let run_id = RunId::new();
        assert_eq!(
            config.run_stream(run_id),
            format!("tenant_a:flow:{}", run_id)
        );
        assert_eq!(config.flow_runs_index("orders"), "tenant_a:flows:orders");
        assert_eq!(config.flow_stats_index(), "tenant_a:flows");
        assert_eq!(config.scheduler_index(), "tenant_a:scheduler:locks");
    }
}
