use crate::types::RunId;

/// Result type used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the flow runtime.
///
/// Step failures never surface here as orchestrator errors; they are
/// reified as `step.failed` events and only participate in completion
/// analysis. The variants below cover configuration, storage, and
/// await/trigger plumbing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed flow or trigger manifest. Fatal at load time.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure against the store. Retryable for idempotent operations.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Optimistic version mismatch that survived the retry budget.
    #[error("contended write on {key}/{id} after {attempts} attempts")]
    ContendedWrite {
        key: String,
        id: String,
        attempts: u32,
    },

    /// The backend does not implement this operation. Callers treat as soft-fail.
    #[error("not supported by this backend: {0}")]
    NotSupported(&'static str),

    /// An await registration expired before it was resolved.
    #[error("await timed out for step {step} of run {run_id}")]
    AwaitTimeout { run_id: RunId, step: String },

    /// A worker returned an error for a step. Recorded, never propagated
    /// past the step runner.
    #[error("step {step} failed: {message}")]
    StepFailure { step: String, message: String },

    /// The run was canceled while work was still in flight. Informational.
    #[error("run {0} was canceled")]
    FlowCanceled(RunId),

    #[error("unknown flow: {0}")]
    UnknownFlow(String),

    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    #[error("unknown trigger: {0}")]
    UnknownTrigger(String),

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a backend failure as a transient store error.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::TransientStore(err.to_string())
    }

    /// True for errors worth retrying against the store.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}
