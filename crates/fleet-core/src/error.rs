use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    // Definition errors
    #[error("Sequence {sequence} has a dependency cycle through: {}", steps.join(", "))]
    CyclicDependency { sequence: String, steps: Vec<String> },

    #[error("Step {step} in sequence {sequence} depends on unknown step {dependency}")]
    UnknownDependency {
        sequence: String,
        step: String,
        dependency: String,
    },

    #[error("Sequence {sequence} declares step {step} more than once")]
    DuplicateStep { sequence: String, step: String },

    #[error("Sequence {sequence} has no version {version}")]
    VersionNotFound { sequence: String, version: u32 },

    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    // Step errors
    #[error("Step timeout after {timeout_ms}ms: {step}")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error("Approval rejected for step {step} in run {run_id}")]
    ApprovalRejected { run_id: String, step: String },

    // Handoff errors
    #[error("Handoff loop detected: {event_type} already fired in chain {chain_id}")]
    HandoffLoopDetected { chain_id: String, event_type: String },

    #[error("Handoff mapping failed: {0}")]
    HandoffMapping(String),

    #[error("Invalid condition '{expr}': {reason}")]
    Condition { expr: String, reason: String },

    // Dispatch errors
    #[error("Dispatch failed: {message}")]
    Dispatch { message: String, retryable: bool },

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} cannot {action} in its current state: {reason}")]
    InvalidRunState {
        run_id: String,
        action: String,
        reason: String,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Whether a dispatcher may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Dispatch { retryable: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
