use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sequence::{Criticality, SequenceDefinition};
use crate::types::{Channel, Context, Event, OrgId, RunId, UserId};

/// Execution state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting_approval",
        };
        write!(f, "{}", s)
    }
}

/// Why a step ended up skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A required context tier was absent.
    MissingContext,
    /// The step is disabled in the definition.
    Unavailable,
    /// A dependency failed or was itself skipped by propagation.
    UpstreamFailed,
    /// A human rejected the step (or one of its dependencies).
    Rejected,
    /// A critical step failed and the run was aborted.
    Aborted,
    /// The run was cancelled.
    Cancelled,
}

impl SkipReason {
    /// Dependents of a step skipped for this reason may still run.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::MissingContext | Self::Unavailable)
    }
}

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingApproval,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Execution,
    Dispatch,
    /// A human rejected a critical step.
    Rejected,
}

/// Structured reason a run was aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub step: String,
    pub skill: String,
    pub criticality: Criticality,
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} step '{}' ({}) failed: {:?}: {}",
            self.criticality, self.step, self.skill, self.kind, self.message
        )
    }
}

/// Per-step record inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub skill: String,
    pub wave: usize,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A pending human decision on an approval-gated step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: RunId,
    pub step: String,
    pub skill: String,
    pub sequence_key: String,
    pub org_id: OrgId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Run context at the time of the request, shown to the approver.
    pub preview: Context,
    pub requested_at: DateTime<Utc>,
}

/// A handoff event queued for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub event: Event,
    pub fire_at: DateTime<Utc>,
    pub source_step: String,
}

/// One triggered execution of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRun {
    pub run_id: RunId,
    /// The event that triggered this run.
    pub event: Event,
    pub sequence_key: String,
    pub version: u32,
    /// Delivery channel resolved by the preference gate.
    #[serde(default)]
    pub channel: Channel,
    /// Accumulated run context: initial payload plus merged step outputs.
    pub context: Context,
    /// Output of each succeeded step, keyed by step name.
    #[serde(default)]
    pub outputs: BTreeMap<String, Context>,
    /// Step records in definition order.
    pub steps: Vec<StepRecord>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Steps a human approved but that have not run yet.
    #[serde(default)]
    pub approvals: BTreeSet<String>,
    /// Steps whose handoff routes were already evaluated.
    #[serde(default)]
    pub handoffs_processed: BTreeSet<String>,
    #[serde(default)]
    pub handoffs: Vec<ScheduledEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SequenceRun {
    /// Create a pending run for a definition. `waves` gives each step's wave
    /// index, in definition order.
    pub fn new(definition: &SequenceDefinition, event: Event, waves: &[usize]) -> Self {
        let now = Utc::now();
        let steps = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepRecord {
                name: s.name().to_string(),
                skill: s.skill.clone(),
                wave: waves.get(i).copied().unwrap_or(0),
                status: StepStatus::Pending,
                skip_reason: None,
                error: None,
                attempts: 0,
                started_at: None,
                finished_at: None,
            })
            .collect();

        Self {
            run_id: RunId::new(),
            context: event.payload.clone(),
            event,
            sequence_key: definition.sequence_key.clone(),
            version: definition.version,
            channel: Channel::default(),
            outputs: BTreeMap::new(),
            steps,
            status: RunStatus::Pending,
            failure: None,
            approvals: BTreeSet::new(),
            handoffs_processed: BTreeSet::new(),
            handoffs: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.step(name).map(|s| s.status)
    }

    /// Steps currently parked on a human decision.
    pub fn awaiting_approval(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::AwaitingApproval)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Chain id used for handoff loop prevention.
    pub fn chain_id(&self) -> String {
        self.event
            .causation
            .as_ref()
            .map(|c| c.chain_id.clone())
            .unwrap_or_else(|| self.run_id.0.clone())
    }

    pub fn chain_depth(&self) -> u32 {
        self.event.causation.as_ref().map(|c| c.depth).unwrap_or(0)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
