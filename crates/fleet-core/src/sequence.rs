use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Channel, Scope};

/// How a step failure affects the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Criticality {
    /// Failure aborts the whole run.
    Critical,
    /// Failure only skips the step's dependents.
    #[default]
    BestEffort,
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// One unit of work inside a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name used by `depends_on`. Defaults to the skill name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Opaque unit-of-work identifier.
    pub skill: String,
    /// Context tiers this step consumes.
    #[serde(default)]
    pub requires_context: Vec<String>,
    /// Gate execution on a human decision.
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub criticality: Criticality,
    /// Names of steps that must resolve before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Disabled steps are skipped without failing their dependents.
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_available() -> bool {
    true
}

impl Step {
    pub fn new(skill: impl Into<String>) -> Self {
        Self {
            name: None,
            skill: skill.into(),
            requires_context: vec![],
            requires_approval: false,
            criticality: Criticality::BestEffort,
            depends_on: vec![],
            available: true,
            timeout_ms: None,
        }
    }

    /// Step name used for dependencies and run records.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.skill)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn requires<I, S>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires_context = tiers.into_iter().map(Into::into).collect();
        self
    }

    pub fn critical(mut self) -> Self {
        self.criticality = Criticality::Critical;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// A versioned DAG of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub sequence_key: String,
    #[serde(default)]
    pub scope: Scope,
    /// Assigned on publish; 0 means "not yet versioned".
    #[serde(default)]
    pub version: u32,
    pub steps: Vec<Step>,
    /// Context tiers the whole sequence may need.
    #[serde(default)]
    pub context_requirements: Vec<String>,
    #[serde(default = "default_is_current")]
    pub is_current: bool,
    /// Platform default for the preference gate.
    #[serde(default = "default_enabled")]
    pub default_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_is_current() -> bool {
    true
}

fn default_enabled() -> bool {
    true
}

impl SequenceDefinition {
    pub fn new(sequence_key: impl Into<String>, scope: Scope, steps: Vec<Step>) -> Self {
        Self {
            sequence_key: sequence_key.into(),
            scope,
            version: 0,
            steps,
            context_requirements: vec![],
            is_current: true,
            default_enabled: true,
            default_channel: None,
            description: None,
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name() == name)
    }
}
