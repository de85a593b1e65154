use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::route::{EventRoute, HandoffRoute, OrgSettings, UserSequencePreference};
use crate::run::{ApprovalRequest, RunStatus, SequenceRun};
use crate::sequence::SequenceDefinition;
use crate::types::{Channel, Context, OrgId, RunId, Scope, UserId};

/// A single step invocation handed to a skill.
#[derive(Debug, Clone)]
pub struct SkillCall {
    pub run_id: RunId,
    pub sequence_key: String,
    pub step: String,
    pub skill: String,
    pub org_id: OrgId,
    pub user_id: Option<UserId>,
    /// Accumulated run context at the start of the step's wave.
    pub input: Context,
    pub timeout: Duration,
    pub attempt: u32,
}

/// Skill execution boundary. Returns the step's output context.
pub trait SkillExecutor: Send + Sync + 'static {
    fn execute(&self, call: SkillCall) -> BoxFuture<'_, Result<Context>>;
}

/// Model picked by the external model-selection circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChoice {
    pub model_id: String,
    pub is_fallback: bool,
}

/// Externally-owned model selection. Fleet passes it through to skills.
pub trait ModelSelector: Send + Sync + 'static {
    fn select_model(&self, feature: &str, tier: &str) -> BoxFuture<'_, Result<ModelChoice>>;
}

/// Read-only user → org → platform configuration lookup.
pub trait ConfigResolver: Send + Sync + 'static {
    fn resolve_config(
        &self,
        org_id: OrgId,
        user_id: Option<UserId>,
        agent_type: &str,
        key: &str,
    ) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;
}

/// Delivery channel for approval requests.
pub trait NotificationSink: Send + Sync + 'static {
    fn request_approval(
        &self,
        request: &ApprovalRequest,
        channel: Channel,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Routes, definitions, handoff rules and preferences.
pub trait CatalogStore: Send + Sync + 'static {
    /// Platform routes plus the given org's routes for an event type, active or not.
    fn routes_for(&self, event_type: &str, org_id: OrgId) -> Result<Vec<EventRoute>>;

    fn upsert_route(&self, route: &EventRoute) -> Result<()>;

    /// Exact version, or the highest current version when `version` is None.
    fn definition(
        &self,
        sequence_key: &str,
        scope: Scope,
        version: Option<u32>,
    ) -> Result<Option<SequenceDefinition>>;

    /// Validate and persist a new version; returns the stored definition.
    fn insert_definition(&self, definition: &SequenceDefinition) -> Result<SequenceDefinition>;

    fn list_definitions(&self) -> Result<Vec<SequenceDefinition>>;

    /// Platform plus the given org's handoff routes leaving a step.
    fn handoff_routes_for(
        &self,
        source_sequence_key: &str,
        source_step_skill: &str,
        org_id: OrgId,
    ) -> Result<Vec<HandoffRoute>>;

    fn upsert_handoff_route(&self, route: &HandoffRoute) -> Result<()>;

    fn user_preference(
        &self,
        user_id: UserId,
        org_id: OrgId,
        sequence_type: &str,
    ) -> Result<Option<UserSequencePreference>>;

    fn upsert_user_preference(&self, pref: &UserSequencePreference) -> Result<()>;

    fn org_settings(&self, org_id: OrgId) -> Result<Option<OrgSettings>>;

    fn upsert_org_settings(&self, settings: &OrgSettings) -> Result<()>;
}

/// Durable run records, used for approval suspension and inspection.
pub trait RunStore: Send + Sync + 'static {
    fn save_run(&self, run: &SequenceRun) -> Result<()>;

    fn load_run(&self, run_id: &RunId) -> Result<Option<SequenceRun>>;

    /// Most recently updated first.
    fn list_runs(&self, status: Option<RunStatus>, limit: usize) -> Result<Vec<SequenceRun>>;
}

/// Key-scoped at-most-once-per-window gate.
pub trait DebounceStore: Send + Sync + 'static {
    /// Atomically: fire (record `now`, return true) when the key never fired or
    /// its last fire is more than `window` before `now`; otherwise return false
    /// and leave the record untouched.
    fn should_fire_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<bool>;

    fn should_fire(&self, key: &str, window: Duration) -> Result<bool> {
        self.should_fire_at(key, window, Utc::now())
    }

    /// Drop records last fired before `cutoff`. Returns the number removed.
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Whether a record fired at `last` still suppresses a fire at `now`.
pub fn within_window(last: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => now - last <= window,
        Err(_) => true,
    }
}
