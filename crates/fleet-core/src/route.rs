use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Channel, OrgId, Scope, UserId};

/// Maps an event type to a sequence within a tenant scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRoute {
    #[serde(default)]
    pub scope: Scope,
    pub event_type: String,
    pub sequence_key: String,
    #[serde(default)]
    pub priority: i32,
    /// Predicate over event payload fields, e.g. `source == "zoom"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl EventRoute {
    pub fn new(
        scope: Scope,
        event_type: impl Into<String>,
        sequence_key: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            scope,
            event_type: event_type.into(),
            sequence_key: sequence_key.into(),
            priority,
            conditions: None,
            is_active: true,
        }
    }

    pub fn when(mut self, conditions: impl Into<String>) -> Self {
        self.conditions = Some(conditions.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Turns a completed step's output into a new event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRoute {
    #[serde(default)]
    pub scope: Scope,
    pub source_sequence_key: String,
    pub source_step_skill: String,
    pub target_event_type: String,
    /// Target payload key → dotted source path. Empty copies the step output.
    #[serde(default)]
    pub context_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default)]
    pub delay_minutes: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl HandoffRoute {
    pub fn new(
        source_sequence_key: impl Into<String>,
        source_step_skill: impl Into<String>,
        target_event_type: impl Into<String>,
    ) -> Self {
        Self {
            scope: Scope::Platform,
            source_sequence_key: source_sequence_key.into(),
            source_step_skill: source_step_skill.into(),
            target_event_type: target_event_type.into(),
            context_mapping: BTreeMap::new(),
            conditions: None,
            delay_minutes: 0,
            is_active: true,
        }
    }

    pub fn when(mut self, conditions: impl Into<String>) -> Self {
        self.conditions = Some(conditions.into());
        self
    }

    pub fn map(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.context_mapping.insert(target.into(), source.into());
        self
    }

    pub fn delayed(mut self, minutes: u32) -> Self {
        self.delay_minutes = minutes;
        self
    }
}

fn default_active() -> bool {
    true
}

/// Per-user override of a sequence's enablement and delivery channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSequencePreference {
    pub user_id: UserId,
    pub org_id: OrgId,
    pub sequence_type: String,
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_channel: Option<Channel>,
}

/// Org-level defaults consulted by the preference gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgSettings {
    pub org_id: OrgId,
    #[serde(default)]
    pub enabled_sequences: BTreeMap<String, bool>,
    #[serde(default)]
    pub sequence_channels: BTreeMap<String, Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<Channel>,
}

impl OrgSettings {
    pub fn new(org_id: OrgId) -> Self {
        Self {
            org_id,
            enabled_sequences: BTreeMap::new(),
            sequence_channels: BTreeMap::new(),
            default_channel: None,
        }
    }
}
