//! Catalog files.
//!
//! A catalog file is the TOML form of everything the orchestrator reads from
//! its catalog store: routes, sequence definitions, handoff routes, user
//! preferences and org settings. Rows are platform-wide unless they carry an
//! `org` id.
//!
//! ```toml
//! [[sequences]]
//! sequence_key = "meeting_ended"
//!
//! [[sequences.steps]]
//! skill = "summarize"
//!
//! [[routes]]
//! event_type = "meeting.ended"
//! sequence_key = "meeting_ended"
//! priority = 10
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::dag::StepGraph;
use crate::error::{FleetError, Result};
use crate::route::{EventRoute, HandoffRoute, OrgSettings, UserSequencePreference};
use crate::sequence::{SequenceDefinition, Step};
use crate::traits::CatalogStore;
use crate::types::{Channel, OrgId, Scope};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub sequences: Vec<SequenceEntry>,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub handoffs: Vec<HandoffEntry>,
    #[serde(default)]
    pub preferences: Vec<UserSequencePreference>,
    #[serde(default)]
    pub org_settings: Vec<OrgSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub sequence_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<OrgId>,
    /// Explicit version; omitted means "next after the latest stored".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub context_requirements: Vec<String>,
    #[serde(default = "default_true")]
    pub is_current: bool,
    #[serde(default = "default_true")]
    pub default_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub event_type: String,
    pub sequence_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<OrgId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffEntry {
    pub source_sequence_key: String,
    pub source_step_skill: String,
    pub target_event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<OrgId>,
    #[serde(default)]
    pub context_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default)]
    pub delay_minutes: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

fn scope_of(org: Option<OrgId>) -> Scope {
    org.map(Scope::Org).unwrap_or(Scope::Platform)
}

impl SequenceEntry {
    pub fn to_definition(&self) -> SequenceDefinition {
        let mut def =
            SequenceDefinition::new(&self.sequence_key, scope_of(self.org), self.steps.clone());
        def.version = self.version.unwrap_or(0);
        def.context_requirements = self.context_requirements.clone();
        def.is_current = self.is_current;
        def.default_enabled = self.default_enabled;
        def.default_channel = self.default_channel;
        def.description = self.description.clone();
        def
    }
}

impl RouteEntry {
    pub fn to_route(&self) -> EventRoute {
        let mut route = EventRoute::new(
            scope_of(self.org),
            &self.event_type,
            &self.sequence_key,
            self.priority,
        );
        route.conditions = self.conditions.clone();
        route.is_active = self.is_active;
        route
    }
}

impl HandoffEntry {
    pub fn to_route(&self) -> HandoffRoute {
        let mut route = HandoffRoute::new(
            &self.source_sequence_key,
            &self.source_step_skill,
            &self.target_event_type,
        )
        .delayed(self.delay_minutes);
        route.scope = scope_of(self.org);
        route.context_mapping = self.context_mapping.clone();
        route.conditions = self.conditions.clone();
        route.is_active = self.is_active;
        route
    }
}

/// Row counts written by [`CatalogFile::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// `(sequence_key, scope, assigned version)` per stored definition.
    pub sequences: Vec<(String, String, u32)>,
    pub routes: usize,
    pub handoffs: usize,
    pub preferences: usize,
    pub org_settings: usize,
}

impl CatalogFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FleetError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FleetError::Config(e.to_string()))
    }

    /// Check every definition is a DAG and every condition parses.
    ///
    /// Returns warnings for references that may still resolve against rows
    /// already in the store, such as a route to a sequence not in this file.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut known = HashSet::new();
        for entry in &self.sequences {
            if entry.steps.is_empty() {
                return Err(FleetError::Config(format!(
                    "sequence {} has no steps",
                    entry.sequence_key
                )));
            }
            StepGraph::build(&entry.to_definition())?;
            known.insert(entry.sequence_key.as_str());
        }

        let mut warnings = Vec::new();
        for route in &self.routes {
            if let Some(expr) = &route.conditions {
                Condition::parse(expr)?;
            }
            if !known.contains(route.sequence_key.as_str()) {
                warnings.push(format!(
                    "route {} -> {} names a sequence not defined in this file",
                    route.event_type, route.sequence_key
                ));
            }
        }

        for handoff in &self.handoffs {
            if let Some(expr) = &handoff.conditions {
                Condition::parse(expr)?;
            }
            if let Some(entry) = self
                .sequences
                .iter()
                .find(|s| s.sequence_key == handoff.source_sequence_key)
            {
                if !entry.steps.iter().any(|s| s.skill == handoff.source_step_skill) {
                    warnings.push(format!(
                        "handoff from {} names skill {} which no step of that sequence runs",
                        handoff.source_sequence_key, handoff.source_step_skill
                    ));
                }
            }
        }

        Ok(warnings)
    }

    /// Write every row into a catalog store. Definitions go first so routes
    /// never point at a sequence that failed to store.
    pub fn apply(&self, store: &dyn CatalogStore) -> Result<ImportSummary> {
        self.validate()?;
        let mut summary = ImportSummary::default();

        for entry in &self.sequences {
            let stored = store.insert_definition(&entry.to_definition())?;
            summary.sequences.push((
                stored.sequence_key.clone(),
                stored.scope.to_string(),
                stored.version,
            ));
        }
        for route in &self.routes {
            store.upsert_route(&route.to_route())?;
            summary.routes += 1;
        }
        for handoff in &self.handoffs {
            store.upsert_handoff_route(&handoff.to_route())?;
            summary.handoffs += 1;
        }
        for pref in &self.preferences {
            store.upsert_user_preference(pref)?;
            summary.preferences += 1;
        }
        for settings in &self.org_settings {
            store.upsert_org_settings(settings)?;
            summary.org_settings += 1;
        }

        Ok(summary)
    }
}
