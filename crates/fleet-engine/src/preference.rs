use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use fleet_core::error::{FleetError, Result};
use fleet_core::traits::CatalogStore;
use fleet_core::types::{Channel, OrgId, UserId};

use crate::registry::SequenceRegistry;

/// Which layer decided whether a sequence is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    User,
    Org,
    Platform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferenceDecision {
    pub enabled: bool,
    pub channel: Channel,
    pub source: DecisionSource,
}

/// Resolves user → org → platform enablement and delivery channel.
pub struct PreferenceGate {
    catalog: Arc<dyn CatalogStore>,
    registry: Arc<SequenceRegistry>,
    default_channel: Channel,
}

impl PreferenceGate {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        registry: Arc<SequenceRegistry>,
        default_channel: Channel,
    ) -> Self {
        Self {
            catalog,
            registry,
            default_channel,
        }
    }

    pub fn is_enabled(
        &self,
        user_id: Option<UserId>,
        org_id: OrgId,
        sequence_type: &str,
    ) -> Result<PreferenceDecision> {
        let user = match user_id {
            Some(uid) => self.catalog.user_preference(uid, org_id, sequence_type)?,
            None => None,
        };
        let org = self.catalog.org_settings(org_id)?;
        let definition = match self.registry.load(sequence_type, org_id, None) {
            Ok(seq) => Some(seq),
            Err(FleetError::SequenceNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let org_enabled = org
            .as_ref()
            .and_then(|o| o.enabled_sequences.get(sequence_type).copied());

        let (enabled, source) = if let Some(pref) = &user {
            (pref.is_enabled, DecisionSource::User)
        } else if let Some(enabled) = org_enabled {
            (enabled, DecisionSource::Org)
        } else {
            let enabled = definition
                .as_ref()
                .map(|s| s.definition.default_enabled)
                .unwrap_or(true);
            (enabled, DecisionSource::Platform)
        };

        let channel = user
            .as_ref()
            .and_then(|p| p.delivery_channel)
            .or_else(|| {
                org.as_ref()
                    .and_then(|o| o.sequence_channels.get(sequence_type).copied())
            })
            .or_else(|| definition.as_ref().and_then(|s| s.definition.default_channel))
            .or_else(|| org.as_ref().and_then(|o| o.default_channel))
            .unwrap_or(self.default_channel);

        debug!(
            org_id = %org_id,
            sequence = sequence_type,
            enabled,
            channel = %channel,
            source = ?source,
            "Preference resolved"
        );
        Ok(PreferenceDecision {
            enabled,
            channel,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::route::{OrgSettings, UserSequencePreference};
    use fleet_core::sequence::{SequenceDefinition, Step};
    use fleet_core::types::Scope;
    use fleet_store::SqliteStore;

    struct Fixture {
        store: Arc<SqliteStore>,
        gate: PreferenceGate,
        org: OrgId,
        user: UserId,
    }

    fn fixture(default_enabled: bool) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let registry = Arc::new(SequenceRegistry::new(store.clone()));
        let mut def = SequenceDefinition::new(
            "meeting_ended",
            Scope::Platform,
            vec![Step::new("summarize")],
        );
        def.default_enabled = default_enabled;
        registry.publish(def).unwrap();
        Fixture {
            gate: PreferenceGate::new(store.clone(), registry, Channel::Slack),
            store,
            org: OrgId::new(),
            user: UserId::new(),
        }
    }

    fn user_pref(f: &Fixture, enabled: bool, channel: Option<Channel>) {
        f.store
            .upsert_user_preference(&UserSequencePreference {
                user_id: f.user,
                org_id: f.org,
                sequence_type: "meeting_ended".into(),
                is_enabled: enabled,
                delivery_channel: channel,
            })
            .unwrap();
    }

    fn org_settings(f: &Fixture, enabled: Option<bool>, channel: Option<Channel>) {
        let mut settings = OrgSettings::new(f.org);
        if let Some(enabled) = enabled {
            settings.enabled_sequences.insert("meeting_ended".into(), enabled);
        }
        if let Some(channel) = channel {
            settings.sequence_channels.insert("meeting_ended".into(), channel);
        }
        f.store.upsert_org_settings(&settings).unwrap();
    }

    #[test]
    fn test_platform_default() {
        let f = fixture(false);
        let d = f.gate.is_enabled(Some(f.user), f.org, "meeting_ended").unwrap();
        assert!(!d.enabled);
        assert_eq!(d.source, DecisionSource::Platform);
        assert_eq!(d.channel, Channel::Slack);
    }

    #[test]
    fn test_unknown_sequence_defaults_enabled() {
        let f = fixture(false);
        let d = f.gate.is_enabled(None, f.org, "not_defined").unwrap();
        assert!(d.enabled);
    }

    #[test]
    fn test_org_overrides_platform() {
        let f = fixture(false);
        org_settings(&f, Some(true), Some(Channel::InApp));
        let d = f.gate.is_enabled(Some(f.user), f.org, "meeting_ended").unwrap();
        assert!(d.enabled);
        assert_eq!(d.source, DecisionSource::Org);
        assert_eq!(d.channel, Channel::InApp);
    }

    #[test]
    fn test_user_overrides_org_and_platform() {
        let f = fixture(true);
        org_settings(&f, Some(true), Some(Channel::InApp));
        user_pref(&f, false, Some(Channel::Email));
        let d = f.gate.is_enabled(Some(f.user), f.org, "meeting_ended").unwrap();
        assert!(!d.enabled);
        assert_eq!(d.source, DecisionSource::User);
        assert_eq!(d.channel, Channel::Email);

        // Without a user id the user layer is not consulted.
        let d = f.gate.is_enabled(None, f.org, "meeting_ended").unwrap();
        assert!(d.enabled);
        assert_eq!(d.source, DecisionSource::Org);
    }

    #[test]
    fn test_channel_falls_through_layers() {
        let f = fixture(true);
        user_pref(&f, true, None);
        let mut settings = OrgSettings::new(f.org);
        settings.default_channel = Some(Channel::Email);
        f.store.upsert_org_settings(&settings).unwrap();

        let d = f.gate.is_enabled(Some(f.user), f.org, "meeting_ended").unwrap();
        assert_eq!(d.source, DecisionSource::User);
        assert_eq!(d.channel, Channel::Email);
    }
}
