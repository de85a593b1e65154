use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use fleet_core::dag::StepGraph;
use fleet_core::error::{FleetError, Result};
use fleet_core::sequence::SequenceDefinition;
use fleet_core::traits::CatalogStore;
use fleet_core::types::{OrgId, Scope};

/// A definition together with its validated step graph.
#[derive(Debug)]
pub struct ValidatedSequence {
    pub definition: SequenceDefinition,
    pub graph: StepGraph,
}

impl ValidatedSequence {
    pub fn new(definition: SequenceDefinition) -> Result<Self> {
        let graph = StepGraph::build(&definition)?;
        Ok(Self { definition, graph })
    }

    pub fn key(&self) -> &str {
        &self.definition.sequence_key
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }
}

type CacheKey = (Scope, String, u32);

/// Versioned sequence lookup with a per-version graph cache.
pub struct SequenceRegistry {
    catalog: Arc<dyn CatalogStore>,
    cache: RwLock<HashMap<CacheKey, Arc<ValidatedSequence>>>,
}

impl SequenceRegistry {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            catalog,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a sequence for an org.
    ///
    /// With a pinned version the org scope is searched first, then the
    /// platform; a miss is `VersionNotFound`. Without one, the org's current
    /// version wins over the platform's. No definition at all is
    /// `SequenceNotFound`.
    pub fn load(
        &self,
        sequence_key: &str,
        org_id: OrgId,
        pinned_version: Option<u32>,
    ) -> Result<Arc<ValidatedSequence>> {
        for scope in Scope::lookup_order(org_id) {
            if let Some(version) = pinned_version {
                if let Some(hit) = self.cached(scope, sequence_key, version) {
                    return Ok(hit);
                }
            }
            if let Some(def) = self.catalog.definition(sequence_key, scope, pinned_version)? {
                return self.validated(def);
            }
        }

        match pinned_version {
            Some(version) => Err(FleetError::VersionNotFound {
                sequence: sequence_key.to_string(),
                version,
            }),
            None => Err(FleetError::SequenceNotFound(sequence_key.to_string())),
        }
    }

    /// Validate, persist as the next version and cache a definition.
    pub fn publish(&self, definition: SequenceDefinition) -> Result<Arc<ValidatedSequence>> {
        StepGraph::build(&definition)?;
        let stored = self.catalog.insert_definition(&definition)?;
        self.validated(stored)
    }

    /// Number of cached graphs.
    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, scope: Scope, key: &str, version: u32) -> Option<Arc<ValidatedSequence>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(&(scope, key.to_string(), version)).cloned()
    }

    fn validated(&self, def: SequenceDefinition) -> Result<Arc<ValidatedSequence>> {
        let key = (def.scope, def.sequence_key.clone(), def.version);
        if let Some(hit) = self.cached(key.0, &key.1, key.2) {
            return Ok(hit);
        }

        let seq = Arc::new(ValidatedSequence::new(def)?);
        debug!(
            sequence = %seq.key(),
            version = seq.version(),
            waves = seq.graph.waves().len(),
            "Sequence graph validated"
        );
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(key).or_insert(seq).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::sequence::Step;
    use fleet_store::SqliteStore;

    fn registry() -> (Arc<SqliteStore>, SequenceRegistry) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let registry = SequenceRegistry::new(store.clone());
        (store, registry)
    }

    fn def(scope: Scope, steps: Vec<Step>) -> SequenceDefinition {
        SequenceDefinition::new("meeting_ended", scope, steps)
    }

    #[test]
    fn test_org_version_shadows_platform() {
        let (_store, registry) = registry();
        let org = OrgId::new();
        registry
            .publish(def(Scope::Platform, vec![Step::new("summarize")]))
            .unwrap();
        registry
            .publish(def(
                Scope::Org(org),
                vec![Step::new("summarize"), Step::new("crm-write")],
            ))
            .unwrap();

        let seq = registry.load("meeting_ended", org, None).unwrap();
        assert_eq!(seq.definition.scope, Scope::Org(org));
        assert_eq!(seq.graph.len(), 2);

        let seq = registry.load("meeting_ended", OrgId::new(), None).unwrap();
        assert_eq!(seq.definition.scope, Scope::Platform);
    }

    #[test]
    fn test_current_version_and_pinning() {
        let (_store, registry) = registry();
        let org = OrgId::new();
        registry
            .publish(def(Scope::Platform, vec![Step::new("a")]))
            .unwrap();
        let v2 = registry
            .publish(def(Scope::Platform, vec![Step::new("a"), Step::new("b")]))
            .unwrap();
        assert_eq!(v2.version(), 2);

        assert_eq!(registry.load("meeting_ended", org, None).unwrap().version(), 2);
        let pinned = registry.load("meeting_ended", org, Some(1)).unwrap();
        assert_eq!(pinned.version(), 1);
        assert_eq!(pinned.graph.len(), 1);

        assert!(matches!(
            registry.load("meeting_ended", org, Some(7)),
            Err(FleetError::VersionNotFound { version: 7, .. })
        ));
        assert!(matches!(
            registry.load("unknown", org, None),
            Err(FleetError::SequenceNotFound(_))
        ));
    }

    #[test]
    fn test_graphs_are_cached_per_version() {
        let (_store, registry) = registry();
        let org = OrgId::new();
        registry
            .publish(def(Scope::Platform, vec![Step::new("a")]))
            .unwrap();
        let first = registry.load("meeting_ended", org, None).unwrap();
        let second = registry.load("meeting_ended", org, Some(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.cached_len(), 1);
    }

    #[test]
    fn test_publish_rejects_cycles() {
        let (store, registry) = registry();
        let err = registry
            .publish(def(
                Scope::Platform,
                vec![
                    Step::new("a").depends_on(["b"]),
                    Step::new("b").depends_on(["a"]),
                ],
            ))
            .unwrap_err();
        assert!(matches!(err, FleetError::CyclicDependency { .. }));
        assert!(store.list_definitions().unwrap().is_empty());
    }
}
