use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use fleet_core::condition::Condition;
use fleet_core::error::Result;
use fleet_core::route::EventRoute;
use fleet_core::traits::CatalogStore;
use fleet_core::types::{Context, OrgId, Scope};

/// A sequence selected for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub sequence_key: String,
    pub priority: i32,
    pub scope: Scope,
}

/// Picks the sequences an event triggers for one org.
pub struct RouteResolver {
    catalog: Arc<dyn CatalogStore>,
}

impl RouteResolver {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    /// Matching routes by descending priority, org before platform, then key.
    /// No match is an empty vec.
    pub fn resolve(
        &self,
        event_type: &str,
        org_id: OrgId,
        payload: &Context,
    ) -> Result<Vec<RouteMatch>> {
        let routes = self.catalog.routes_for(event_type, org_id)?;
        let matches = select_routes(routes, org_id, payload);
        debug!(
            event_type,
            org_id = %org_id,
            matched = matches.len(),
            "Routes resolved"
        );
        Ok(matches)
    }
}

/// Apply shadowing, activity and conditions to the candidate routes.
///
/// Any org route, even an inactive one, hides the platform route with the
/// same `(event_type, sequence_key)`.
pub fn select_routes(routes: Vec<EventRoute>, org_id: OrgId, payload: &Context) -> Vec<RouteMatch> {
    let shadowed: HashSet<(String, String)> = routes
        .iter()
        .filter(|r| r.scope == Scope::Org(org_id))
        .map(|r| (r.event_type.clone(), r.sequence_key.clone()))
        .collect();

    let mut matches: Vec<RouteMatch> = routes
        .into_iter()
        .filter(|r| match r.scope {
            Scope::Org(id) => id == org_id,
            Scope::Platform => {
                !shadowed.contains(&(r.event_type.clone(), r.sequence_key.clone()))
            }
        })
        .filter(|r| r.is_active)
        .filter(|r| conditions_hold(r, payload))
        .map(|r| RouteMatch {
            sequence_key: r.sequence_key,
            priority: r.priority,
            scope: r.scope,
        })
        .collect();

    matches.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| match (a.scope.is_org(), b.scope.is_org()) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => Ordering::Equal,
            })
            .then_with(|| a.sequence_key.cmp(&b.sequence_key))
    });
    matches
}

fn conditions_hold(route: &EventRoute, payload: &Context) -> bool {
    let Some(expr) = route.conditions.as_deref() else {
        return true;
    };
    match Condition::parse(expr) {
        Ok(cond) => cond.evaluate(payload),
        Err(e) => {
            warn!(
                event_type = %route.event_type,
                sequence = %route.sequence_key,
                scope = %route.scope,
                error = %e,
                "Malformed route condition, treating route as non-matching"
            );
            false
        }
    }
}
