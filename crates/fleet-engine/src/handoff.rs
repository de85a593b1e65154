use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use fleet_core::condition;
use fleet_core::error::{FleetError, Result};
use fleet_core::event::{EventBus, FleetEvent};
use fleet_core::route::HandoffRoute;
use fleet_core::run::{ScheduledEvent, SequenceRun, StepStatus};
use fleet_core::traits::{CatalogStore, DebounceStore};
use fleet_core::types::{Causation, Context, Event, Scope};

/// Turns completed steps into follow-up events.
pub struct HandoffEngine {
    catalog: Arc<dyn CatalogStore>,
    debounce: Arc<dyn DebounceStore>,
    event_bus: Arc<EventBus>,
    cooldown: Duration,
    max_depth: u32,
}

impl HandoffEngine {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        debounce: Arc<dyn DebounceStore>,
        event_bus: Arc<EventBus>,
        cooldown: Duration,
        max_depth: u32,
    ) -> Self {
        Self {
            catalog,
            debounce,
            event_bus,
            cooldown,
            max_depth,
        }
    }

    /// Evaluate the handoff routes leaving a succeeded step. Every failure is
    /// logged and drops only the affected route; the run is never touched.
    pub fn on_step_completed(&self, run: &SequenceRun, step_name: &str) -> Vec<ScheduledEvent> {
        let Some(record) = run.step(step_name) else {
            warn!(run_id = %run.run_id, step = step_name, "Handoff for unknown step");
            return Vec::new();
        };
        if record.status != StepStatus::Succeeded {
            return Vec::new();
        }

        let org_id = run.event.org_id;
        let routes = match self
            .catalog
            .handoff_routes_for(&run.sequence_key, &record.skill, org_id)
        {
            Ok(routes) => effective_routes(routes, Scope::Org(org_id)),
            Err(e) => {
                warn!(run_id = %run.run_id, step = step_name, error = %e, "Failed to load handoff routes");
                return Vec::new();
            }
        };
        if routes.is_empty() {
            return Vec::new();
        }

        let output = run.outputs.get(step_name).cloned().unwrap_or_default();
        let mut view = run.context.clone();
        view.merge(&output);

        let mut scheduled = Vec::new();
        for route in routes {
            match self.schedule(run, step_name, &route, &output, &view) {
                Ok(Some(event)) => scheduled.push(event),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        run_id = %run.run_id,
                        step = step_name,
                        target_event_type = %route.target_event_type,
                        error = %e,
                        "Handoff not scheduled"
                    );
                    if let FleetError::HandoffLoopDetected { .. } = e {
                        self.event_bus.publish(FleetEvent::EventSuppressed {
                            event_id: run.event.id.clone(),
                            event_type: route.target_event_type.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        scheduled
    }

    fn schedule(
        &self,
        run: &SequenceRun,
        step_name: &str,
        route: &HandoffRoute,
        output: &Context,
        view: &Context,
    ) -> Result<Option<ScheduledEvent>> {
        if !condition::evaluate(route.conditions.as_deref(), view)? {
            debug!(
                run_id = %run.run_id,
                step = step_name,
                target_event_type = %route.target_event_type,
                "Handoff condition not met"
            );
            return Ok(None);
        }

        let payload = build_payload(route, output, view)?;

        let chain_id = run.chain_id();
        let depth = run.chain_depth() + 1;
        if depth > self.max_depth {
            return Err(FleetError::HandoffLoopDetected {
                chain_id,
                event_type: route.target_event_type.clone(),
            });
        }

        let key = format!(
            "handoff:{}:{}:{}",
            run.event.org_id, chain_id, route.target_event_type
        );
        let fire = self.debounce.should_fire(&key, self.cooldown).unwrap_or_else(|e| {
            // Fail closed: an unbounded handoff cycle is worse than a missed one.
            warn!(key = %key, error = %e, "Debounce store unavailable for handoff");
            false
        });
        if !fire {
            return Err(FleetError::HandoffLoopDetected {
                chain_id,
                event_type: route.target_event_type.clone(),
            });
        }

        let mut event = Event::new(route.target_event_type.clone(), run.event.org_id, payload)
            .with_causation(Causation {
                chain_id,
                depth,
                parent_run_id: run.run_id.clone(),
                parent_sequence_key: run.sequence_key.clone(),
            });
        event.user_id = run.event.user_id;

        let fire_at = Utc::now() + chrono::Duration::minutes(i64::from(route.delay_minutes));
        info!(
            run_id = %run.run_id,
            step = step_name,
            target_event_type = %route.target_event_type,
            delay_minutes = route.delay_minutes,
            depth,
            "Handoff scheduled"
        );
        self.event_bus.publish(FleetEvent::HandoffScheduled {
            run_id: run.run_id.clone(),
            target_event_type: route.target_event_type.clone(),
            fire_at,
        });
        Ok(Some(ScheduledEvent {
            event,
            fire_at,
            source_step: step_name.to_string(),
        }))
    }
}

/// Active routes after an org route hides the platform route to the same target.
fn effective_routes(routes: Vec<HandoffRoute>, org_scope: Scope) -> Vec<HandoffRoute> {
    let shadowed: HashSet<String> = routes
        .iter()
        .filter(|r| r.scope == org_scope)
        .map(|r| r.target_event_type.clone())
        .collect();
    routes
        .into_iter()
        .filter(|r| r.scope == org_scope || !shadowed.contains(&r.target_event_type))
        .filter(|r| r.is_active)
        .collect()
}

/// Project a step's output into the payload of the target event.
///
/// Each mapping entry is `target_key = "dotted.source.path"`, looked up in
/// the step output overlaid on the run context. An empty mapping forwards
/// the step output unchanged.
pub fn build_payload(route: &HandoffRoute, output: &Context, view: &Context) -> Result<Context> {
    if route.context_mapping.is_empty() {
        return Ok(output.clone());
    }
    let mut payload = Context::new();
    for (target, source) in &route.context_mapping {
        let value = view.lookup(source).ok_or_else(|| {
            FleetError::HandoffMapping(format!(
                "'{}' needs '{}', which is not in the step output or run context",
                target, source
            ))
        })?;
        payload.set(target.clone(), value.clone());
    }
    Ok(payload)
}
