//! The event pipeline.
//!
//! `Fleet` owns every engine component and wires them in order: event-level
//! debounce, route resolution, preference gate, registry lookup, run-level
//! debounce, then wave execution. The executor evaluates handoffs as each
//! step succeeds; the resulting events go through a queue drained by
//! [`Fleet::spawn_handoff_worker`] and re-enter [`Fleet::handle_event`] when
//! they come due.
//!
//! Everything that drives a run (start, approve, reject, recovery) holds that
//! run's lock, so a stored run is never driven twice at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_core::config::EngineConfig;
use fleet_core::error::{FleetError, Result};
use fleet_core::event::{EventBus, FleetEvent};
use fleet_core::run::{ApprovalRequest, RunStatus, ScheduledEvent, SequenceRun, StepStatus};
use fleet_core::traits::{CatalogStore, DebounceStore, NotificationSink, RunStore, SkillExecutor};
use fleet_core::types::{Event, EventId, RunId};

use crate::approval::ApprovalBroker;
use crate::completion::{CompletionBroker, StepCompletion};
use crate::executor::{ExecutorConfig, SequenceExecutor};
use crate::handoff::HandoffEngine;
use crate::preference::PreferenceGate;
use crate::registry::{SequenceRegistry, ValidatedSequence};
use crate::routing::{RouteMatch, RouteResolver};

/// Upper bound on runs reloaded by [`Fleet::recover`].
const RECOVERY_BATCH: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    /// Suppressed by the event-level debounce window.
    Debounced,
    /// No active route matched.
    NoRoute,
    /// Routes matched; `runs` holds the runs that started.
    Processed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub event_id: EventId,
    pub disposition: EventDisposition,
    pub runs: Vec<SequenceRun>,
}

impl EventOutcome {
    fn new(event_id: EventId, disposition: EventDisposition) -> Self {
        Self {
            event_id,
            disposition,
            runs: Vec::new(),
        }
    }
}

/// Assembles a [`Fleet`] from its stores and skill executor.
pub struct FleetBuilder {
    config: EngineConfig,
    catalog: Arc<dyn CatalogStore>,
    runs: Arc<dyn RunStore>,
    debounce: Arc<dyn DebounceStore>,
    skills: Arc<dyn SkillExecutor>,
    notifier: Option<Arc<dyn NotificationSink>>,
    event_bus: Option<Arc<EventBus>>,
    completions: Option<Arc<CompletionBroker>>,
}

impl FleetBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Share the broker the remote skill executor registers with, so
    /// [`Fleet::complete_step`] reaches it.
    pub fn completions(mut self, completions: Arc<CompletionBroker>) -> Self {
        self.completions = Some(completions);
        self
    }

    pub fn build(self) -> Fleet {
        let event_bus = self.event_bus.unwrap_or_default();
        let approvals = Arc::new(match self.notifier {
            Some(notifier) => ApprovalBroker::with_notifier(event_bus.clone(), notifier),
            None => ApprovalBroker::new(event_bus.clone()),
        });
        let registry = Arc::new(SequenceRegistry::new(self.catalog.clone()));
        let handoffs = HandoffEngine::new(
            self.catalog.clone(),
            self.debounce.clone(),
            event_bus.clone(),
            self.config.handoff_cooldown(),
            self.config.max_handoff_depth,
        );
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let executor = SequenceExecutor::new(
            self.skills,
            self.runs.clone(),
            approvals.clone(),
            event_bus.clone(),
            ExecutorConfig::from(&self.config),
        )
        .with_handoffs(handoffs, handoff_tx);

        Fleet {
            resolver: RouteResolver::new(self.catalog.clone()),
            gate: PreferenceGate::new(
                self.catalog.clone(),
                registry.clone(),
                self.config.default_channel,
            ),
            registry,
            executor,
            approvals,
            completions: self.completions.unwrap_or_default(),
            catalog: self.catalog,
            runs: self.runs,
            debounce: self.debounce,
            event_bus,
            config: self.config,
            active: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            handoff_rx: Mutex::new(Some(handoff_rx)),
        }
    }
}

/// Multi-tenant event-driven sequence orchestrator.
pub struct Fleet {
    config: EngineConfig,
    catalog: Arc<dyn CatalogStore>,
    runs: Arc<dyn RunStore>,
    debounce: Arc<dyn DebounceStore>,
    registry: Arc<SequenceRegistry>,
    resolver: RouteResolver,
    gate: PreferenceGate,
    executor: SequenceExecutor,
    approvals: Arc<ApprovalBroker>,
    completions: Arc<CompletionBroker>,
    event_bus: Arc<EventBus>,
    /// Cancellation tokens of runs currently being driven.
    active: Mutex<HashMap<RunId, CancellationToken>>,
    /// Held by whatever is driving or deciding on a run.
    run_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
    handoff_rx: Mutex<Option<mpsc::UnboundedReceiver<ScheduledEvent>>>,
}

impl Fleet {
    pub fn builder(
        config: EngineConfig,
        catalog: Arc<dyn CatalogStore>,
        runs: Arc<dyn RunStore>,
        debounce: Arc<dyn DebounceStore>,
        skills: Arc<dyn SkillExecutor>,
    ) -> FleetBuilder {
        FleetBuilder {
            config,
            catalog,
            runs,
            debounce,
            skills,
            notifier: None,
            event_bus: None,
            completions: None,
        }
    }

    pub fn registry(&self) -> &Arc<SequenceRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FleetEvent> {
        self.event_bus.subscribe()
    }

    /// Handle an event on a background task and return its id immediately.
    pub fn submit_event(self: &Arc<Self>, event: Event) -> EventId {
        let event_id = event.id.clone();
        let fleet = self.clone();
        tokio::spawn(async move {
            let event_type = event.event_type.clone();
            if let Err(e) = fleet.handle_event(event).await {
                error!(event_type = %event_type, error = %e, "Event handling failed");
            }
        });
        event_id
    }

    /// Run an event through the whole pipeline and wait for its runs to settle.
    pub async fn handle_event(&self, event: Event) -> Result<EventOutcome> {
        let event_id = event.id.clone();
        info!(
            event_id = %event_id,
            event_type = %event.event_type,
            org_id = %event.org_id,
            "Handling event"
        );

        // Handoff events were already gated by the chain cooldown.
        if event.causation.is_none() {
            let key = event_debounce_key(&event);
            if !self.check_debounce(&key, &event) {
                return Ok(EventOutcome::new(event_id, EventDisposition::Debounced));
            }
        }

        let matches = self
            .resolver
            .resolve(&event.event_type, event.org_id, &event.payload)?;
        if matches.is_empty() {
            debug!(event_id = %event_id, event_type = %event.event_type, "No route matched");
            return Ok(EventOutcome::new(event_id, EventDisposition::NoRoute));
        }

        let mut outcome = EventOutcome::new(event_id, EventDisposition::Processed);
        for route in &matches {
            match self.start_run(&event, route).await {
                Ok(Some(run)) => outcome.runs.push(run),
                Ok(None) => {}
                Err(e) => warn!(
                    event_id = %event.id,
                    sequence = %route.sequence_key,
                    error = %e,
                    "Matched sequence not started"
                ),
            }
        }
        Ok(outcome)
    }

    async fn start_run(&self, event: &Event, route: &RouteMatch) -> Result<Option<SequenceRun>> {
        let org_id = event.org_id;
        let decision = self
            .gate
            .is_enabled(event.user_id, org_id, &route.sequence_key)?;
        if !decision.enabled {
            info!(
                org_id = %org_id,
                sequence = %route.sequence_key,
                source = ?decision.source,
                "Sequence disabled by preference"
            );
            return Ok(None);
        }

        let seq = self
            .registry
            .load(&route.sequence_key, org_id, event.pinned_version)?;

        if let Some(entity_id) = event.entity_id() {
            let key = format!("run:{}:{}:{}", org_id, route.sequence_key, entity_id);
            if !self.check_debounce(&key, event) {
                return Ok(None);
            }
        }

        let mut run = SequenceRun::new(&seq.definition, event.clone(), seq.graph.wave_indices());
        run.channel = decision.channel;

        // Decisions on this run wait until the first drive settles.
        let lock = self.run_lock(&run.run_id);
        let _guard = lock.lock().await;

        let token = self.track(&run.run_id);
        if let Err(e) = self.runs.save_run(&run) {
            self.untrack(&run.run_id);
            self.release_lock(&run);
            return Err(e);
        }

        let run = self.executor.execute(&seq, run, &token).await;
        self.untrack(&run.run_id);
        self.release_lock(&run);
        Ok(Some(run))
    }

    /// Debounce gate. Store failures let the event through.
    fn check_debounce(&self, key: &str, event: &Event) -> bool {
        match self.debounce.should_fire(key, self.config.debounce_window()) {
            Ok(true) => true,
            Ok(false) => {
                info!(event_id = %event.id, key = %key, "Event debounced");
                self.event_bus.publish(FleetEvent::EventSuppressed {
                    event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    reason: format!("debounced under {}", key),
                });
                false
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Debounce store unavailable, letting event through");
                true
            }
        }
    }

    /// Fetch a run.
    pub fn run(&self, run_id: &RunId) -> Result<SequenceRun> {
        self.runs
            .load_run(run_id)?
            .ok_or_else(|| FleetError::RunNotFound(run_id.to_string()))
    }

    pub fn list_runs(&self, status: Option<RunStatus>, limit: usize) -> Result<Vec<SequenceRun>> {
        self.runs.list_runs(status, limit)
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.pending_requests().await
    }

    /// Approve a parked step and continue the run.
    pub async fn approve(&self, run_id: &RunId, step: &str) -> Result<SequenceRun> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.run(run_id)?;
        SequenceExecutor::approve(&mut run, step)?;
        let seq = self.sequence_for(&run)?;
        self.approvals.resolve(run_id, step, true).await;
        info!(run_id = %run_id, step, "Step approved");
        self.runs.save_run(&run)?;

        let run = self.resume(&seq, run).await;
        self.release_lock(&run);
        Ok(run)
    }

    /// Reject a parked step. Its dependents are skipped; a critical step
    /// fails the run.
    pub async fn reject(&self, run_id: &RunId, step: &str) -> Result<SequenceRun> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.run(run_id)?;
        let seq = self.sequence_for(&run)?;
        SequenceExecutor::reject(&mut run, &seq, step)?;
        self.approvals.resolve(run_id, step, false).await;
        info!(run_id = %run_id, step, status = %run.status, "Step rejected");

        let run = if run.status.is_terminal() {
            self.settle(&run).await?;
            run
        } else {
            self.runs.save_run(&run)?;
            self.resume(&seq, run).await
        };
        self.release_lock(&run);
        Ok(run)
    }

    /// Cancel a run. A run in flight stops once its current wave resolves and
    /// the settled run is returned; a parked or pending run is cancelled at
    /// once. Cancelling a finished run is a no-op.
    pub async fn cancel(&self, run_id: &RunId) -> Result<SequenceRun> {
        let in_flight = self.lock_active().get(run_id).cloned();
        if let Some(token) = in_flight {
            info!(run_id = %run_id, "Cancelling run in flight");
            token.cancel();
        }

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.run(run_id)?;
        if SequenceExecutor::cancel(&mut run) {
            info!(run_id = %run_id, "Run cancelled");
            self.settle(&run).await?;
        }
        self.release_lock(&run);
        Ok(run)
    }

    /// Deliver a remote skill's result. Returns false when no step was waiting.
    pub fn complete_step(&self, run_id: &RunId, step: &str, result: StepCompletion) -> bool {
        let delivered = self.completions.complete(run_id, step, result);
        if !delivered {
            warn!(run_id = %run_id, step, "Completion for a step that is not waiting");
        }
        delivered
    }

    /// Reload state after a restart: parked approvals are re-registered and
    /// runs interrupted mid-flight are resumed. Returns the number resumed.
    pub async fn recover(&self) -> Result<usize> {
        let parked = self
            .runs
            .list_runs(Some(RunStatus::AwaitingApproval), RECOVERY_BATCH)?;
        let requests: Vec<ApprovalRequest> = parked.iter().flat_map(parked_requests).collect();
        if !requests.is_empty() {
            info!(count = requests.len(), "Restored pending approvals");
        }
        self.approvals.restore(requests).await;

        let mut interrupted = self.runs.list_runs(Some(RunStatus::Running), RECOVERY_BATCH)?;
        interrupted.extend(self.runs.list_runs(Some(RunStatus::Pending), RECOVERY_BATCH)?);

        let mut resumed = 0;
        for run in interrupted {
            let seq = match self.sequence_for(&run) {
                Ok(seq) => seq,
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "Cannot resume run");
                    continue;
                }
            };
            let lock = self.run_lock(&run.run_id);
            let _guard = lock.lock().await;
            let run = self.resume(&seq, run).await;
            self.release_lock(&run);
            resumed += 1;
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed interrupted runs");
        }
        Ok(resumed)
    }

    /// Drop debounce records older than `max_age`.
    pub fn purge_debounce(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| FleetError::Config(format!("invalid purge age: {}", e)))?;
        let purged = self.debounce.purge_older_than(Utc::now() - max_age)?;
        debug!(purged, "Purged debounce records");
        Ok(purged)
    }

    /// Drain the handoff queue: each event is handled once its `fire_at`
    /// passes. Events still waiting at shutdown are dropped. Only one worker
    /// may run; later calls return a finished task.
    pub fn spawn_handoff_worker(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let rx = self
            .handoff_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let fleet = self.clone();
        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                warn!("Handoff worker already running");
                return;
            };
            info!("Handoff worker started");
            loop {
                tokio::select! {
                    next = rx.recv() => {
                        let Some(scheduled) = next else { break };
                        let fleet = fleet.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            fleet.fire_handoff(scheduled, shutdown).await;
                        });
                    }
                    _ = shutdown.cancelled() => {
                        info!("Handoff worker shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn fire_handoff(&self, scheduled: ScheduledEvent, shutdown: CancellationToken) {
        let delay = (scheduled.fire_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                debug!(event_type = %scheduled.event.event_type, "Delayed handoff dropped at shutdown");
                return;
            }
        }
        let event_type = scheduled.event.event_type.clone();
        if let Err(e) = self.handle_event(scheduled.event).await {
            error!(event_type = %event_type, error = %e, "Handoff event failed");
        }
    }

    async fn resume(&self, seq: &ValidatedSequence, run: SequenceRun) -> SequenceRun {
        let token = self.track(&run.run_id);
        let run = self.executor.resume(seq, run, &token).await;
        self.untrack(&run.run_id);
        run
    }

    /// Persist and announce a run that ended outside the executor.
    async fn settle(&self, run: &SequenceRun) -> Result<()> {
        self.runs.save_run(run)?;
        self.approvals.forget_run(&run.run_id).await;
        self.event_bus.publish(FleetEvent::RunFinished {
            run_id: run.run_id.clone(),
            status: run.status,
        });
        Ok(())
    }

    fn sequence_for(&self, run: &SequenceRun) -> Result<Arc<ValidatedSequence>> {
        self.registry
            .load(&run.sequence_key, run.event.org_id, Some(run.version))
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, run_id: &RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock_active().insert(run_id.clone(), token.clone());
        token
    }

    fn untrack(&self, run_id: &RunId) {
        self.lock_active().remove(run_id);
    }

    fn run_lock(&self, run_id: &RunId) -> Arc<tokio::sync::Mutex<()>> {
        self.run_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(run_id.clone())
            .or_default()
            .clone()
    }

    fn release_lock(&self, run: &SequenceRun) {
        if run.status.is_terminal() {
            self.run_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&run.run_id);
        }
    }
}

/// `event:{org}:{type}:{dedup}`, where dedup is the caller's key or a
/// SHA-256 of the payload.
pub fn event_debounce_key(event: &Event) -> String {
    let dedup = match &event.dedup_key {
        Some(key) => key.clone(),
        None => {
            let bytes = serde_json::to_vec(&event.payload).unwrap_or_default();
            format!("{:x}", Sha256::digest(&bytes))
        }
    };
    format!("event:{}:{}:{}", event.org_id, event.event_type, dedup)
}

fn parked_requests(run: &SequenceRun) -> Vec<ApprovalRequest> {
    run.steps
        .iter()
        .filter(|s| s.status == StepStatus::AwaitingApproval)
        .map(|s| ApprovalRequest {
            run_id: run.run_id.clone(),
            step: s.name.clone(),
            skill: s.skill.clone(),
            sequence_key: run.sequence_key.clone(),
            org_id: run.event.org_id,
            user_id: run.event.user_id,
            preview: run.context.clone(),
            requested_at: run.updated_at,
        })
        .collect()
}
