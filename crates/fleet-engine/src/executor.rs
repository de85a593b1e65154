//! Wave-based sequence execution.
//!
//! A run walks the waves of its [`StepGraph`] in order. Steps of one wave run
//! concurrently (bounded by `max_concurrent_steps`) against a snapshot of the
//! run context taken when the wave starts; their outputs are merged in
//! definition order once the whole wave has resolved, so the earlier step
//! wins any key conflict and later waves overwrite earlier ones.
//!
//! Approval-gated steps park themselves and their dependents. When nothing
//! else can progress the run ends in `awaiting_approval` and is persisted;
//! [`SequenceExecutor::resume`] picks it up again after a decision.
//!
//! Handoff routes are evaluated for each succeeded step as its wave
//! resolves, so a later abort does not swallow follow-up events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_core::config::EngineConfig;
use fleet_core::dag::StepGraph;
use fleet_core::error::{FleetError, Result};
use fleet_core::event::{EventBus, FleetEvent};
use fleet_core::run::{
    ApprovalRequest, FailureKind, FailureReason, RunStatus, ScheduledEvent, SequenceRun,
    SkipReason, StepRecord, StepStatus,
};
use fleet_core::sequence::{Criticality, Step};
use fleet_core::traits::{RunStore, SkillCall, SkillExecutor};
use fleet_core::types::Context;

use crate::approval::ApprovalBroker;
use crate::handoff::HandoffEngine;
use crate::registry::ValidatedSequence;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_steps: usize,
    pub default_step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrent_steps: config.max_concurrent_steps.max(1),
            default_step_timeout: config.default_step_timeout(),
        }
    }
}

/// How a step's dependencies stand at the start of its wave.
enum DependencyState {
    Ready,
    /// A dependency is parked on approval.
    Waiting,
    Blocked(SkipReason),
}

struct StepFailure {
    kind: FailureKind,
    message: String,
}

struct HandoffStage {
    engine: HandoffEngine,
    queue: mpsc::UnboundedSender<ScheduledEvent>,
}

pub struct SequenceExecutor {
    skills: Arc<dyn SkillExecutor>,
    runs: Arc<dyn RunStore>,
    approvals: Arc<ApprovalBroker>,
    event_bus: Arc<EventBus>,
    config: ExecutorConfig,
    handoffs: Option<HandoffStage>,
}

impl SequenceExecutor {
    pub fn new(
        skills: Arc<dyn SkillExecutor>,
        runs: Arc<dyn RunStore>,
        approvals: Arc<ApprovalBroker>,
        event_bus: Arc<EventBus>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            skills,
            runs,
            approvals,
            event_bus,
            config,
            handoffs: None,
        }
    }

    /// Evaluate handoffs for every step that succeeds and push the
    /// scheduled events onto `queue`.
    pub fn with_handoffs(
        mut self,
        engine: HandoffEngine,
        queue: mpsc::UnboundedSender<ScheduledEvent>,
    ) -> Self {
        self.handoffs = Some(HandoffStage { engine, queue });
        self
    }

    /// Execute a fresh run to a terminal or parked state.
    pub async fn execute(
        &self,
        seq: &ValidatedSequence,
        run: SequenceRun,
        cancel: &CancellationToken,
    ) -> SequenceRun {
        info!(
            run_id = %run.run_id,
            sequence = %seq.key(),
            version = seq.version(),
            org_id = %run.event.org_id,
            waves = seq.graph.waves().len(),
            "Starting sequence run"
        );
        self.drive(seq, run, cancel).await
    }

    /// Continue a parked run after an approval decision.
    pub async fn resume(
        &self,
        seq: &ValidatedSequence,
        run: SequenceRun,
        cancel: &CancellationToken,
    ) -> SequenceRun {
        info!(run_id = %run.run_id, sequence = %seq.key(), "Resuming sequence run");
        self.drive(seq, run, cancel).await
    }

    async fn drive(
        &self,
        seq: &ValidatedSequence,
        mut run: SequenceRun,
        cancel: &CancellationToken,
    ) -> SequenceRun {
        if run.status.is_terminal() {
            return run;
        }
        let graph = &seq.graph;
        let slots = record_slots(graph, &mut run);

        run.status = RunStatus::Running;
        run.touch();
        self.persist(&run);
        self.event_bus.publish(FleetEvent::RunStarted {
            run_id: run.run_id.clone(),
            sequence_key: run.sequence_key.clone(),
            version: run.version,
        });

        for (wave_no, wave) in graph.waves().iter().enumerate() {
            if cancel.is_cancelled() {
                info!(run_id = %run.run_id, wave = wave_no, "Run cancelled between waves");
                Self::cancel(&mut run);
                break;
            }

            let mut ready = Vec::new();
            let mut gated = Vec::new();

            for &idx in wave {
                let step = graph.step(idx);
                let slot = slots[idx];
                if run.steps[slot].status.is_terminal()
                    || run.steps[slot].status == StepStatus::AwaitingApproval
                {
                    continue;
                }

                match dependency_state(graph, &slots, &run, idx) {
                    DependencyState::Ready => {}
                    DependencyState::Waiting => continue,
                    DependencyState::Blocked(reason) => {
                        self.skip(&mut run, slot, reason);
                        continue;
                    }
                }

                if !step.available {
                    self.skip(&mut run, slot, SkipReason::Unavailable);
                    continue;
                }

                if let Some(tier) = step
                    .requires_context
                    .iter()
                    .find(|t| !run.context.has_tier(t))
                {
                    debug!(
                        run_id = %run.run_id,
                        step = %step.name(),
                        tier = %tier,
                        "Required context tier missing"
                    );
                    self.skip(&mut run, slot, SkipReason::MissingContext);
                    continue;
                }

                if step.requires_approval && !run.approvals.contains(step.name()) {
                    run.steps[slot].status = StepStatus::AwaitingApproval;
                    gated.push(idx);
                    continue;
                }

                ready.push(idx);
            }

            let outcomes = self.run_wave(graph, &slots, &mut run, &ready).await;

            let mut abort: Option<FailureReason> = None;
            let mut outputs = Vec::with_capacity(outcomes.len());
            let mut succeeded = Vec::with_capacity(outcomes.len());
            for (idx, outcome) in outcomes {
                let step = graph.step(idx);
                let record = &mut run.steps[slots[idx]];
                record.finished_at = Some(Utc::now());
                match outcome {
                    Ok(output) => {
                        record.status = StepStatus::Succeeded;
                        debug!(run_id = %run.run_id, step = %step.name(), keys = output.len(), "Step succeeded");
                        run.outputs.insert(step.name().to_string(), output.clone());
                        outputs.push(output);
                        succeeded.push(step.name().to_string());
                    }
                    Err(failure) => {
                        record.status = StepStatus::Failed;
                        record.error = Some(failure.message.clone());
                        warn!(
                            run_id = %run.run_id,
                            step = %step.name(),
                            skill = %step.skill,
                            criticality = %step.criticality,
                            kind = ?failure.kind,
                            error = %failure.message,
                            "Step failed"
                        );
                        if step.criticality == Criticality::Critical && abort.is_none() {
                            abort = Some(FailureReason {
                                step: step.name().to_string(),
                                skill: step.skill.clone(),
                                criticality: step.criticality,
                                kind: failure.kind,
                                message: failure.message,
                            });
                        }
                    }
                }
                self.event_bus.publish(FleetEvent::StepFinished {
                    run_id: run.run_id.clone(),
                    step: step.name().to_string(),
                    status: run.steps[slots[idx]].status,
                });
            }

            if let Some(reason) = abort {
                // Same-wave siblings already finished; their outputs stay on
                // the run record but never reach the context.
                self.schedule_handoffs(&mut run, &succeeded);
                Self::abort(&mut run, reason);
                break;
            }

            merge_wave(&mut run.context, outputs);
            self.schedule_handoffs(&mut run, &succeeded);

            for idx in gated {
                self.request_approval(&run, graph.step(idx)).await;
            }

            run.touch();
            self.persist(&run);
        }

        if !run.status.is_terminal() {
            run.status = if run.steps.iter().all(|s| s.status.is_terminal()) {
                RunStatus::Succeeded
            } else {
                RunStatus::AwaitingApproval
            };
        }
        if cancel.is_cancelled() && !run.status.is_terminal() {
            info!(run_id = %run.run_id, "Run cancelled during its last wave");
            Self::cancel(&mut run);
        }
        if run.status.is_terminal() {
            self.approvals.forget_run(&run.run_id).await;
        }

        run.touch();
        self.persist(&run);
        self.event_bus.publish(FleetEvent::RunFinished {
            run_id: run.run_id.clone(),
            status: run.status,
        });
        info!(
            run_id = %run.run_id,
            sequence = %run.sequence_key,
            status = %run.status,
            awaiting = run.awaiting_approval().len(),
            "Sequence run settled"
        );
        run
    }

    /// Run the ready steps of one wave. Results come back in definition order.
    async fn run_wave(
        &self,
        graph: &StepGraph,
        slots: &[usize],
        run: &mut SequenceRun,
        ready: &[usize],
    ) -> Vec<(usize, std::result::Result<Context, StepFailure>)> {
        if ready.is_empty() {
            return Vec::new();
        }

        let input = run.context.clone();
        let mut calls = Vec::with_capacity(ready.len());
        for &idx in ready {
            let step = graph.step(idx);
            let record = &mut run.steps[slots[idx]];
            record.status = StepStatus::Running;
            record.started_at = Some(Utc::now());
            record.attempts += 1;
            let attempt = record.attempts;
            run.approvals.remove(step.name());

            self.event_bus.publish(FleetEvent::StepStarted {
                run_id: run.run_id.clone(),
                step: step.name().to_string(),
            });
            calls.push((
                idx,
                SkillCall {
                    run_id: run.run_id.clone(),
                    sequence_key: run.sequence_key.clone(),
                    step: step.name().to_string(),
                    skill: step.skill.clone(),
                    org_id: run.event.org_id,
                    user_id: run.event.user_id,
                    input: input.clone(),
                    timeout: step
                        .timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(self.config.default_step_timeout),
                    attempt,
                },
            ));
        }

        futures::stream::iter(
            calls
                .into_iter()
                .map(|(idx, call)| async move { (idx, self.invoke(call).await) }),
        )
        .buffered(self.config.max_concurrent_steps.max(1))
        .collect()
        .await
    }

    /// Invoke one skill under its timeout. Each call runs on its own task so a
    /// panicking skill only fails its step.
    async fn invoke(&self, call: SkillCall) -> std::result::Result<Context, StepFailure> {
        let skills = self.skills.clone();
        let step = call.step.clone();
        let timeout = call.timeout;

        let handle =
            tokio::spawn(async move { tokio::time::timeout(timeout, skills.execute(call)).await });

        match handle.await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(StepFailure {
                kind: match e {
                    FleetError::Dispatch { .. } => FailureKind::Dispatch,
                    FleetError::StepTimeout { .. } => FailureKind::Timeout,
                    _ => FailureKind::Execution,
                },
                message: e.to_string(),
            }),
            Ok(Err(_elapsed)) => Err(StepFailure {
                kind: FailureKind::Timeout,
                message: FleetError::StepTimeout {
                    step,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .to_string(),
            }),
            Err(join) => {
                error!(step = %step, error = %join, "Skill task aborted");
                Err(StepFailure {
                    kind: FailureKind::Execution,
                    message: format!("skill task aborted: {}", join),
                })
            }
        }
    }

    async fn request_approval(&self, run: &SequenceRun, step: &Step) {
        let request = ApprovalRequest {
            run_id: run.run_id.clone(),
            step: step.name().to_string(),
            skill: step.skill.clone(),
            sequence_key: run.sequence_key.clone(),
            org_id: run.event.org_id,
            user_id: run.event.user_id,
            preview: run.context.clone(),
            requested_at: Utc::now(),
        };
        self.event_bus.publish(FleetEvent::StepFinished {
            run_id: run.run_id.clone(),
            step: step.name().to_string(),
            status: StepStatus::AwaitingApproval,
        });
        self.approvals.request(request, run.channel).await;
    }

    /// Evaluate handoff routes for steps that just succeeded. Each step is
    /// evaluated at most once per run.
    fn schedule_handoffs(&self, run: &mut SequenceRun, steps: &[String]) {
        let Some(stage) = &self.handoffs else {
            return;
        };
        for step in steps {
            if !run.handoffs_processed.insert(step.clone()) {
                continue;
            }
            for handoff in stage.engine.on_step_completed(run, step) {
                if stage.queue.send(handoff.clone()).is_err() {
                    warn!(run_id = %run.run_id, step = %step, "Handoff queue closed, event dropped");
                }
                run.handoffs.push(handoff);
            }
        }
    }

    fn skip(&self, run: &mut SequenceRun, slot: usize, reason: SkipReason) {
        let record = &mut run.steps[slot];
        mark_skipped(record, reason);
        debug!(run_id = %run.run_id, step = %record.name, reason = ?reason, "Step skipped");
        self.event_bus.publish(FleetEvent::StepFinished {
            run_id: run.run_id.clone(),
            step: record.name.clone(),
            status: StepStatus::Skipped,
        });
    }

    fn persist(&self, run: &SequenceRun) {
        if let Err(e) = self.runs.save_run(run) {
            error!(run_id = %run.run_id, error = %e, "Failed to persist run");
        }
    }

    /// Mark an awaiting step approved; the next resume runs it.
    pub fn approve(run: &mut SequenceRun, step: &str) -> Result<()> {
        let record = awaiting_step(run, step, "approve")?;
        record.status = StepStatus::Pending;
        run.approvals.insert(step.to_string());
        run.touch();
        Ok(())
    }

    /// Skip an awaiting step for good. Its dependents are skipped when the run
    /// resumes. Rejecting a critical step fails the run.
    pub fn reject(run: &mut SequenceRun, seq: &ValidatedSequence, step: &str) -> Result<()> {
        let record = awaiting_step(run, step, "reject")?;
        mark_skipped(record, SkipReason::Rejected);
        let skill = record.skill.clone();
        run.touch();

        let critical = seq
            .definition
            .step(step)
            .map(|s| s.criticality == Criticality::Critical)
            .unwrap_or(false);
        if critical {
            let message = FleetError::ApprovalRejected {
                run_id: run.run_id.to_string(),
                step: step.to_string(),
            }
            .to_string();
            Self::abort(
                run,
                FailureReason {
                    step: step.to_string(),
                    skill,
                    criticality: Criticality::Critical,
                    kind: FailureKind::Rejected,
                    message,
                },
            );
        }
        Ok(())
    }

    /// Cancel a run: every non-terminal step is skipped. Returns false when
    /// the run was already terminal.
    pub fn cancel(run: &mut SequenceRun) -> bool {
        if run.status.is_terminal() {
            return false;
        }
        for record in run.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            mark_skipped(record, SkipReason::Cancelled);
        }
        run.status = RunStatus::Cancelled;
        run.touch();
        true
    }

    fn abort(run: &mut SequenceRun, reason: FailureReason) {
        error!(run_id = %run.run_id, reason = %reason, "Aborting run");
        for record in run.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            mark_skipped(record, SkipReason::Aborted);
        }
        run.status = RunStatus::Failed;
        run.failure = Some(reason);
        run.touch();
    }
}

fn awaiting_step<'a>(run: &'a mut SequenceRun, step: &str, action: &str) -> Result<&'a mut StepRecord> {
    let run_id = run.run_id.to_string();
    if run.status.is_terminal() {
        return Err(FleetError::InvalidRunState {
            run_id,
            action: action.to_string(),
            reason: format!("run is {}", run.status),
        });
    }
    let record = run.step_mut(step).ok_or_else(|| FleetError::InvalidRunState {
        run_id: run_id.clone(),
        action: action.to_string(),
        reason: format!("no step named '{}'", step),
    })?;
    if record.status != StepStatus::AwaitingApproval {
        return Err(FleetError::InvalidRunState {
            run_id,
            action: action.to_string(),
            reason: format!("step '{}' is {}", step, record.status),
        });
    }
    Ok(record)
}

fn mark_skipped(record: &mut StepRecord, reason: SkipReason) {
    record.status = StepStatus::Skipped;
    record.skip_reason = Some(reason);
    record.finished_at = Some(Utc::now());
}

/// Map graph indices to run record positions, adding records the run lacks.
fn record_slots(graph: &StepGraph, run: &mut SequenceRun) -> Vec<usize> {
    (0..graph.len())
        .map(|idx| {
            let step = graph.step(idx);
            match run.steps.iter().position(|r| r.name == step.name()) {
                Some(pos) => pos,
                None => {
                    run.steps.push(StepRecord {
                        name: step.name().to_string(),
                        skill: step.skill.clone(),
                        wave: graph.wave_of(idx),
                        status: StepStatus::Pending,
                        skip_reason: None,
                        error: None,
                        attempts: 0,
                        started_at: None,
                        finished_at: None,
                    });
                    run.steps.len() - 1
                }
            }
        })
        .collect()
}

fn dependency_state(
    graph: &StepGraph,
    slots: &[usize],
    run: &SequenceRun,
    idx: usize,
) -> DependencyState {
    let mut blocked: Option<SkipReason> = None;
    let mut waiting = false;

    for &dep in graph.dependencies(idx) {
        let record = &run.steps[slots[dep]];
        match record.status {
            StepStatus::Succeeded => {}
            StepStatus::Skipped => match record.skip_reason {
                Some(reason) if reason.satisfies_dependents() => {}
                Some(SkipReason::Rejected) => blocked = Some(SkipReason::Rejected),
                _ => {
                    blocked.get_or_insert(SkipReason::UpstreamFailed);
                }
            },
            StepStatus::Failed => {
                blocked.get_or_insert(SkipReason::UpstreamFailed);
            }
            StepStatus::Pending | StepStatus::Running | StepStatus::AwaitingApproval => {
                waiting = true;
            }
        }
    }

    match (blocked, waiting) {
        (Some(reason), _) => DependencyState::Blocked(reason),
        (None, true) => DependencyState::Waiting,
        (None, false) => DependencyState::Ready,
    }
}

/// Merge one wave's outputs (in definition order) into the run context.
/// Within the wave the first writer of a key wins.
fn merge_wave(context: &mut Context, outputs: Vec<Context>) {
    let mut written: HashSet<String> = HashSet::new();
    for output in outputs {
        for (key, value) in output.iter() {
            if written.insert(key.clone()) {
                context.set(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_wave_first_writer_wins() {
        let mut ctx = Context::from_value(json!({"summary": "from payload", "keep": 1}));
        let first = Context::from_value(json!({"summary": "first", "a": 1}));
        let second = Context::from_value(json!({"summary": "second", "b": 2}));
        merge_wave(&mut ctx, vec![first, second]);

        assert_eq!(ctx.get_str("summary"), Some("first"));
        assert_eq!(ctx.get("a"), Some(&json!(1)));
        assert_eq!(ctx.get("b"), Some(&json!(2)));
        assert_eq!(ctx.get("keep"), Some(&json!(1)));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        use fleet_core::sequence::SequenceDefinition;
        use fleet_core::types::{Event, OrgId, Scope};

        let def = SequenceDefinition::new(
            "s",
            Scope::Platform,
            vec![Step::new("a"), Step::new("b").depends_on(["a"])],
        );
        let event = Event::new("e", OrgId::new(), Context::new());
        let mut run = SequenceRun::new(&def, event, &[0, 1]);
        run.steps[0].status = StepStatus::Succeeded;

        assert!(SequenceExecutor::cancel(&mut run));
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.steps[0].status, StepStatus::Succeeded);
        assert_eq!(run.steps[1].skip_reason, Some(SkipReason::Cancelled));
        assert!(!SequenceExecutor::cancel(&mut run));
    }

    #[test]
    fn test_approve_requires_awaiting_step() {
        use fleet_core::sequence::SequenceDefinition;
        use fleet_core::types::{Event, OrgId, Scope};

        let def = SequenceDefinition::new("s", Scope::Platform, vec![Step::new("a").with_approval()]);
        let event = Event::new("e", OrgId::new(), Context::new());
        let mut run = SequenceRun::new(&def, event, &[0]);

        assert!(matches!(
            SequenceExecutor::approve(&mut run, "a"),
            Err(FleetError::InvalidRunState { .. })
        ));
        run.steps[0].status = StepStatus::AwaitingApproval;
        SequenceExecutor::approve(&mut run, "a").unwrap();
        assert_eq!(run.steps[0].status, StepStatus::Pending);
        assert!(run.approvals.contains("a"));
        assert!(matches!(
            SequenceExecutor::approve(&mut run, "ghost"),
            Err(FleetError::InvalidRunState { .. })
        ));
    }
}
