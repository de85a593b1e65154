use chrono::{DateTime, Utc};

use crate::run::{ApprovalRequest, RunStatus, StepStatus};
use crate::types::{EventId, RunId};

/// Domain events broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// A run began executing (or resumed).
    RunStarted {
        run_id: RunId,
        sequence_key: String,
        version: u32,
    },
    StepStarted { run_id: RunId, step: String },
    StepFinished {
        run_id: RunId,
        step: String,
        status: StepStatus,
    },
    ApprovalRequested { request: ApprovalRequest },
    ApprovalResolved {
        run_id: RunId,
        step: String,
        approved: bool,
    },
    /// A run reached a terminal state or parked on approval.
    RunFinished { run_id: RunId, status: RunStatus },
    HandoffScheduled {
        run_id: RunId,
        target_event_type: String,
        fire_at: DateTime<Utc>,
    },
    /// An incoming event or handoff was deliberately not acted on.
    EventSuppressed {
        event_id: EventId,
        event_type: String,
        reason: String,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FleetEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(FleetEvent::StepStarted {
            run_id: RunId::new(),
            step: "a".into(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let run_id = RunId::new();
        bus.publish(FleetEvent::RunFinished {
            run_id: run_id.clone(),
            status: RunStatus::Succeeded,
        });
        match rx.recv().await.unwrap() {
            FleetEvent::RunFinished { run_id: got, status } => {
                assert_eq!(got, run_id);
                assert_eq!(status, RunStatus::Succeeded);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
