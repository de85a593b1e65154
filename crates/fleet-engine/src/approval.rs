use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use fleet_core::event::{EventBus, FleetEvent};
use fleet_core::run::ApprovalRequest;
use fleet_core::traits::NotificationSink;
use fleet_core::types::{Channel, RunId};

use crate::notify::LogNotifier;

fn request_key(run_id: &RunId, step: &str) -> String {
    format!("{}:{}", run_id, step)
}

/// Tracks approval requests that are waiting on a human.
///
/// The run itself is parked in the run store; the broker only holds the
/// request for listing, publishes the request/resolution events and hands the
/// request to the notification sink.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, ApprovalRequest>>,
    notifier: Arc<dyn NotificationSink>,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self::with_notifier(event_bus, Arc::new(LogNotifier))
    }

    pub fn with_notifier(event_bus: Arc<EventBus>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            notifier,
            event_bus,
        }
    }

    /// Record a request, publish it and deliver it over `channel`.
    /// Delivery failures are logged; the request stays pending.
    pub async fn request(&self, req: ApprovalRequest, channel: Channel) {
        self.event_bus.publish(FleetEvent::ApprovalRequested {
            request: req.clone(),
        });
        self.pending
            .lock()
            .await
            .insert(request_key(&req.run_id, &req.step), req.clone());

        info!(run_id = %req.run_id, step = %req.step, channel = %channel, "Approval requested");
        if let Err(e) = self.notifier.request_approval(&req, channel).await {
            warn!(
                run_id = %req.run_id,
                step = %req.step,
                channel = %channel,
                error = %e,
                "Failed to deliver approval request"
            );
        }
    }

    /// Re-register requests of runs parked before a restart, without notifying again.
    pub async fn restore(&self, requests: Vec<ApprovalRequest>) {
        let mut pending = self.pending.lock().await;
        for req in requests {
            pending.insert(request_key(&req.run_id, &req.step), req);
        }
    }

    /// Clear a pending request and publish the decision.
    /// Returns the request if it was pending.
    pub async fn resolve(&self, run_id: &RunId, step: &str, approved: bool) -> Option<ApprovalRequest> {
        let entry = self.pending.lock().await.remove(&request_key(run_id, step));
        self.event_bus.publish(FleetEvent::ApprovalResolved {
            run_id: run_id.clone(),
            step: step.to_string(),
            approved,
        });
        entry
    }

    /// Drop every pending request belonging to a run.
    pub async fn forget_run(&self, run_id: &RunId) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, req| &req.run_id != run_id);
        before - pending.len()
    }

    /// List all pending approvals.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut list: Vec<_> = self.pending.lock().await.values().cloned().collect();
        list.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        list
    }
}
