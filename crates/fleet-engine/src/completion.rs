use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use fleet_core::config::DispatchConfig;
use fleet_core::error::{FleetError, Result};
use fleet_core::traits::{SkillCall, SkillExecutor};
use fleet_core::types::{Context, OrgId, RunId, UserId};

use crate::dispatch::{DispatchTrace, Dispatcher, Endpoint};

/// Result reported by a remote skill: its output, or an error message.
pub type StepCompletion = std::result::Result<Context, String>;

type PendingMap = HashMap<(String, String), oneshot::Sender<StepCompletion>>;

/// Matches completion callbacks to steps waiting on remote skills.
pub struct CompletionBroker {
    pending: Mutex<PendingMap>,
}

impl CompletionBroker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter. Dropping the returned guard unregisters it.
    pub fn register(self: &Arc<Self>, run_id: &RunId, step: &str) -> CompletionWaiter {
        let (tx, rx) = oneshot::channel();
        let key = (run_id.to_string(), step.to_string());
        self.lock().insert(key.clone(), tx);
        CompletionWaiter {
            broker: self.clone(),
            key,
            rx: Some(rx),
        }
    }

    /// Deliver a completion. Returns true if a step was waiting for it.
    pub fn complete(&self, run_id: &RunId, step: &str, result: StepCompletion) -> bool {
        let entry = self.lock().remove(&(run_id.to_string(), step.to_string()));
        match entry {
            // Ignore send error (the waiter may have timed out meanwhile)
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CompletionBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending completion for one step.
pub struct CompletionWaiter {
    broker: Arc<CompletionBroker>,
    key: (String, String),
    rx: Option<oneshot::Receiver<StepCompletion>>,
}

impl CompletionWaiter {
    pub async fn wait(mut self) -> Result<Context> {
        let rx = self.rx.take().ok_or_else(|| FleetError::StepExecution {
            step: self.key.1.clone(),
            message: "completion already awaited".into(),
        })?;
        match rx.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(message)) => Err(FleetError::StepExecution {
                step: self.key.1.clone(),
                message,
            }),
            Err(_) => Err(FleetError::StepExecution {
                step: self.key.1.clone(),
                message: "completion channel closed".into(),
            }),
        }
    }
}

impl Drop for CompletionWaiter {
    fn drop(&mut self) {
        self.broker.lock().remove(&self.key);
    }
}

/// Body posted to a remote skill endpoint.
#[derive(Debug, Serialize)]
struct DispatchEnvelope<'a> {
    run_id: &'a RunId,
    sequence_key: &'a str,
    step: &'a str,
    skill: &'a str,
    org_id: OrgId,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    attempt: u32,
    timeout_ms: u64,
    input: &'a Context,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<String>,
}

/// Runs skills remotely: dispatch over HTTP, then wait for the completion
/// callback. The executor's step timeout bounds the whole exchange.
pub struct DispatchingExecutor {
    dispatcher: Arc<Dispatcher>,
    completions: Arc<CompletionBroker>,
    config: DispatchConfig,
}

impl DispatchingExecutor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        completions: Arc<CompletionBroker>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            dispatcher,
            completions,
            config,
        }
    }
}

impl SkillExecutor for DispatchingExecutor {
    fn execute(&self, call: SkillCall) -> BoxFuture<'_, Result<Context>> {
        Box::pin(async move {
            let url = self
                .config
                .endpoint_for(&call.skill)
                .ok_or_else(|| FleetError::SkillNotFound(call.skill.clone()))?;
            let endpoint = Endpoint::new(url).with_token(self.config.auth_token.clone());

            // Register before dispatching so a fast callback is never lost.
            let waiter = self.completions.register(&call.run_id, &call.step);

            let envelope = DispatchEnvelope {
                run_id: &call.run_id,
                sequence_key: &call.sequence_key,
                step: &call.step,
                skill: &call.skill,
                org_id: call.org_id,
                user_id: call.user_id,
                attempt: call.attempt,
                timeout_ms: call.timeout.as_millis() as u64,
                input: &call.input,
                callback_url: self.config.callback_for(&call.run_id.0, &call.step),
            };
            let trace = DispatchTrace {
                run_id: call.run_id.to_string(),
                step: call.step.clone(),
            };
            let request_timeout = std::time::Duration::from_millis(self.config.request_timeout_ms)
                .min(call.timeout);

            let receipt = self
                .dispatcher
                .dispatch(&endpoint, &envelope, request_timeout, &trace)
                .await?;
            debug!(
                run_id = %call.run_id,
                step = %call.step,
                attempts = receipt.attempts,
                "Awaiting skill completion"
            );

            let output = waiter.wait().await;
            if let Err(e) = &output {
                warn!(run_id = %call.run_id, step = %call.step, error = %e, "Remote skill failed");
            }
            output
        })
    }
}
