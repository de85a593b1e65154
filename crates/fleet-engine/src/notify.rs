use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use fleet_core::config::NotificationsConfig;
use fleet_core::error::{FleetError, Result};
use fleet_core::run::ApprovalRequest;
use fleet_core::traits::NotificationSink;
use fleet_core::types::Channel;

/// Notification sink that only logs. Used when no webhooks are configured.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn request_approval(
        &self,
        request: &ApprovalRequest,
        channel: Channel,
    ) -> BoxFuture<'_, Result<()>> {
        info!(
            run_id = %request.run_id,
            step = %request.step,
            sequence = %request.sequence_key,
            channel = %channel,
            "Approval pending (no notification webhook configured)"
        );
        Box::pin(async { Ok(()) })
    }
}

/// Posts approval requests as JSON to a per-channel webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhooks: HashMap<Channel, String>,
}

impl WebhookNotifier {
    pub fn new(config: &NotificationsConfig) -> Self {
        let mut webhooks = HashMap::new();
        for (name, url) in &config.webhooks {
            match name.parse::<Channel>() {
                Ok(channel) => {
                    webhooks.insert(channel, url.clone());
                }
                Err(e) => warn!(channel = %name, error = %e, "Ignoring webhook for unknown channel"),
            }
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, webhooks }
    }

    pub fn is_empty(&self) -> bool {
        self.webhooks.is_empty()
    }
}

impl NotificationSink for WebhookNotifier {
    fn request_approval(
        &self,
        request: &ApprovalRequest,
        channel: Channel,
    ) -> BoxFuture<'_, Result<()>> {
        let url = self.webhooks.get(&channel).cloned();
        let body = json!({
            "kind": "approval_request",
            "channel": channel,
            "run_id": request.run_id,
            "step": request.step,
            "skill": request.skill,
            "sequence_key": request.sequence_key,
            "org_id": request.org_id,
            "user_id": request.user_id,
            "preview": request.preview,
            "requested_at": request.requested_at,
        });
        let run_id = request.run_id.clone();
        let step = request.step.clone();

        Box::pin(async move {
            let Some(url) = url else {
                warn!(run_id = %run_id, step = %step, channel = %channel, "No webhook for channel");
                return Ok(());
            };
            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| FleetError::Dispatch {
                    message: format!("approval webhook: {}", e),
                    retryable: true,
                })?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FleetError::Dispatch {
                    message: format!("approval webhook returned {}", status),
                    retryable: status.is_server_error(),
                });
            }
            info!(run_id = %run_id, step = %step, channel = %channel, "Approval request delivered");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhooks_keyed_by_parsed_channel() {
        let mut config = NotificationsConfig::default();
        config
            .webhooks
            .insert("in-app".into(), "http://app.local/notify".into());
        config
            .webhooks
            .insert("pager".into(), "http://pager.local".into());
        let notifier = WebhookNotifier::new(&config);
        assert_eq!(notifier.webhooks.len(), 1);
        assert!(notifier.webhooks.contains_key(&Channel::InApp));
        assert!(WebhookNotifier::new(&NotificationsConfig::default()).is_empty());
    }
}
