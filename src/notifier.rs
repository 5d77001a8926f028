use crate::config::Ntfy;
use crate::error::{EngineError, Result};
use crate::state::UpdateCandidate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub priority: u8,
}

impl Notification {
    pub fn update_available(candidate: &UpdateCandidate, priority: u8) -> Self {
        Self {
            title: format!("New tag for {}", candidate.workload.key.workload_name),
            message: format!(
                "Container: {}\nWorkload: {}\nCurrent Tag: {}\nNew Tag: {}\nFound At: {}",
                candidate.current_image.repository,
                candidate.key(),
                candidate.current_tag,
                candidate.new_tag,
                candidate.found_at.to_rfc3339()
            ),
            priority,
        }
    }

    pub fn committed(candidate: &UpdateCandidate, target: &str, priority: u8) -> Self {
        Self {
            title: format!("GitOps commit for {}", candidate.workload.key.workload_name),
            message: format!(
                "Workload: {}\nBefore: {}\nAfter: {}\nTarget: {}",
                candidate.key(),
                candidate.current_image,
                candidate.new_image(),
                target
            ),
            priority,
        }
    }
}

/// A channel that delivers notifications and reports when it did so.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<DateTime<Utc>>;
}

/// Publishes to an ntfy server through its JSON API.
pub struct NtfyNotifier {
    client: Client,
    url: String,
    topic: String,
    token: crate::secret_string::SecretString,
}

#[derive(Serialize)]
struct NtfyMessage<'a> {
    topic: &'a str,
    title: &'a str,
    message: &'a str,
    priority: u8,
}

impl NtfyNotifier {
    pub fn new(client: Client, config: &Ntfy) -> Self {
        Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            topic: config.topic.clone(),
            token: config.token.clone(),
        }
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn send(&self, notification: &Notification) -> Result<DateTime<Utc>> {
        let body = NtfyMessage {
            topic: &self.topic,
            title: &notification.title,
            message: &notification.message,
            priority: notification.priority,
        };
        debug!("Publishing notification to ntfy topic {}", self.topic);

        let mut request = self.client.post(&self.url).json(&body);
        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, self.token.bearer_header());
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::NotificationDispatch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::NotificationDispatch(format!(
                "ntfy returned status {}",
                response.status()
            )));
        }
        Ok(Utc::now())
    }
}
