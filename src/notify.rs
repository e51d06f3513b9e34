//! Completion notifications
//!
//! After a backup run a short summary can be pushed to an
//! [ntfy](https://ntfy.sh)-compatible endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Title attached to every notification
const NOTIFICATION_TITLE: &str = "reposnap backup";

/// Delivers a one-line message with optional tags
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, tags: &[&str]) -> Result<()>;
}

/// Posts notifications to an ntfy topic URL
#[derive(Debug, Clone)]
pub struct NtfyNotifier {
    client: reqwest::Client,
    url: String,
}

impl NtfyNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn notify(&self, message: &str, tags: &[&str]) -> Result<()> {
        debug!("Sending notification to {}", self.url);

        let mut request = self
            .client
            .post(&self.url)
            .header("Title", NOTIFICATION_TITLE)
            .body(message.to_string());

        if !tags.is_empty() {
            request = request.header("Tags", tags.join(","));
        }

        request
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Notification rejected by {}", self.url))?;

        Ok(())
    }
}
