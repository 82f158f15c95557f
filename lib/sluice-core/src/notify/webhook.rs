use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sluice_error::{ErrorContext as _, GenericError};

use super::{Notification, NotificationChannel};

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Chat webhook channel.
///
/// Posts `{"text": "<title>\n<body>"}`, which Slack, Mattermost and Rocket.Chat incoming webhooks all accept.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    /// Creates a new `WebhookChannel`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new<U: Into<String>>(url: U, timeout: Duration) -> Result<Self, GenericError> {
        let builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")));
        // Tests talk to a local listener, which a proxy from the environment would intercept.
        #[cfg(test)]
        let builder = builder.no_proxy();
        let client = builder
            .build()
            .error_context("Failed to build webhook HTTP client.")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), GenericError> {
        let text = format!("{}\n{}", notification.title, notification.body);
        self.client
            .post(&self.url)
            .json(&WebhookPayload { text: &text })
            .send()
            .await
            .error_context("Failed to send webhook request.")?
            .error_for_status()
            .error_context("Webhook rejected notification.")?;

        Ok(())
    }
}
