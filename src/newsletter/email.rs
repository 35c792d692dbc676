//! Outgoing email.

use async_trait::async_trait;
use tracing::info;

use super::SubscriberEmail;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmailError {
    #[error("Recipient rejected: {0}")]
    Rejected(String),

    #[error("Email provider unavailable: {0}")]
    Unavailable(String),
}

/// Sends mail on behalf of the newsletter.
#[async_trait]
pub trait EmailClient: Send + Sync {
    async fn send_email(
        &self,
        recipient: &SubscriberEmail,
        subject: &str,
        html_content: &str,
        text_content: &str,
    ) -> Result<(), EmailError>;
}

/// Email client that only logs what it would send.
///
/// Stands in for a real provider when running the pipeline locally.
pub struct LoggingEmailClient {
    sender: String,
    api_key: Option<String>,
}

impl LoggingEmailClient {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            api_key: None,
        }
    }

    /// Provider key resolved at startup.
    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

#[async_trait]
impl EmailClient for LoggingEmailClient {
    async fn send_email(
        &self,
        recipient: &SubscriberEmail,
        subject: &str,
        _html_content: &str,
        text_content: &str,
    ) -> Result<(), EmailError> {
        info!(
            from = %self.sender,
            to = %recipient,
            authenticated = self.api_key.is_some(),
            subject,
            body = text_content,
            "Email sent"
        );
        Ok(())
    }
}
