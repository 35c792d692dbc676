//! Queue consumers for the newsletter routes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    ConfirmationMessage, EmailClient, NewsletterMessage, NewsletterStore, SubscriberDirectory,
    SubscriberEmail,
};
use crate::invoker::{HandlerError, MessageHandler};
use crate::message::Delivery;

fn parse_body<T: serde::de::DeserializeOwned>(delivery: &Delivery) -> Result<T, HandlerError> {
    delivery
        .message
        .body_as()
        .map_err(|e| HandlerError::InvalidMessage {
            id: delivery.id(),
            reason: e.to_string(),
        })
}

/// Confirmation link for a subscription token.
pub fn confirmation_link(base_url: &str, subscription_token: &str) -> String {
    format!(
        "{}/subscriptions/confirm?subscription_token={}",
        base_url.trim_end_matches('/'),
        subscription_token
    )
}

/// Sends the welcome email with a confirmation link to new subscribers.
pub struct SendConfirmationHandler {
    email_client: Arc<dyn EmailClient>,
    base_url: String,
}

impl SendConfirmationHandler {
    pub fn new(email_client: Arc<dyn EmailClient>, base_url: impl Into<String>) -> Self {
        Self {
            email_client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for SendConfirmationHandler {
    fn name(&self) -> &str {
        "send-confirmation"
    }

    #[tracing::instrument(name = "newsletter.send_confirmation", skip_all, fields(message_id = %delivery.id()))]
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let body: ConfirmationMessage = parse_body(delivery)?;
        let recipient =
            SubscriberEmail::parse(body.email_address).map_err(|reason| HandlerError::InvalidMessage {
                id: delivery.id(),
                reason,
            })?;

        let link = confirmation_link(&self.base_url, &body.subscriber_token);
        let plain_body = format!(
            "Welcome to our newsletter!\nVisit {} to confirm your subscription.",
            link
        );
        let html_body = format!(
            "Welcome to our newsletter!<br />Click <a href=\"{}\">here</a> to confirm your subscription.",
            link
        );

        self.email_client
            .send_email(&recipient, "Welcome!", &html_body, &plain_body)
            .await
            .map_err(|e| HandlerError::Unavailable(e.to_string()))?;

        info!(subscriber = %recipient, "Confirmation email sent");
        Ok(())
    }
}

/// Sends a published issue to every confirmed subscriber.
pub struct SendNewsletterHandler {
    email_client: Arc<dyn EmailClient>,
    store: Arc<dyn NewsletterStore>,
    directory: Arc<dyn SubscriberDirectory>,
}

impl SendNewsletterHandler {
    pub fn new(
        email_client: Arc<dyn EmailClient>,
        store: Arc<dyn NewsletterStore>,
        directory: Arc<dyn SubscriberDirectory>,
    ) -> Self {
        Self {
            email_client,
            store,
            directory,
        }
    }
}

#[async_trait]
impl MessageHandler for SendNewsletterHandler {
    fn name(&self) -> &str {
        "send-newsletter"
    }

    #[tracing::instrument(name = "newsletter.send_issue", skip_all, fields(message_id = %delivery.id()))]
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let body: NewsletterMessage = parse_body(delivery)?;
        info!(issue = %body.issue_title, pointer = %body.s3_pointer, "Sending newsletter issue");

        let issue = self
            .store
            .retrieve(&body.s3_pointer)
            .await
            .map_err(|e| HandlerError::Unavailable(format!("Failed to retrieve issue: {}", e)))?;

        let subscribers = self
            .directory
            .confirmed_subscribers()
            .await
            .map_err(|e| HandlerError::Unavailable(format!("Failed to list subscribers: {}", e)))?;
        info!(count = subscribers.len(), "Confirmed subscribers loaded");

        for subscriber in subscribers {
            match subscriber {
                Ok(email) => {
                    self.email_client
                        .send_email(
                            &email,
                            &issue.issue_title,
                            &issue.html_content,
                            &issue.text_content,
                        )
                        .await
                        .map_err(|e| {
                            HandlerError::Unavailable(format!(
                                "Failed to send issue to {}: {}",
                                email, e
                            ))
                        })?;
                }
                Err(error) => {
                    warn!(
                        error = %error,
                        "Skipping a confirmed subscriber. Their stored contact details are invalid"
                    );
                }
            }
        }
        Ok(())
    }
}
