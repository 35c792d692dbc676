//! Test utilities and mock implementations.
//!
//! Mock handlers and fixtures for exercising the pipeline without real
//! consumers or email providers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::event::{attributes, ChangeEvent, EventKey, EventType};
use crate::invoker::{EventBatchHandler, HandlerError, MessageHandler};
use crate::message::{Delivery, OutboundMessage, TraceContext};
use crate::newsletter::{EmailClient, EmailError, SubscriberEmail};

/// Mock message handler that records every delivery it sees.
///
/// Messages can be made to fail by source event key; everything else
/// succeeds.
#[derive(Default)]
pub struct MockMessageHandler {
    handled: RwLock<Vec<Delivery>>,
    fail_on: RwLock<HashSet<EventKey>>,
    fail_all: RwLock<bool>,
}

impl MockMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail deliveries of this source event until cleared.
    pub async fn fail_on(&self, key: EventKey) {
        self.fail_on.write().await.insert(key);
    }

    pub async fn clear_failures(&self) {
        self.fail_on.write().await.clear();
        *self.fail_all.write().await = false;
    }

    pub async fn set_fail_all(&self, fail: bool) {
        *self.fail_all.write().await = fail;
    }

    /// Successfully handled deliveries, in handling order.
    pub async fn handled(&self) -> Vec<Delivery> {
        self.handled.read().await.clone()
    }

    pub async fn handled_keys(&self) -> Vec<EventKey> {
        self.handled
            .read()
            .await
            .iter()
            .map(|d| d.message.source.clone())
            .collect()
    }
}

#[async_trait]
impl MessageHandler for MockMessageHandler {
    fn name(&self) -> &str {
        "mock"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        if *self.fail_all.read().await || self.fail_on.read().await.contains(&delivery.message.source)
        {
            return Err(HandlerError::Failed(format!(
                "Configured to fail {}",
                delivery.message.source
            )));
        }
        self.handled.write().await.push(delivery.clone());
        Ok(())
    }
}

/// Mock stream handler that records every event batch.
#[derive(Default)]
pub struct MockEventBatchHandler {
    batches: RwLock<Vec<Vec<EventKey>>>,
    fail: RwLock<bool>,
}

impl MockEventBatchHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    pub async fn batches(&self) -> Vec<Vec<EventKey>> {
        self.batches.read().await.clone()
    }
}

#[async_trait]
impl EventBatchHandler for MockEventBatchHandler {
    fn name(&self) -> &str {
        "mock-stream"
    }

    async fn handle(&self, events: &[Arc<ChangeEvent>]) -> Result<(), HandlerError> {
        if *self.fail.read().await {
            return Err(HandlerError::Unavailable("Configured to fail".to_string()));
        }
        self.batches
            .write()
            .await
            .push(events.iter().map(|e| e.key()).collect());
        Ok(())
    }
}

/// An email captured by [`MockEmailClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub recipient: String,
    pub subject: String,
    pub html_content: String,
    pub text_content: String,
}

/// Mock email client that records sends instead of delivering them.
#[derive(Default)]
pub struct MockEmailClient {
    sent: RwLock<Vec<SentEmail>>,
    fail_for: RwLock<HashSet<String>>,
}

impl MockEmailClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send to this recipient.
    pub async fn fail_for(&self, recipient: &str) {
        self.fail_for.write().await.insert(recipient.to_string());
    }

    pub async fn sent(&self) -> Vec<SentEmail> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl EmailClient for MockEmailClient {
    async fn send_email(
        &self,
        recipient: &SubscriberEmail,
        subject: &str,
        html_content: &str,
        text_content: &str,
    ) -> Result<(), EmailError> {
        if self.fail_for.read().await.contains(recipient.as_str()) {
            return Err(EmailError::Rejected(recipient.as_str().to_string()));
        }
        self.sent.write().await.push(SentEmail {
            recipient: recipient.as_str().to_string(),
            subject: subject.to_string(),
            html_content: html_content.to_string(),
            text_content: text_content.to_string(),
        });
        Ok(())
    }
}

/// A `SubscriberToken` insert event.
pub fn subscriber_token_event(token: &str, email: &str, seq: u64) -> Arc<ChangeEvent> {
    Arc::new(ChangeEvent::new(
        token,
        seq,
        EventType::Insert,
        attributes([
            ("PK", token),
            ("Type", "SubscriberToken"),
            ("EmailAddress", email),
        ]),
        Utc::now(),
    ))
}

/// A `NewsletterIssue` insert event.
pub fn newsletter_issue_event(title: &str, pointer: &str, seq: u64) -> Arc<ChangeEvent> {
    Arc::new(ChangeEvent::new(
        title,
        seq,
        EventType::Insert,
        attributes([
            ("PK", title),
            ("Type", "NewsletterIssue"),
            ("IssueTitle", title),
            ("S3Pointer", pointer),
        ]),
        Utc::now(),
    ))
}

/// An outbound message for `route` sourced from `(partition, seq)`.
pub fn outbound_message(route: &str, partition: &str, seq: u64) -> OutboundMessage {
    OutboundMessage::new(
        route,
        EventKey::new(partition, seq),
        serde_json::json!({ "partition": partition, "seq": seq }),
        TraceContext::default(),
    )
}
