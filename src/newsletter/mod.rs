//! Newsletter application on top of the fan-out pipeline.
//!
//! Two routes read the subscriptions table's change log:
//! - `new-subscriber`: `SubscriberToken` rows become welcome emails
//! - `send-newsletter`: `NewsletterIssue` rows become one email per
//!   confirmed subscriber
//!
//! [`NewsletterApi`] writes those rows; the handlers consume the route
//! queues.

use std::sync::Arc;

use crate::queue::DurableQueue;
use crate::router::{RouteDefinition, RouterError};

pub mod api;
pub mod domain;
pub mod email;
pub mod handlers;
pub mod store;

pub use api::NewsletterApi;
pub use domain::{
    generate_subscription_token, ConfirmationMessage, NewsletterIssue, NewsletterMessage,
    SubscriberEmail, SubscriberName,
};
pub use email::{EmailClient, EmailError, LoggingEmailClient};
pub use handlers::{SendConfirmationHandler, SendNewsletterHandler};
pub use store::{
    FilesystemNewsletterStore, InMemoryNewsletterStore, InMemorySubscriberDirectory,
    NewsletterStore, StoreError, SubscriberDirectory,
};

pub const NEW_SUBSCRIBER_ROUTE: &str = "new-subscriber";
pub const SEND_NEWSLETTER_ROUTE: &str = "send-newsletter";

/// `Type` of subscription token rows.
pub const SUBSCRIBER_TOKEN_TYPE: &str = "SubscriberToken";
/// `Type` of newsletter issue rows.
pub const NEWSLETTER_ISSUE_TYPE: &str = "NewsletterIssue";

pub const NEW_SUBSCRIBER_PATTERN: &str = r#"{"Type": ["SubscriberToken"]}"#;
pub const NEW_SUBSCRIBER_TEMPLATE: &str = r#"{
    "trace_parent": <$.TraceParent?>,
    "parent_span": <$.ParentSpan?>,
    "email_address": <$.EmailAddress>,
    "subscriber_token": <$.PK>
}"#;

pub const SEND_NEWSLETTER_PATTERN: &str = r#"{"Type": ["NewsletterIssue"]}"#;
pub const SEND_NEWSLETTER_TEMPLATE: &str = r#"{
    "trace_parent": <$.TraceParent?>,
    "parent_span": <$.ParentSpan?>,
    "issue_title": <$.IssueTitle>,
    "s3_pointer": <$.S3Pointer>
}"#;

/// The two newsletter routes, delivering to the given queues.
pub fn newsletter_routes(
    new_subscriber: Arc<dyn DurableQueue>,
    send_newsletter: Arc<dyn DurableQueue>,
) -> Result<Vec<RouteDefinition>, RouterError> {
    Ok(vec![
        RouteDefinition::from_template(
            NEW_SUBSCRIBER_ROUTE,
            NEW_SUBSCRIBER_PATTERN,
            NEW_SUBSCRIBER_TEMPLATE,
            new_subscriber,
        )?,
        RouteDefinition::from_template(
            SEND_NEWSLETTER_ROUTE,
            SEND_NEWSLETTER_PATTERN,
            SEND_NEWSLETTER_TEMPLATE,
            send_newsletter,
        )?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, QueueConfig};
    use crate::router::FanoutRouter;
    use crate::test_utils::{newsletter_issue_event, subscriber_token_event};
    use std::time::Duration;

    #[tokio::test]
    async fn test_routes_produce_typed_messages() {
        let subscribers = Arc::new(InMemoryQueue::new(NEW_SUBSCRIBER_ROUTE, QueueConfig::default()));
        let issues = Arc::new(InMemoryQueue::new(SEND_NEWSLETTER_ROUTE, QueueConfig::default()));
        let mut builder = FanoutRouter::builder();
        for route in newsletter_routes(subscribers.clone(), issues.clone()).unwrap() {
            builder = builder.route(route);
        }
        let router = builder.build().unwrap();

        let report = router
            .route_batch(&[
                subscriber_token_event("tok123", "a@b.com", 1),
                newsletter_issue_event("Issue 1", "issue-1.json", 1),
            ])
            .await;
        assert_eq!(report.delivered, 2);

        let batch = subscribers.receive_batch(10, Duration::ZERO).await.unwrap();
        let confirmation: ConfirmationMessage = batch.deliveries[0].message.body_as().unwrap();
        assert_eq!(confirmation.email_address, "a@b.com");
        assert_eq!(confirmation.subscriber_token, "tok123");
        assert!(confirmation.trace_parent.is_none());

        let batch = issues.receive_batch(10, Duration::ZERO).await.unwrap();
        let newsletter: NewsletterMessage = batch.deliveries[0].message.body_as().unwrap();
        assert_eq!(newsletter.issue_title, "Issue 1");
        assert_eq!(newsletter.s3_pointer, "issue-1.json");
    }
}
