//! Newsletter HTTP endpoints.
//!
//! - `POST /subscriptions` (form `name`, `email`): records a subscription
//!   token row, which the `new-subscriber` route turns into a welcome email
//! - `GET /subscriptions/confirm?subscription_token=...`: confirms the
//!   subscriber the token was issued to
//! - `POST /admin/newsletters` (form `title`, `text_content`,
//!   `html_content`): stores the issue and records a `NewsletterIssue` row
//!   for the `send-newsletter` route
//!
//! Writes go to the change-logged table only; everything downstream happens
//! through the fan-out pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::{error, info, warn};

use super::store::StoreError;
use super::{
    generate_subscription_token, NewsletterIssue, NewsletterStore, SubscriberDirectory,
    SubscriberEmail, SubscriberName, NEWSLETTER_ISSUE_TYPE, SUBSCRIBER_TOKEN_TYPE,
};
use crate::event::{AttributeValue, Attributes};
use crate::ingress::{text_response, RequestHandler};
use crate::source::InMemoryChangeLog;
use crate::transform::{DEFAULT_PARENT_SPAN_ATTR, DEFAULT_TRACE_PARENT_ATTR};

/// W3C trace context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

#[derive(Deserialize)]
struct SubscribeForm {
    name: String,
    email: String,
}

#[derive(Deserialize)]
struct PublishForm {
    title: String,
    text_content: String,
    html_content: String,
}

#[derive(Deserialize)]
struct ConfirmParams {
    subscription_token: String,
}

/// Request handler for the newsletter endpoints.
pub struct NewsletterApi {
    table: InMemoryChangeLog,
    store: Arc<dyn NewsletterStore>,
    directory: Arc<dyn SubscriberDirectory>,
}

impl NewsletterApi {
    pub fn new(
        table: InMemoryChangeLog,
        store: Arc<dyn NewsletterStore>,
        directory: Arc<dyn SubscriberDirectory>,
    ) -> Self {
        Self {
            table,
            store,
            directory,
        }
    }

    #[tracing::instrument(name = "newsletter.subscribe", skip_all)]
    async fn subscribe(&self, request: &Request<Bytes>) -> Response<Bytes> {
        let form: SubscribeForm = match serde_urlencoded::from_bytes(request.body()) {
            Ok(form) => form,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
        };
        let email = match SubscriberEmail::parse(form.email) {
            Ok(email) => email,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, e),
        };
        let name = match SubscriberName::parse(form.name) {
            Ok(name) => name,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, e),
        };

        let token = generate_subscription_token();
        let mut row = Attributes::new();
        row.insert("PK".into(), token.as_str().into());
        row.insert("Type".into(), SUBSCRIBER_TOKEN_TYPE.into());
        row.insert("EmailAddress".into(), email.as_str().into());
        row.insert("SubscriberName".into(), name.as_str().into());
        insert_trace(&mut row, request);

        let event = self.table.put(&token, row).await;
        info!(subscriber = %email, event = %event.key(), "Subscription recorded");
        text_response(StatusCode::OK, "")
    }

    #[tracing::instrument(name = "newsletter.confirm", skip_all)]
    async fn confirm(&self, request: &Request<Bytes>) -> Response<Bytes> {
        let query = request.uri().query().unwrap_or_default();
        let params: ConfirmParams = match serde_urlencoded::from_str(query) {
            Ok(params) => params,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
        };

        let row = self.table.get(&params.subscription_token).await;
        let email = row.as_ref().and_then(|row| {
            let is_token = row.get("Type").and_then(AttributeValue::as_str)
                == Some(SUBSCRIBER_TOKEN_TYPE);
            is_token
                .then(|| row.get("EmailAddress").and_then(AttributeValue::as_str))
                .flatten()
        });
        let Some(email) = email else {
            warn!("Unknown subscription token");
            return text_response(StatusCode::UNAUTHORIZED, "");
        };

        if let Err(e) = self.directory.confirm(email).await {
            error!(error = %e, "Failed to confirm subscriber");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "");
        }
        info!(subscriber = %email, "Subscriber confirmed");
        text_response(StatusCode::OK, "")
    }

    #[tracing::instrument(name = "newsletter.publish", skip_all)]
    async fn publish(&self, request: &Request<Bytes>) -> Response<Bytes> {
        let form: PublishForm = match serde_urlencoded::from_bytes(request.body()) {
            Ok(form) => form,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
        };
        if form.title.trim().is_empty() {
            return text_response(StatusCode::BAD_REQUEST, "title must not be empty");
        }

        let issue = NewsletterIssue::new(&form.title, &form.text_content, &form.html_content);
        let pointer = match self.store.store(&issue).await {
            Ok(pointer) => pointer,
            Err(StoreError::IssueExists(pointer)) => {
                return text_response(
                    StatusCode::CONFLICT,
                    format!("Issue already published at {}", pointer),
                )
            }
            Err(e) => {
                error!(error = %e, "Failed to store newsletter issue");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "");
            }
        };

        let mut row = Attributes::new();
        row.insert("PK".into(), issue.issue_title.as_str().into());
        row.insert("Type".into(), NEWSLETTER_ISSUE_TYPE.into());
        row.insert("IssueTitle".into(), issue.issue_title.as_str().into());
        row.insert("S3Pointer".into(), pointer.as_str().into());
        insert_trace(&mut row, request);

        let event = self.table.put(&issue.issue_title, row).await;
        info!(issue = %issue.issue_title, %pointer, event = %event.key(), "Newsletter issue published");

        let mut response = text_response(StatusCode::SEE_OTHER, "");
        response
            .headers_mut()
            .insert(header::LOCATION, header::HeaderValue::from_static("/admin/newsletters"));
        response
    }
}

/// Copy the caller's trace context onto a row.
///
/// `traceparent` is `version-trace_id-parent_id-flags`; the parent id is
/// stored separately as the parent span.
fn insert_trace(row: &mut Attributes, request: &Request<Bytes>) {
    let Some(trace_parent) = request
        .headers()
        .get(TRACEPARENT_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return;
    };
    row.insert(DEFAULT_TRACE_PARENT_ATTR.into(), trace_parent.into());
    if let Some(parent_span) = trace_parent.split('-').nth(2) {
        row.insert(DEFAULT_PARENT_SPAN_ATTR.into(), parent_span.into());
    }
}

#[async_trait]
impl RequestHandler for NewsletterApi {
    async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        match (request.method(), request.uri().path()) {
            (&Method::POST, "/subscriptions") => self.subscribe(&request).await,
            (&Method::GET, "/subscriptions/confirm") => self.confirm(&request).await,
            (&Method::POST, "/admin/newsletters") => self.publish(&request).await,
            (_, "/subscriptions" | "/subscriptions/confirm" | "/admin/newsletters") => {
                text_response(StatusCode::METHOD_NOT_ALLOWED, "")
            }
            _ => text_response(StatusCode::NOT_FOUND, ""),
        }
    }
}
