//! Newsletter domain types.

use std::fmt;

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of a subscription token.
pub const SUBSCRIPTION_TOKEN_LEN: usize = 25;

const MAX_NAME_CHARS: usize = 256;
const FORBIDDEN_NAME_CHARS: [char; 9] = ['/', '(', ')', '"', '<', '>', '\\', '{', '}'];

/// A syntactically valid subscriber email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberEmail(String);

impl SubscriberEmail {
    /// Accepts `local@domain` where both parts are non-empty and the domain
    /// has no whitespace.
    pub fn parse(s: impl Into<String>) -> Result<Self, String> {
        let s = s.into();
        let trimmed = s.trim();
        let valid = match trimmed.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !domain.contains('@')
                    && !trimmed.chars().any(char::is_whitespace)
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
            }
            None => false,
        };
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(format!("{} is not a valid subscriber email", s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriberEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscriber display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberName(String);

impl SubscriberName {
    pub fn parse(s: impl Into<String>) -> Result<Self, String> {
        let s = s.into();
        let is_blank = s.trim().is_empty();
        let is_too_long = s.chars().count() > MAX_NAME_CHARS;
        let has_forbidden = s.chars().any(|c| FORBIDDEN_NAME_CHARS.contains(&c));
        if is_blank || is_too_long || has_forbidden {
            Err(format!("{} is not a valid subscriber name", s))
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriberName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Random alphanumeric subscription token.
pub fn generate_subscription_token() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(SUBSCRIPTION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Stored newsletter issue content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsletterIssue {
    pub issue_title: String,
    pub text_content: String,
    pub html_content: String,
}

impl NewsletterIssue {
    pub fn new(issue_title: &str, text_content: &str, html_content: &str) -> Self {
        Self {
            issue_title: issue_title.to_string(),
            text_content: text_content.to_string(),
            html_content: html_content.to_string(),
        }
    }
}

/// Body of a `new-subscriber` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationMessage {
    pub trace_parent: Option<String>,
    pub parent_span: Option<String>,
    pub email_address: String,
    pub subscriber_token: String,
}

/// Body of a `send-newsletter` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsletterMessage {
    pub trace_parent: Option<String>,
    pub parent_span: Option<String>,
    pub issue_title: String,
    pub s3_pointer: String,
}
