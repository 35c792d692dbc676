//! Newsletter issue content and subscriber storage.
//!
//! Issue content lives in a blob store addressed by pointer; the change log
//! only carries the pointer. Stored objects are JSON:
//! ```text
//! {bucket}/
//!   {issue-title-slug}.json
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use super::{NewsletterIssue, SubscriberEmail};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Issue already stored at '{0}'")]
    IssueExists(String),

    #[error("No object at '{0}'")]
    NotFound(String),

    #[error("Stored object '{pointer}' is unreadable: {reason}")]
    Corrupt { pointer: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Blob storage for issue content.
#[async_trait]
pub trait NewsletterStore: Send + Sync {
    /// Store an issue and return its pointer. Issues are never overwritten.
    async fn store(&self, issue: &NewsletterIssue) -> Result<String>;

    async fn retrieve(&self, pointer: &str) -> Result<NewsletterIssue>;
}

/// Object key for an issue: its title reduced to `[a-z0-9-]`.
pub fn object_key(issue_title: &str) -> String {
    let slug: String = issue_title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}.json", slug)
}

fn decode(pointer: &str, bytes: &[u8]) -> Result<NewsletterIssue> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        pointer: pointer.to_string(),
        reason: e.to_string(),
    })
}

fn encode(issue: &NewsletterIssue) -> Vec<u8> {
    // Plain string fields; serialization cannot fail.
    serde_json::to_vec(issue).unwrap_or_default()
}

/// In-memory bucket.
pub struct InMemoryNewsletterStore {
    bucket: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryNewsletterStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Write raw bytes at a pointer.
    pub async fn put_raw(&self, pointer: &str, bytes: Vec<u8>) {
        self.objects.write().await.insert(pointer.to_string(), bytes);
    }
}

#[async_trait]
impl NewsletterStore for InMemoryNewsletterStore {
    async fn store(&self, issue: &NewsletterIssue) -> Result<String> {
        let pointer = object_key(&issue.issue_title);
        let mut objects = self.objects.write().await;
        if objects.contains_key(&pointer) {
            return Err(StoreError::IssueExists(pointer));
        }
        objects.insert(pointer.clone(), encode(issue));
        debug!(bucket = %self.bucket, %pointer, "Stored newsletter issue");
        Ok(pointer)
    }

    async fn retrieve(&self, pointer: &str) -> Result<NewsletterIssue> {
        let objects = self.objects.read().await;
        let bytes = objects
            .get(pointer)
            .ok_or_else(|| StoreError::NotFound(pointer.to_string()))?;
        decode(pointer, bytes)
    }
}

/// Bucket backed by a local directory.
pub struct FilesystemNewsletterStore {
    base_path: PathBuf,
}

impl FilesystemNewsletterStore {
    /// Creates the base directory if it doesn't exist.
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn path_for(&self, pointer: &str) -> Result<PathBuf> {
        let is_plain = !pointer.is_empty()
            && pointer
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && !pointer.starts_with('.');
        if !is_plain {
            return Err(StoreError::NotFound(pointer.to_string()));
        }
        Ok(self.base_path.join(pointer))
    }
}

#[async_trait]
impl NewsletterStore for FilesystemNewsletterStore {
    async fn store(&self, issue: &NewsletterIssue) -> Result<String> {
        let pointer = object_key(&issue.issue_title);
        let path = self.path_for(&pointer)?;
        if fs::try_exists(&path).await? {
            return Err(StoreError::IssueExists(pointer));
        }

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, encode(issue)).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(path = %path.display(), "Stored newsletter issue");
        Ok(pointer)
    }

    async fn retrieve(&self, pointer: &str) -> Result<NewsletterIssue> {
        let path = self.path_for(pointer)?;
        match fs::read(&path).await {
            Ok(bytes) => decode(pointer, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(pointer.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Confirmed newsletter subscribers.
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Every confirmed subscriber. Stored addresses that no longer parse are
    /// returned as errors so callers can skip them.
    async fn confirmed_subscribers(
        &self,
    ) -> Result<Vec<std::result::Result<SubscriberEmail, String>>>;

    async fn confirm(&self, email: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySubscriberDirectory {
    confirmed: RwLock<Vec<String>>,
}

impl InMemorySubscriberDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriberDirectory for InMemorySubscriberDirectory {
    async fn confirmed_subscribers(
        &self,
    ) -> Result<Vec<std::result::Result<SubscriberEmail, String>>> {
        Ok(self
            .confirmed
            .read()
            .await
            .iter()
            .map(|raw| SubscriberEmail::parse(raw.as_str()))
            .collect())
    }

    async fn confirm(&self, email: &str) -> Result<()> {
        let mut confirmed = self.confirmed.write().await;
        if !confirmed.iter().any(|e| e == email) {
            confirmed.push(email.to_string());
        }
        Ok(())
    }
}
