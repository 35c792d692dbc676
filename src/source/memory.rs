//! In-memory change log for standalone mode and testing.
//!
//! Behaves like a table with a change stream: `put`/`delete` mutate the
//! current row image and append a change event to the row's partition.
//! Records older than the retention window are trimmed lazily.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use super::{
    ChangeSource, ChangeStream, Checkpoint, Result, SourceError, StartingPosition,
    SubscribeOptions,
};
use crate::event::{Attributes, ChangeEvent, EventType};

/// Default retention window for change records.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct Partition {
    records: VecDeque<Arc<ChangeEvent>>,
    next_sequence: u64,
    current: Option<Attributes>,
}

impl Partition {
    fn append(
        &mut self,
        partition_key: &str,
        event_type: EventType,
        attributes: Attributes,
    ) -> Arc<ChangeEvent> {
        self.next_sequence += 1;
        let event = Arc::new(ChangeEvent::new(
            partition_key,
            self.next_sequence,
            event_type,
            attributes,
            Utc::now(),
        ));
        self.records.push_back(Arc::clone(&event));
        event
    }

    fn tail(&self) -> u64 {
        self.next_sequence
    }

    /// Records with a sequence number greater than `after`.
    fn records_after(&self, after: u64) -> impl Iterator<Item = &Arc<ChangeEvent>> {
        let start = self
            .records
            .partition_point(|r| r.sequence_number() <= after);
        self.records.range(start..)
    }
}

struct LogInner {
    name: String,
    retention: Duration,
    partitions: RwLock<BTreeMap<String, Partition>>,
    notify: Notify,
    failing_reads: AtomicU32,
}

impl LogInner {
    async fn trim_expired(&self) -> usize {
        let retention = match chrono::Duration::from_std(self.retention) {
            Ok(r) => r,
            Err(_) => return 0,
        };
        let horizon = Utc::now() - retention;

        let mut partitions = self.partitions.write().await;
        let mut trimmed = 0;
        for partition in partitions.values_mut() {
            while partition
                .records
                .front()
                .is_some_and(|r| r.approximate_arrival_time() < horizon)
            {
                partition.records.pop_front();
                trimmed += 1;
            }
        }
        trimmed
    }

    fn check_available(&self) -> Result<()> {
        let fail = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(SourceError::Unavailable(format!(
                "change log '{}' temporarily unavailable",
                self.name
            )));
        }
        Ok(())
    }
}

/// In-memory, partitioned, append-only change log.
///
/// Cloning shares the same log.
#[derive(Clone)]
pub struct InMemoryChangeLog {
    inner: Arc<LogInner>,
}

impl InMemoryChangeLog {
    /// Create a log with the default 24h retention.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_retention(name, DEFAULT_RETENTION)
    }

    /// Create a log with a custom retention window.
    pub fn with_retention(name: impl Into<String>, retention: Duration) -> Self {
        let name = name.into();
        info!(table = %name, retention_secs = retention.as_secs(), "Change log initialized");
        Self {
            inner: Arc::new(LogInner {
                name,
                retention,
                partitions: RwLock::new(BTreeMap::new()),
                notify: Notify::new(),
                failing_reads: AtomicU32::new(0),
            }),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append a raw change record.
    #[tracing::instrument(name = "log.append", skip(self, attributes), fields(table = %self.inner.name))]
    pub async fn append(
        &self,
        partition_key: &str,
        event_type: EventType,
        attributes: Attributes,
    ) -> Arc<ChangeEvent> {
        let event = {
            let mut partitions = self.inner.partitions.write().await;
            partitions
                .entry(partition_key.to_string())
                .or_default()
                .append(partition_key, event_type, attributes)
        };
        debug!(
            partition_key = %partition_key,
            sequence = event.sequence_number(),
            event_type = %event_type,
            "Appended change record"
        );
        self.inner.notify.notify_waiters();
        event
    }

    /// Write a row image. Emits `INSERT` for a new row and `MODIFY` otherwise.
    pub async fn put(&self, partition_key: &str, attributes: Attributes) -> Arc<ChangeEvent> {
        let event_type = {
            let mut partitions = self.inner.partitions.write().await;
            let partition = partitions.entry(partition_key.to_string()).or_default();
            let event_type = if partition.current.is_some() {
                EventType::Modify
            } else {
                EventType::Insert
            };
            partition.current = Some(attributes.clone());
            event_type
        };
        self.append(partition_key, event_type, attributes).await
    }

    /// Delete a row. Emits `REMOVE` carrying the old image, or nothing if the
    /// row does not exist.
    pub async fn delete(&self, partition_key: &str) -> Option<Arc<ChangeEvent>> {
        let old = {
            let mut partitions = self.inner.partitions.write().await;
            partitions
                .get_mut(partition_key)
                .and_then(|p| p.current.take())
        }?;
        Some(self.append(partition_key, EventType::Remove, old).await)
    }

    /// Current image of a row.
    pub async fn get(&self, partition_key: &str) -> Option<Attributes> {
        let partitions = self.inner.partitions.read().await;
        partitions.get(partition_key).and_then(|p| p.current.clone())
    }

    /// Retained records of one partition, in order.
    pub async fn records(&self, partition_key: &str) -> Vec<Arc<ChangeEvent>> {
        let partitions = self.inner.partitions.read().await;
        partitions
            .get(partition_key)
            .map(|p| p.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of retained records across all partitions.
    pub async fn len(&self) -> usize {
        let partitions = self.inner.partitions.read().await;
        partitions.values().map(|p| p.records.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop records older than the retention window.
    pub async fn trim_expired(&self) -> usize {
        let trimmed = self.inner.trim_expired().await;
        if trimmed > 0 {
            info!(table = %self.inner.name, trimmed, "Trimmed expired change records");
        }
        trimmed
    }

    /// Make the next `n` reads fail with `SourceError::Unavailable`.
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.failing_reads.store(n, Ordering::SeqCst);
    }

    async fn open(
        &self,
        options: SubscribeOptions,
        checkpoint: Checkpoint,
    ) -> Result<Box<dyn ChangeStream>> {
        options.validate()?;

        let mut cursors = checkpoint.positions().clone();
        if options.start == StartingPosition::Latest {
            let partitions = self.inner.partitions.read().await;
            for (key, partition) in partitions.iter() {
                cursors.entry(key.clone()).or_insert_with(|| partition.tail());
            }
        }

        info!(
            table = %self.inner.name,
            start = ?options.start,
            batch_size = options.batch_size,
            resumed_partitions = checkpoint.positions().len(),
            "Change log subscription opened"
        );

        Ok(Box::new(MemoryChangeStream {
            log: Arc::clone(&self.inner),
            options,
            cursors,
            rotation: 0,
        }))
    }
}

#[async_trait]
impl ChangeSource for InMemoryChangeLog {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<Box<dyn ChangeStream>> {
        self.open(options, Checkpoint::new()).await
    }

    async fn resume(
        &self,
        options: SubscribeOptions,
        checkpoint: Checkpoint,
    ) -> Result<Box<dyn ChangeStream>> {
        self.open(options, checkpoint).await
    }
}

/// Cursor over an [`InMemoryChangeLog`].
struct MemoryChangeStream {
    log: Arc<LogInner>,
    options: SubscribeOptions,
    /// Last delivered sequence number per partition.
    cursors: BTreeMap<String, u64>,
    /// Rotates the starting partition so no partition starves.
    rotation: usize,
}

impl MemoryChangeStream {
    async fn collect_batch(&mut self) -> Vec<Arc<ChangeEvent>> {
        let log = Arc::clone(&self.log);
        let partitions = log.partitions.read().await;
        let keys: Vec<&String> = partitions
            .keys()
            .filter(|k| self.options.includes(k))
            .collect();
        if keys.is_empty() {
            return Vec::new();
        }

        let mut batch = Vec::with_capacity(self.options.batch_size);
        let offset = self.rotation % keys.len();
        self.rotation = self.rotation.wrapping_add(1);

        for key in keys.iter().cycle().skip(offset).take(keys.len()) {
            if batch.len() >= self.options.batch_size {
                break;
            }
            let Some(partition) = partitions.get(*key) else {
                continue;
            };
            let cursor = self.cursors.get(*key).copied().unwrap_or(0);

            if let Some(first) = partition.records.front() {
                if first.sequence_number() > cursor + 1 && cursor > 0 {
                    warn!(
                        partition_key = %key,
                        cursor,
                        oldest_retained = first.sequence_number(),
                        "Cursor behind trim horizon, skipping to oldest retained record"
                    );
                }
            }

            let remaining = self.options.batch_size - batch.len();
            for record in partition.records_after(cursor).take(remaining) {
                self.cursors
                    .insert((*key).clone(), record.sequence_number());
                batch.push(Arc::clone(record));
            }
        }

        batch
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn next_batch(&mut self, max_wait: Duration) -> Result<Vec<Arc<ChangeEvent>>> {
        self.log.check_available()?;
        self.log.trim_expired().await;

        let log = Arc::clone(&self.log);
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            // Register for wakeups before looking, so an append between the
            // check and the wait is not missed.
            let notified = log.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.collect_batch().await;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::new();
        for (key, seq) in &self.cursors {
            checkpoint.advance(key, *seq);
        }
        checkpoint
    }
}
