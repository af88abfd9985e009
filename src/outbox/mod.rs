// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transactional outbox
//!
//! Business logic writes an outbox row in the same database transaction as
//! its domain mutation ([`record_outbox_event`]). An [`OutboxProcessor`] later
//! reads unpublished rows, publishes them through a producer and marks them
//! published, so an event reaches the broker if and only if the mutation
//! committed.
//!
//! ```text
//! business tx ──INSERT + pg_notify──► outbox table
//!                                         │
//!        notification / ticker ──► OutboxProcessor::process
//!                                         │
//!                     decode (registry) ──► publish ──► mark published
//! ```
//!
//! Delivery is at-least-once. A row can be published and then fail to be
//! marked, in which case it is published again on a later pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::OutboxResult;

pub mod postgres;
pub mod processor;
pub mod registry;

pub use postgres::{record_outbox_event, PgChangeFeed, PgOutboxStore};
pub use processor::OutboxProcessor;
pub use registry::EventRegistry;

/// Default outbox table name
pub const DEFAULT_OUTBOX_TABLE: &str = "outbox";

/// Notification channel of the storage service outbox
pub const STORAGE_OUTBOX_CHANNEL: &str = "storage_outbox_channel";

/// Notification channel of the OCR service outbox
pub const OCR_OUTBOX_CHANNEL: &str = "ocr_outbox_channel";

/// Rows fetched per pass unless configured otherwise
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Fallback interval between passes unless configured otherwise
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// One row of an outbox table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxRecord {
    /// ULID of the event, as text
    pub event_id: String,
    /// Dotted event type
    pub event_type: String,
    /// JSON representation of the payload
    pub payload: serde_json::Value,
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

/// Outbox processor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxSettings {
    /// Outbox table name
    pub table: String,
    /// LISTEN/NOTIFY channel signalling new rows
    pub notify_channel: String,
    /// Maximum rows handled per pass
    pub batch_size: i64,
    /// Fallback ticker period
    pub interval: Duration,
}

impl OutboxSettings {
    pub fn new(table: impl Into<String>, notify_channel: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            notify_channel: notify_channel.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Settings of the storage service outbox
    pub fn storage() -> Self {
        Self::new(DEFAULT_OUTBOX_TABLE, STORAGE_OUTBOX_CHANNEL)
    }

    /// Settings of the OCR service outbox
    pub fn ocr() -> Self {
        Self::new(DEFAULT_OUTBOX_TABLE, OCR_OUTBOX_CHANNEL)
    }

    /// Non-positive sizes fall back to the default
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = if batch_size > 0 {
            batch_size
        } else {
            DEFAULT_BATCH_SIZE
        };
        self
    }

    /// A zero interval falls back to the default
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        self
    }
}

/// Counts of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Unpublished rows read
    pub fetched: usize,
    /// Rows published and marked
    pub published: usize,
    /// Rows whose publish failed; retried on the next pass
    pub failed: usize,
    /// Rows with an unknown type or a malformed id or payload
    pub undecodable: usize,
    /// Rows published but not marked; they will be published again
    pub published_but_not_marked: usize,
    /// Rows left for the next pass after a mark failed
    pub deferred: usize,
}

impl PassReport {
    /// True when every fetched row was published and marked
    pub fn is_clean(&self) -> bool {
        self.published == self.fetched
    }
}

/// Source of outbox transactions
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Begin a transaction that one pass reads and marks rows in
    async fn begin(&self) -> OutboxResult<Box<dyn OutboxBatch>>;
}

/// A single open outbox transaction
///
/// Dropping a batch without committing rolls back every mark made in it.
#[async_trait]
pub trait OutboxBatch: Send {
    /// Unpublished rows, oldest first, claimed for this transaction
    async fn fetch_unpublished(&mut self, limit: i64) -> OutboxResult<Vec<OutboxRecord>>;

    /// Flag a row as published once this transaction commits
    ///
    /// After a failure the batch may refuse every later mark, so callers
    /// stop publishing on the first error.
    async fn mark_published(&mut self, event_id: &str) -> OutboxResult<()>;

    async fn commit(self: Box<Self>) -> OutboxResult<()>;
}

/// Notifications that new outbox rows were committed
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open the feed; every item is one wake-up
    async fn subscribe(&self) -> OutboxResult<BoxStream<'static, ()>>;
}
