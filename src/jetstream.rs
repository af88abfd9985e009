// Copyright (c) 2025 - Cowboy AI, Inc.

//! JetStream topic and durable consumer configuration
//!
//! A *channel* is the namespace a service publishes under (`storage`, `ocr`).
//! Each channel is backed by one JetStream stream whose name is derived with
//! [`topic_name`], and which captures every subject matching `<channel>.>`.
//! Producers and consumers both locate the stream through [`topic_name`] only,
//! so they agree on it without sharing any state.
//!
//! # Example
//!
//! ```rust
//! use ocr_pipeline::jetstream::{topic_name, TopicSettings};
//!
//! assert_eq!(topic_name("ocr.file"), "OCR_FILE");
//!
//! let topic = TopicSettings::new("storage").with_description("Storage Service Event Stream");
//! assert_eq!(topic.subject_pattern(), "storage.>");
//! ```

use async_nats::jetstream::{self, consumer::pull};
use std::time::Duration;

/// Default retention for event topics (7 days)
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default time the broker waits for an ack before redelivering
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Default number of workers per consumer
pub const DEFAULT_WORKERS: usize = 1;

/// Default number of buffered messages per worker
pub const DEFAULT_BUFFER_SIZE: usize = 10;

/// Derive the JetStream stream name for a channel
///
/// Every character that is not ASCII alphanumeric becomes `_` and the result
/// is uppercased.
pub fn topic_name(channel: &str) -> String {
    channel
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Storage type for a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// File-based storage (persistent across restarts)
    File,
    /// Memory-based storage (faster, but lost on restart)
    Memory,
}

/// Durable topic configuration owned by a producer
#[derive(Debug, Clone)]
pub struct TopicSettings {
    /// Channel the topic backs
    pub channel: String,

    /// Human readable description
    pub description: Option<String>,

    /// Maximum age of messages
    pub max_age: Duration,

    /// Storage backend
    pub storage: StorageType,
}

impl TopicSettings {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            description: None,
            max_age: DEFAULT_MAX_AGE,
            storage: StorageType::File,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    /// Stream name on the broker
    pub fn topic(&self) -> String {
        topic_name(&self.channel)
    }

    /// Subject filter captured by the topic
    pub fn subject_pattern(&self) -> String {
        format!("{}.>", self.channel)
    }

    /// JetStream stream configuration
    pub fn stream_config(&self) -> jetstream::stream::Config {
        let storage = match self.storage {
            StorageType::File => jetstream::stream::StorageType::File,
            StorageType::Memory => jetstream::stream::StorageType::Memory,
        };

        jetstream::stream::Config {
            name: self.topic(),
            description: self.description.clone(),
            subjects: vec![self.subject_pattern()],
            max_age: self.max_age,
            storage,
            ..Default::default()
        }
    }
}

/// Where a new durable consumer starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Deliver all messages from the topic start
    All,
    /// Deliver only new messages
    New,
    /// Deliver the last message, then new ones
    Last,
    /// Deliver from a specific sequence
    ByStartSequence(u64),
}

impl From<DeliverPolicy> for jetstream::consumer::DeliverPolicy {
    fn from(policy: DeliverPolicy) -> Self {
        match policy {
            DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
            DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
            DeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
            DeliverPolicy::ByStartSequence(start_sequence) => {
                jetstream::consumer::DeliverPolicy::ByStartSequence { start_sequence }
            }
        }
    }
}

/// Configuration of a typed consumer and its broker-side durable cursor
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Consumer name, also used as the durable name
    pub name: String,

    /// Channel whose topic is consumed
    pub channel: String,

    /// Subject filter, usually a single event type
    pub filter_subject: String,

    /// Human readable description
    pub description: Option<String>,

    /// Maximum concurrently running handlers
    pub workers: usize,

    /// Buffered messages per worker
    pub buffer_size: usize,

    /// Start position for a new durable cursor
    pub deliver_policy: DeliverPolicy,

    /// Time the broker waits for an ack before redelivering
    pub ack_wait: Duration,

    /// Broker-side redelivery cap, `None` for unlimited
    pub max_deliver: Option<i64>,
}

impl ConsumerSettings {
    pub fn new(
        name: impl Into<String>,
        channel: impl Into<String>,
        filter_subject: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            filter_subject: filter_subject.into(),
            description: None,
            workers: DEFAULT_WORKERS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            deliver_policy: DeliverPolicy::All,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the worker count; zero falls back to one worker
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        self
    }

    /// Set the per-worker buffer; zero falls back to ten messages
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        self
    }

    pub fn with_deliver_policy(mut self, deliver_policy: DeliverPolicy) -> Self {
        self.deliver_policy = deliver_policy;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    /// Worker count with the zero fallback applied
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    /// Capacity of the in-process buffer: workers × per-worker buffer
    pub fn capacity(&self) -> usize {
        let buffer = if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        };
        self.worker_count() * buffer
    }

    /// Stream name of the consumed topic
    pub fn topic(&self) -> String {
        topic_name(&self.channel)
    }

    /// Durable pull consumer configuration with explicit acks
    pub fn consumer_config(&self) -> pull::Config {
        pull::Config {
            name: Some(self.name.clone()),
            durable_name: Some(self.name.clone()),
            description: self.description.clone(),
            filter_subject: self.filter_subject.clone(),
            deliver_policy: self.deliver_policy.into(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver.unwrap_or(-1),
            ..Default::default()
        }
    }
}
