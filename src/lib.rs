// Copyright (c) 2025 - Cowboy AI, Inc.
//! Reliable event delivery for the OCR pipeline
//!
//! Services exchange typed events over NATS JetStream:
//! - [`events`] - the event envelope and the catalog of payloads
//! - [`producer`] - synchronous, acknowledged publishing to durable topics
//! - [`consumer`] - durable consumers with a bounded worker pool and ack/nak
//! - [`outbox`] - transactional outbox tables relayed to a producer
//!
//! Delivery is at-least-once end to end. Handlers must be idempotent on the
//! event id.

pub mod config;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod jetstream;
pub mod nats;
pub mod outbox;
pub mod producer;
pub mod propagation;

pub use config::{AppConfig, PostgresConfig};
pub use consumer::{ConsumerState, EventConsumer, EventHandler, FnEventHandler};
pub use errors::{
    ConsumerError, ConsumerResult, DecodeError, DecodeResult, NatsError, NatsResult, OutboxError,
    OutboxResult, ProducerError, ProducerResult,
};
pub use events::{Event, EventSpec, Payload};
pub use jetstream::{topic_name, ConsumerSettings, TopicSettings};
pub use nats::{NatsClient, NatsConfig};
pub use outbox::{EventRegistry, OutboxProcessor, OutboxSettings, PassReport};
pub use producer::{EventProducer, Publish};
