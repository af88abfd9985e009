// Copyright (c) 2025 - Cowboy AI, Inc.
//! Typed event consumer
//!
//! An [`EventConsumer`] subscribes a durable, filtered JetStream consumer on
//! a channel's topic and feeds every message through a [`WorkerPool`]:
//! - Decode with the consumer's [`EventBuilder`]; nak on failure
//! - Invoke the [`EventHandler`]; nak on failure
//! - Ack on success; ack failures are logged, the broker may redeliver
//!
//! # Lifecycle
//!
//! ```text
//! Created ──subscribe()──► Subscribed ──stop()──► Draining ──► Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ocr_pipeline::consumer::{EventConsumer, FnEventHandler};
//! use ocr_pipeline::events::{Event, FileUploaded};
//! use ocr_pipeline::jetstream::ConsumerSettings;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = async_nats::connect("nats://localhost:4222").await?;
//!     let jetstream = async_nats::jetstream::new(client);
//!
//!     let settings = ConsumerSettings::new(
//!         "tgbot_file_uploaded_consumer",
//!         "storage",
//!         "storage.file.uploaded",
//!     )
//!     .with_workers(5);
//!
//!     let consumer = EventConsumer::for_payload(
//!         jetstream,
//!         settings,
//!         Arc::new(FnEventHandler::new(|event: Event<FileUploaded>| async move {
//!             println!("uploaded {}", event.payload().file_name);
//!             Ok::<_, anyhow::Error>(())
//!         })),
//!     );
//!
//!     consumer.subscribe().await?;
//!     // ...
//!     consumer.stop().await;
//!     Ok(())
//! }
//! ```

use async_nats::jetstream;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{field, info, info_span, warn, Instrument};

use crate::errors::{ConsumerError, ConsumerResult};
use crate::events::{Event, EventSpec, Payload};
use crate::jetstream::ConsumerSettings;
use crate::propagation::{default_propagator, record_status, Propagator};

pub mod pool;

pub use pool::{Delivery, EventBuilder, EventHandler, FnEventHandler, ProcessOutcome, WorkerPool};

/// Consumer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Subscribed,
    Draining,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Created => write!(f, "created"),
            ConsumerState::Subscribed => write!(f, "subscribed"),
            ConsumerState::Draining => write!(f, "draining"),
            ConsumerState::Stopped => write!(f, "stopped"),
        }
    }
}

struct Lifecycle {
    state: ConsumerState,
    delivery: Option<JoinHandle<()>>,
}

/// JetStream consumer for one event type
pub struct EventConsumer<T> {
    settings: ConsumerSettings,
    jetstream: jetstream::Context,
    pool: Arc<WorkerPool<T>>,
    stop: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
}

impl<T: EventSpec + 'static> EventConsumer<T> {
    /// Create a consumer with an explicit builder and propagator
    pub fn new(
        jetstream: jetstream::Context,
        settings: ConsumerSettings,
        builder: EventBuilder<T>,
        handler: Arc<dyn EventHandler<T>>,
        propagator: Propagator,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(&settings, builder, handler, propagator));
        let (stop, _) = watch::channel(false);

        Self {
            settings,
            jetstream,
            pool,
            stop,
            lifecycle: Mutex::new(Lifecycle {
                state: ConsumerState::Created,
                delivery: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Handlers running right now
    pub fn active_workers(&self) -> usize {
        self.pool.active_workers()
    }

    pub async fn state(&self) -> ConsumerState {
        self.lifecycle.lock().await.state
    }

    /// Create or update the durable consumer and start delivering messages
    ///
    /// Fails if the topic does not exist yet; producers create topics with
    /// `ensure_topic` at startup.
    pub async fn subscribe(&self) -> ConsumerResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != ConsumerState::Created {
            return Err(ConsumerError::InvalidState {
                name: self.settings.name.clone(),
                state: lifecycle.state.to_string(),
            });
        }

        let span = info_span!(
            "subscribe",
            otel.name = %format!("{}.subscribe", self.settings.channel),
            otel.kind = "consumer",
            otel.status_code = field::Empty,
            error.message = field::Empty,
            messaging.system = "nats",
            messaging.destination.name = %self.settings.filter_subject,
            consumer = %self.settings.name,
            channel = %self.settings.channel,
        );

        let result = self.open_feed().instrument(span.clone()).await;
        record_status(&span, &result);
        let delivery = result?;

        lifecycle.delivery = Some(delivery);
        lifecycle.state = ConsumerState::Subscribed;

        info!(
            consumer = %self.settings.name,
            subject = %self.settings.filter_subject,
            workers = self.pool.workers(),
            capacity = self.pool.capacity(),
            "Consumer subscribed"
        );

        Ok(())
    }

    async fn open_feed(&self) -> ConsumerResult<JoinHandle<()>> {
        let topic = self.settings.topic();

        let stream = self
            .jetstream
            .get_stream(&topic)
            .await
            .map_err(|e| ConsumerError::Topic {
                topic: topic.clone(),
                source: e.into(),
            })?;

        let consumer = stream
            .create_consumer(self.settings.consumer_config())
            .await
            .map_err(|e| ConsumerError::Durable {
                name: self.settings.name.clone(),
                source: e.into(),
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| ConsumerError::Messages {
                name: self.settings.name.clone(),
                source: e.into(),
            })?;

        let name = self.settings.name.clone();
        let messages = messages.filter_map(move |message| {
            let name = name.clone();
            async move {
                match message {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(consumer = %name, error = %e, "Failed to receive message");
                        None
                    }
                }
            }
        });

        Ok(self.pool.spawn(messages, self.stop.subscribe()))
    }

    /// Stop pulling from the broker and release the subscription
    ///
    /// Waits for the delivery loop to exit. Handlers already running are not
    /// interrupted and may finish after this returns.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        match lifecycle.state {
            ConsumerState::Subscribed => {
                lifecycle.state = ConsumerState::Draining;
                self.stop.send_replace(true);

                if let Some(delivery) = lifecycle.delivery.take() {
                    if let Err(e) = delivery.await {
                        warn!(consumer = %self.settings.name, error = %e, "Delivery loop panicked");
                    }
                }

                lifecycle.state = ConsumerState::Stopped;
                info!(consumer = %self.settings.name, "Consumer stopped");
            }
            ConsumerState::Created => {
                self.stop.send_replace(true);
                lifecycle.state = ConsumerState::Stopped;
            }
            ConsumerState::Draining | ConsumerState::Stopped => {}
        }
    }
}

impl<P: Payload> EventConsumer<Event<P>> {
    /// Create a consumer that decodes messages with [`Event::from_message`]
    pub fn for_payload(
        jetstream: jetstream::Context,
        settings: ConsumerSettings,
        handler: Arc<dyn EventHandler<Event<P>>>,
    ) -> Self {
        Self::new(
            jetstream,
            settings,
            payload_builder::<P>(),
            handler,
            default_propagator(),
        )
    }
}

/// Builder decoding the standard wire shape into `Event<P>`
pub fn payload_builder<P: Payload>() -> EventBuilder<Event<P>> {
    Arc::new(Event::<P>::from_message)
}
