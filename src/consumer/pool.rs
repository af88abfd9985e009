// Copyright (c) 2025 - Cowboy AI, Inc.
//! Bounded worker pool behind every consumer
//!
//! ```text
//! broker feed ──► delivery loop ──► bounded buffer (W×B) ──► W workers ──► handler
//!                     │                                         │
//!                 blocks when full                    ack / nak per message
//! ```
//!
//! The delivery loop is the only task that ever waits for buffer space, which
//! pushes back on the broker's delivery rate. Workers hold a semaphore permit
//! while they process a message, so at most `W` handlers run at once. A
//! panicking handler is treated like a failing one: the message is nak'd and
//! the worker keeps going.

use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, field, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::errors::DecodeResult;
use crate::events::EventSpec;
use crate::jetstream::ConsumerSettings;
use crate::propagation::{HeaderExtractor, Propagator};

/// A received broker message that can be settled
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    /// Message headers, if any were sent
    fn headers(&self) -> Option<&HeaderMap>;

    /// Message body
    fn payload(&self) -> &[u8];

    /// Acknowledge successful processing
    async fn ack(&self) -> Result<(), async_nats::Error>;

    /// Ask the broker to redeliver the message
    async fn nak(&self) -> Result<(), async_nats::Error>;
}

#[async_trait]
impl Delivery for async_nats::jetstream::Message {
    fn headers(&self) -> Option<&HeaderMap> {
        self.message.headers.as_ref()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<(), async_nats::Error> {
        async_nats::jetstream::Message::ack(self).await
    }

    async fn nak(&self) -> Result<(), async_nats::Error> {
        self.ack_with(async_nats::jetstream::AckKind::Nak(None))
            .await
    }
}

/// Turns a received message into a typed event
pub type EventBuilder<T> =
    Arc<dyn Fn(Option<&HeaderMap>, &[u8]) -> DecodeResult<T> + Send + Sync>;

/// Business logic invoked for every decoded event
///
/// Delivery is at-least-once: the same event may arrive more than once and
/// implementations must be idempotent on the event id.
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    async fn handle(&self, event: T) -> anyhow::Result<()>;
}

/// Function-based event handler
pub struct FnEventHandler<F> {
    handler: F,
}

impl<F> FnEventHandler<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<T, F, Fut> EventHandler<T> for FnEventHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: T) -> anyhow::Result<()> {
        (self.handler)(event).await
    }
}

/// How a single message was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler succeeded and the message was acknowledged
    Acked,
    /// Handler succeeded but the acknowledgment failed; the broker may redeliver
    AckFailed,
    /// The message could not be decoded and was negatively acknowledged
    DecodeFailed,
    /// The handler failed and the message was negatively acknowledged
    HandlerFailed,
}

/// Decode-and-dispatch core of a consumer, independent of the broker feed
pub struct WorkerPool<T> {
    name: String,
    channel: String,
    subject: String,
    workers: usize,
    capacity: usize,
    builder: EventBuilder<T>,
    handler: Arc<dyn EventHandler<T>>,
    propagator: Propagator,
    slots: Arc<Semaphore>,
}

impl<T: EventSpec + 'static> WorkerPool<T> {
    pub fn new(
        settings: &ConsumerSettings,
        builder: EventBuilder<T>,
        handler: Arc<dyn EventHandler<T>>,
        propagator: Propagator,
    ) -> Self {
        let workers = settings.worker_count();

        Self {
            name: settings.name.clone(),
            channel: settings.channel.clone(),
            subject: settings.filter_subject.clone(),
            workers,
            capacity: settings.capacity(),
            builder,
            handler,
            propagator,
            slots: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Maximum concurrently running handlers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Capacity of the message buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Handlers running right now
    pub fn active_workers(&self) -> usize {
        self.workers - self.slots.available_permits()
    }

    /// Start the workers and the delivery loop over `messages`
    ///
    /// The returned handle completes once the delivery loop has exited, either
    /// because the feed ended or because `stop` flipped to `true`. Messages
    /// already buffered are still processed by the workers afterwards.
    pub fn spawn<S, M>(self: &Arc<Self>, messages: S, stop: watch::Receiver<bool>) -> JoinHandle<()>
    where
        S: Stream<Item = M> + Send + 'static,
        M: Delivery,
    {
        let (tx, rx) = mpsc::channel::<M>(self.capacity);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..self.workers {
            let pool = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move { pool.work(worker, rx).await });
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.deliver(messages, tx, stop).await })
    }

    async fn deliver<S, M>(&self, messages: S, tx: mpsc::Sender<M>, mut stop: watch::Receiver<bool>)
    where
        S: Stream<Item = M> + Send + 'static,
        M: Delivery,
    {
        let mut messages = Box::pin(messages);

        loop {
            let msg = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                next = messages.next() => match next {
                    Some(msg) => msg,
                    None => {
                        debug!(consumer = %self.name, "Message feed ended");
                        break;
                    }
                },
            };

            tokio::select! {
                biased;
                _ = stopped(&mut stop) => {
                    debug!(consumer = %self.name, "Stopped while waiting for buffer space, message discarded");
                    break;
                }
                sent = tx.send(msg) => {
                    if sent.is_err() {
                        warn!(consumer = %self.name, "All workers exited, stopping delivery");
                        break;
                    }
                }
            }
        }

        debug!(consumer = %self.name, "Delivery loop exited");
    }

    async fn work<M: Delivery>(&self, worker: usize, rx: Arc<Mutex<mpsc::Receiver<M>>>) {
        loop {
            let msg = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(msg) = msg else {
                break;
            };

            let Ok(_slot) = self.slots.acquire().await else {
                break;
            };
            self.process(msg).await;
        }

        debug!(consumer = %self.name, worker, "Worker exited");
    }

    /// Decode, handle and settle one message
    pub async fn process<M: Delivery>(&self, msg: M) -> ProcessOutcome {
        let parent = self
            .propagator
            .extract_with_context(&opentelemetry::Context::new(), &HeaderExtractor(msg.headers()));

        let span = info_span!(
            "process",
            otel.name = %self.subject,
            otel.kind = "consumer",
            otel.status_code = field::Empty,
            error.message = field::Empty,
            messaging.system = "nats",
            messaging.destination.name = %self.subject,
            consumer = %self.name,
            channel = %self.channel,
            event.id = field::Empty,
            "event.type" = field::Empty,
        );
        span.set_parent(parent);

        self.settle(&msg, &span).instrument(span.clone()).await
    }

    async fn settle<M: Delivery>(&self, msg: &M, span: &Span) -> ProcessOutcome {
        let event = match (self.builder)(msg.headers(), msg.payload()) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Failed to build event from message");
                mark_failed(span, &e);
                self.nak(msg, span).await;
                return ProcessOutcome::DecodeFailed;
            }
        };

        span.record("event.id", field::display(event.id()));
        span.record("event.type", event.kind());

        let handled = AssertUnwindSafe(self.handler.handle(event))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())))
            });

        if let Err(e) = handled {
            warn!(error = %format!("{e:#}"), "Failed to handle event");
            mark_failed(span, &format!("{e:#}"));
            self.nak(msg, span).await;
            return ProcessOutcome::HandlerFailed;
        }

        if let Err(e) = msg.ack().await {
            error!(error = %e, "Failed to acknowledge message");
            mark_failed(span, &e);
            return ProcessOutcome::AckFailed;
        }

        span.record("otel.status_code", "OK");
        ProcessOutcome::Acked
    }

    async fn nak<M: Delivery>(&self, msg: &M, span: &Span) {
        if let Err(e) = msg.nak().await {
            error!(error = %e, "Failed to negatively acknowledge message");
            span.record("error.message", field::display(&e));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

fn mark_failed(span: &Span, error: &dyn std::fmt::Display) {
    span.record("otel.status_code", "ERROR");
    span.record("error.message", field::display(error));
}

/// Resolves once the stop flag is set or its sender is gone
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
