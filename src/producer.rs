// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event producer
//!
//! A producer owns one durable topic (a JetStream stream named after its
//! channel) and publishes events to it:
//! - Subject is the event type, e.g. `storage.file.uploaded`
//! - Body is the protobuf payload
//! - `Event-ID`, `Event-Type` and `Content-Type` headers plus the injected
//!   trace context
//! - Publishes are synchronous: [`Publish::publish`] returns once the broker
//!   has acknowledged durable storage
//!
//! The producer never retries. The outbox processor retries on its next pass,
//! direct callers decide for themselves.

use async_nats::{jetstream, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::propagation::TextMapPropagator;
use tracing::{debug, field, info, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::errors::{ProducerError, ProducerResult};
use crate::events::{
    EventSpec, CONTENT_TYPE_HEADER, EVENT_ID_HEADER, EVENT_TYPE_HEADER, PROTOBUF_CONTENT_TYPE,
};
use crate::jetstream::TopicSettings;
use crate::propagation::{default_propagator, record_status, HeaderInjector, Propagator};

/// Anything events can be published through
#[async_trait]
pub trait Publish: Send + Sync {
    /// Publish one event and wait for the broker acknowledgment
    async fn publish(&self, event: &dyn EventSpec) -> ProducerResult<()>;
}

/// Build the headers of an outgoing event message
pub fn message_headers(
    event: &dyn EventSpec,
    cx: &opentelemetry::Context,
    propagator: &dyn TextMapPropagator,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(EVENT_ID_HEADER, event.id().to_string().as_str());
    headers.insert(EVENT_TYPE_HEADER, event.kind());
    headers.insert(CONTENT_TYPE_HEADER, PROTOBUF_CONTENT_TYPE);

    propagator.inject_context(cx, &mut HeaderInjector(&mut headers));

    headers
}

/// JetStream-backed producer for one channel
pub struct EventProducer {
    name: String,
    topic: TopicSettings,
    jetstream: jetstream::Context,
    propagator: Propagator,
}

impl EventProducer {
    /// Create a producer using the W3C trace context propagator
    pub fn new(name: impl Into<String>, jetstream: jetstream::Context, topic: TopicSettings) -> Self {
        Self {
            name: name.into(),
            topic,
            jetstream,
            propagator: default_propagator(),
        }
    }

    /// Replace the trace propagator
    pub fn with_propagator(mut self, propagator: Propagator) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &str {
        &self.topic.channel
    }

    pub fn topic(&self) -> &TopicSettings {
        &self.topic
    }

    /// Create the durable topic, or update it to the current settings
    ///
    /// Idempotent, meant to run on every process start. Errors are returned
    /// as-is and should abort startup.
    pub async fn ensure_topic(&self) -> ProducerResult<()> {
        let span = info_span!(
            "ensure_topic",
            otel.name = %format!("{}.init", self.topic.channel),
            otel.kind = "producer",
            otel.status_code = field::Empty,
            error.message = field::Empty,
            messaging.system = "nats",
            messaging.destination.name = %self.topic.channel,
            nats.retention_period = ?self.topic.max_age,
            producer = %self.name,
        );

        let result = self.create_or_update_topic().instrument(span.clone()).await;
        record_status(&span, &result);
        result
    }

    async fn create_or_update_topic(&self) -> ProducerResult<()> {
        let config = self.topic.stream_config();
        let topic = config.name.clone();

        let result = if self.jetstream.get_stream(&topic).await.is_ok() {
            self.jetstream
                .update_stream(&config)
                .await
                .map(|_| ())
                .map_err(async_nats::Error::from)
        } else {
            self.jetstream
                .create_stream(config)
                .await
                .map(|_| ())
                .map_err(async_nats::Error::from)
        };

        result.map_err(|source| ProducerError::Topic {
            topic: topic.clone(),
            source,
        })?;

        info!(topic = %topic, channel = %self.topic.channel, "Topic created or updated");
        Ok(())
    }

    async fn send(&self, event: &dyn EventSpec, cx: opentelemetry::Context) -> ProducerResult<()> {
        let subject = event.kind().to_string();
        let headers = message_headers(event, &cx, self.propagator.as_ref());
        let payload = Bytes::from(event.encode_payload());

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload)
            .await
            .map_err(|e| ProducerError::Publish {
                subject: subject.clone(),
                source: e.into(),
            })?
            .await
            .map_err(|e| ProducerError::Publish {
                subject: subject.clone(),
                source: e.into(),
            })?;

        debug!(
            subject = %subject,
            stream = %ack.stream,
            stream_sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Event published"
        );

        Ok(())
    }
}

#[async_trait]
impl Publish for EventProducer {
    async fn publish(&self, event: &dyn EventSpec) -> ProducerResult<()> {
        let span = info_span!(
            "publish",
            otel.name = %event.kind(),
            otel.kind = "producer",
            otel.status_code = field::Empty,
            error.message = field::Empty,
            messaging.system = "nats",
            messaging.destination.name = %event.kind(),
            producer = %self.name,
            channel = %self.topic.channel,
            event.id = %event.id(),
            "event.type" = %event.kind(),
        );

        let cx = span.context();
        let result = self.send(event, cx).instrument(span.clone()).await;
        record_status(&span, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, FileUploaded};
    use crate::propagation::HeaderExtractor;
    use opentelemetry::propagation::Extractor;
    use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};

    fn event() -> Event<FileUploaded> {
        Event::new(FileUploaded {
            file_key: "abc".to_string(),
            file_name: "a.pdf".to_string(),
            bucket_name: "files".to_string(),
        })
    }

    #[test]
    fn test_message_headers_carry_identity() {
        let event = event();
        let propagator = default_propagator();

        let headers = message_headers(&event, &opentelemetry::Context::new(), propagator.as_ref());
        let extractor = HeaderExtractor(Some(&headers));

        assert_eq!(extractor.get(EVENT_ID_HEADER), Some(event.id().to_string().as_str()));
        assert_eq!(extractor.get(EVENT_TYPE_HEADER), Some("storage.file.uploaded"));
        assert_eq!(extractor.get(CONTENT_TYPE_HEADER), Some(PROTOBUF_CONTENT_TYPE));
        assert_eq!(extractor.get("traceparent"), None);
    }

    #[test]
    fn test_message_headers_inject_trace_context() {
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let cx = opentelemetry::Context::new().with_remote_span_context(span_context);

        let headers = message_headers(&event(), &cx, default_propagator().as_ref());

        assert!(HeaderExtractor(Some(&headers)).get("traceparent").is_some());
    }
}
