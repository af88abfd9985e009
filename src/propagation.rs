// Copyright (c) 2025 - Cowboy AI, Inc.
//! Trace context carriers over NATS headers
//!
//! Producers inject the current trace context into outgoing headers and
//! consumers extract it again, so one trace follows an event across services.
//! The propagator is always handed in explicitly.

use async_nats::HeaderMap;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::fmt::Display;
use std::sync::Arc;
use tracing::Span;

/// Shared propagator handle
pub type Propagator = Arc<dyn TextMapPropagator + Send + Sync>;

/// W3C trace context propagator
pub fn default_propagator() -> Propagator {
    Arc::new(TraceContextPropagator::new())
}

/// Writes propagation fields into outgoing headers
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value.as_str());
    }
}

/// Reads propagation fields from received headers
pub struct HeaderExtractor<'a>(pub Option<&'a HeaderMap>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .and_then(|headers| headers.get(key))
            .map(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .map(|headers| {
                headers
                    .iter()
                    .map(|(name, _)| AsRef::<str>::as_ref(name))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Mark a span with the outcome of the operation it covers
pub(crate) fn record_status<T, E: Display>(span: &Span, result: &Result<T, E>) {
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(e) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", tracing::field::display(e));
        }
    }
}
