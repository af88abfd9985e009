// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Envelope
//!
//! Every fact that crosses the broker is an [`Event`]: a ULID, a dotted type
//! tag and a protobuf payload. Events are immutable once constructed.
//!
//! # Construction paths
//!
//! - **Fresh**: [`Event::new`] mints a new time-ordered id for a fact produced
//!   by local business logic.
//! - **From wire**: [`Event::from_message`] reads the id from the `Event-ID`
//!   header and decodes the protobuf body.
//! - **From outbox**: [`Event::from_json`] rebuilds an event from a stored row.
//!
//! # Wire shape
//!
//! ```text
//! headers:
//!   Event-ID:     01ARZ3NDEKTSV4RRFFQ69G5FAV
//!   Event-Type:   storage.file.uploaded
//!   Content-Type: application/protobuf
//!   traceparent:  00-...            (injected by the producer)
//! body:           protobuf-encoded payload
//! ```
//!
//! # Module Organization
//!
//! - [`storage`] - events published by the storage service
//! - [`ocr`] - events published by the OCR service

use async_nats::HeaderMap;
use serde::{de::DeserializeOwned, Serialize};
use ulid::Ulid;

use crate::errors::{DecodeError, DecodeResult};

pub mod ocr;
pub mod storage;

pub use ocr::{FilePageOcrGenerated, FilePageRegistered, FilePageRendered, FilePagesDeleted};
pub use storage::{FileUploaded, FilesDeleted};

/// Header carrying the event id
pub const EVENT_ID_HEADER: &str = "Event-ID";

/// Header carrying the event type
pub const EVENT_TYPE_HEADER: &str = "Event-Type";

/// Header carrying the body encoding
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Content type of every event body
pub const PROTOBUF_CONTENT_TYPE: &str = "application/protobuf";

/// Mint a new time-sortable event id
pub fn new_event_id() -> Ulid {
    Ulid::new()
}

/// A typed event payload
///
/// Payloads are protobuf messages on the wire and JSON documents in the
/// outbox table. `KIND` is the dotted event type and doubles as the NATS
/// subject the event is published to.
pub trait Payload:
    prost::Message + Default + Clone + Serialize + DeserializeOwned + 'static
{
    /// Dotted event type, e.g. `storage.file.uploaded`
    const KIND: &'static str;
}

/// Object-safe view of an event, used wherever events of different kinds
/// travel together (producers, the outbox registry)
pub trait EventSpec: Send + Sync {
    /// Unique, time-sortable identifier
    fn id(&self) -> Ulid;

    /// Dotted event type
    fn kind(&self) -> &str;

    /// Protobuf encoding of the payload
    fn encode_payload(&self) -> Vec<u8>;
}

/// Event envelope around a typed payload
#[derive(Debug, Clone, PartialEq)]
pub struct Event<P> {
    id: Ulid,
    payload: P,
}

impl<P: Payload> Event<P> {
    /// Create a fresh event with a newly minted id
    pub fn new(payload: P) -> Self {
        Self {
            id: new_event_id(),
            payload,
        }
    }

    /// Create an event with a known id
    pub fn with_id(id: Ulid, payload: P) -> Self {
        Self { id, payload }
    }

    /// Rebuild an event from a received message
    ///
    /// Fails when the `Event-ID` header is missing or not a ULID, or when the
    /// body is not a valid protobuf encoding of `P`.
    pub fn from_message(headers: Option<&HeaderMap>, data: &[u8]) -> DecodeResult<Self> {
        let raw_id = headers
            .and_then(|headers| headers.get(EVENT_ID_HEADER))
            .map(|value| value.as_str())
            .ok_or(DecodeError::MissingHeader(EVENT_ID_HEADER))?;

        let id = Ulid::from_string(raw_id).map_err(|source| DecodeError::InvalidId {
            value: raw_id.to_string(),
            source,
        })?;

        let payload = P::decode(data)?;

        Ok(Self { id, payload })
    }

    /// Rebuild an event from its outbox representation
    pub fn from_json(id: Ulid, value: serde_json::Value) -> DecodeResult<Self> {
        let payload = serde_json::from_value(value)?;
        Ok(Self { id, payload })
    }

    /// JSON representation of the payload, as stored in the outbox
    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&self.payload)
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        P::KIND
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<P: Payload> EventSpec for Event<P> {
    fn id(&self) -> Ulid {
        self.id
    }

    fn kind(&self) -> &str {
        P::KIND
    }

    fn encode_payload(&self) -> Vec<u8> {
        self.payload.encode_to_vec()
    }
}
