//! Closed set of event kinds an outbox may contain

use std::collections::HashMap;
use ulid::Ulid;

use crate::errors::{DecodeError, DecodeResult};
use crate::events::{
    Event, EventSpec, FilePageOcrGenerated, FilePageRegistered, FilePageRendered,
    FilePagesDeleted, FileUploaded, FilesDeleted, Payload,
};

type Decoder = fn(Ulid, serde_json::Value) -> DecodeResult<Box<dyn EventSpec>>;

fn decode_as<P: Payload>(id: Ulid, payload: serde_json::Value) -> DecodeResult<Box<dyn EventSpec>> {
    Ok(Box::new(Event::<P>::from_json(id, payload)?))
}

/// Maps event types to decoders of their JSON outbox payload
#[derive(Clone, Default)]
pub struct EventRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kinds written by the storage service
    pub fn storage() -> Self {
        Self::new()
            .register::<FileUploaded>()
            .register::<FilesDeleted>()
    }

    /// Kinds written by the OCR service
    pub fn ocr() -> Self {
        Self::new()
            .register::<FilePageRendered>()
            .register::<FilePageRegistered>()
            .register::<FilePagesDeleted>()
            .register::<FilePageOcrGenerated>()
    }

    pub fn register<P: Payload>(mut self) -> Self {
        self.decoders.insert(P::KIND, decode_as::<P>);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.decoders.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Rebuild an event from an outbox row's type, id and payload
    pub fn decode(
        &self,
        kind: &str,
        id: &str,
        payload: serde_json::Value,
    ) -> DecodeResult<Box<dyn EventSpec>> {
        let decoder = self
            .decoders
            .get(kind)
            .ok_or_else(|| DecodeError::UnknownKind(kind.to_string()))?;

        let id = Ulid::from_string(id).map_err(|source| DecodeError::InvalidId {
            value: id.to_string(),
            source,
        })?;

        decoder(id, payload)
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
