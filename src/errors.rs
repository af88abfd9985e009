//! Error types for the eventing core

use thiserror::Error;

/// Errors raised while turning wire data or outbox rows back into events
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The `Event-ID` header is absent
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    /// The `Event-ID` header is not a valid ULID
    #[error("invalid event id {value:?}: {source}")]
    InvalidId {
        value: String,
        #[source]
        source: ulid::DecodeError,
    },

    /// The protobuf body could not be decoded
    #[error("failed to decode protobuf payload: {0}")]
    Protobuf(#[from] prost::DecodeError),

    /// The JSON outbox payload could not be decoded
    #[error("failed to decode json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// No decoder is registered for the event kind
    #[error("unknown event type: {0}")]
    UnknownKind(String),
}

/// Result type for decoding
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors raised while establishing the broker connection
#[derive(Debug, Error)]
pub enum NatsError {
    /// The broker could not be reached
    #[error("failed to connect to NATS at {servers}: {source}")]
    Connect {
        servers: String,
        #[source]
        source: async_nats::Error,
    },
}

/// Result type for connection setup
pub type NatsResult<T> = Result<T, NatsError>;

/// Errors raised by a producer
#[derive(Debug, Error)]
pub enum ProducerError {
    /// The durable topic could not be created or updated
    #[error("failed to create or update topic {topic}: {source}")]
    Topic {
        topic: String,
        #[source]
        source: async_nats::Error,
    },

    /// The broker rejected the message or never acknowledged it
    #[error("failed to publish {subject}: {source}")]
    Publish {
        subject: String,
        #[source]
        source: async_nats::Error,
    },
}

/// Result type for producer operations
pub type ProducerResult<T> = Result<T, ProducerError>;

/// Errors raised while subscribing a consumer
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The topic does not exist or could not be looked up
    #[error("failed to get topic {topic}: {source}")]
    Topic {
        topic: String,
        #[source]
        source: async_nats::Error,
    },

    /// The durable consumer could not be created or updated
    #[error("failed to create or update consumer {name}: {source}")]
    Durable {
        name: String,
        #[source]
        source: async_nats::Error,
    },

    /// The message feed could not be opened
    #[error("failed to open message stream for {name}: {source}")]
    Messages {
        name: String,
        #[source]
        source: async_nats::Error,
    },

    /// Subscribe was called on a consumer that is not in the `Created` state
    #[error("consumer {name} cannot subscribe while {state}")]
    InvalidState { name: String, state: String },
}

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors raised by the outbox store and processor
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Database failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Outbox payload could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The change notification feed could not be opened
    #[error("change feed error: {0}")]
    ChangeFeed(String),

    /// Rejected configuration value
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type for outbox operations
pub type OutboxResult<T> = Result<T, OutboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_messages() {
        let err = DecodeError::MissingHeader("Event-ID");
        assert_eq!(err.to_string(), "missing Event-ID header");

        let err = DecodeError::UnknownKind("storage.file.renamed".to_string());
        assert_eq!(err.to_string(), "unknown event type: storage.file.renamed");
    }

    #[test]
    fn test_connect_error_message() {
        let err = NatsError::Connect {
            servers: "nats://a:4222,nats://b:4222".to_string(),
            source: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to NATS at nats://a:4222,nats://b:4222: connection refused"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = ConsumerError::InvalidState {
            name: "tgbot_file_uploaded_consumer".to_string(),
            state: "stopped".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "consumer tgbot_file_uploaded_consumer cannot subscribe while stopped"
        );
    }
}
