//! NATS connection shared by every producer and consumer in a process

use async_nats::{jetstream, Client, ConnectOptions};
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::{NatsError, NatsResult};

/// Configuration for NATS connection
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs
    pub servers: Vec<String>,
    /// Client name
    pub name: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout, also bounds how long a publish waits for its ack
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "ocr-pipeline".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide NATS client
///
/// The underlying client is cheap to clone and safe for concurrent publish
/// and subscribe calls.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect with the given configuration
    pub async fn connect(config: &NatsConfig) -> NatsResult<Self> {
        let connect_options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout));

        let servers = config.servers.join(",");
        let client = async_nats::connect_with_options(servers.as_str(), connect_options)
            .await
            .map_err(|e| NatsError::Connect {
                servers: servers.clone(),
                source: e.into(),
            })?;

        info!(servers = ?config.servers, "Connected to NATS");

        Ok(Self { client })
    }

    /// JetStream context over this connection
    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }

    /// Get the underlying NATS client for advanced operations
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Flush pending publishes before shutdown
    pub async fn flush(&self) {
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nats_config_default() {
        let config = NatsConfig::default();

        assert_eq!(config.servers, vec!["nats://localhost:4222"]);
        assert_eq!(config.name, "ocr-pipeline");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }
}
