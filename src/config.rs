//! Process configuration loaded from `APP_*` environment variables

use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::nats::NatsConfig;
use crate::outbox::{OutboxSettings, DEFAULT_OUTBOX_TABLE, STORAGE_OUTBOX_CHANNEL};

/// PostgreSQL connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub uri: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            uri: "postgres://localhost:5432/ocr".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub postgres: PostgresConfig,
    pub outbox: OutboxSettings,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig::default(),
            postgres: PostgresConfig::default(),
            outbox: OutboxSettings::storage(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let mut nats = defaults.nats;
        if let Some(uri) = lookup("APP_NATS_URI") {
            nats.servers = uri.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(name) = lookup("APP_NATS_NAME") {
            nats.name = name;
        }

        let postgres = PostgresConfig {
            uri: lookup("APP_POSTGRES_URI").unwrap_or(defaults.postgres.uri),
            max_connections: parse(&lookup, "APP_POSTGRES_MAX_CONNECTIONS")?
                .unwrap_or(defaults.postgres.max_connections),
        };

        let mut outbox = OutboxSettings::new(
            lookup("APP_OUTBOX_TABLE").unwrap_or_else(|| DEFAULT_OUTBOX_TABLE.to_string()),
            lookup("APP_OUTBOX_CHANNEL").unwrap_or_else(|| STORAGE_OUTBOX_CHANNEL.to_string()),
        );
        if let Some(batch_size) = parse(&lookup, "APP_OUTBOX_BATCH_SIZE")? {
            outbox = outbox.with_batch_size(batch_size);
        }
        if let Some(secs) = parse(&lookup, "APP_OUTBOX_INTERVAL_SECS")? {
            outbox = outbox.with_interval(Duration::from_secs(secs));
        }

        Ok(Self {
            nats,
            postgres,
            outbox,
            log_level: lookup("APP_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{key} must be a number, got {raw:?}"))
        })
        .transpose()
}
