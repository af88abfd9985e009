// Copyright (c) 2025 - Cowboy AI, Inc.
//! PostgreSQL outbox
//!
//! Rows are claimed with `FOR UPDATE SKIP LOCKED`, so a second processor on
//! the same table skips rows held by an open pass instead of publishing them
//! twice. New rows are announced with `pg_notify` on the writer's
//! transaction, which delivers the notification only on commit.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use super::{ChangeFeed, OutboxBatch, OutboxRecord, OutboxSettings, OutboxStore};
use crate::errors::{OutboxError, OutboxResult};
use crate::events::{Event, Payload};

/// Table and channel names are spliced into SQL, so only plain identifiers
/// are accepted
fn validate_identifier(kind: &str, name: &str) -> OutboxResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;

    if valid {
        Ok(())
    } else {
        Err(OutboxError::Configuration(format!(
            "invalid {kind} name {name:?}"
        )))
    }
}

/// Write an outbox row on the caller's transaction and announce it
///
/// Must run on the same connection as the domain mutation it records; the
/// row and the notification become visible only if that transaction commits.
pub async fn record_outbox_event<P: Payload>(
    conn: &mut PgConnection,
    settings: &OutboxSettings,
    event: &Event<P>,
) -> OutboxResult<()> {
    validate_identifier("table", &settings.table)?;

    let event_id = event.id().to_string();
    let payload = event.payload_json()?;

    let insert = format!(
        "INSERT INTO {} (event_id, event_type, payload) VALUES ($1, $2, $3)",
        settings.table
    );
    sqlx::query(&insert)
        .bind(&event_id)
        .bind(event.kind())
        .bind(&payload)
        .execute(&mut *conn)
        .await?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(&settings.notify_channel)
        .bind(&event_id)
        .execute(&mut *conn)
        .await?;

    debug!(event_id = %event_id, "event.type" = event.kind(), "Outbox event recorded");
    Ok(())
}

/// Outbox table in a PostgreSQL database
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    table: String,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> OutboxResult<Self> {
        let table = table.into();
        validate_identifier("table", &table)?;
        Ok(Self { pool, table })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the outbox table and its index if they do not exist
    pub async fn ensure_schema(&self) -> OutboxResult<()> {
        let table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                published BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.table
        );
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {0}_unpublished_idx ON {0} (created_at, event_id) WHERE NOT published",
            self.table
        );

        sqlx::query(&table).execute(&self.pool).await?;
        sqlx::query(&index).execute(&self.pool).await?;

        info!(table = %self.table, "Outbox schema ensured");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn begin(&self) -> OutboxResult<Box<dyn OutboxBatch>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgOutboxBatch {
            tx,
            table: self.table.clone(),
        }))
    }
}

struct PgOutboxBatch {
    tx: Transaction<'static, Postgres>,
    table: String,
}

#[async_trait]
impl OutboxBatch for PgOutboxBatch {
    async fn fetch_unpublished(&mut self, limit: i64) -> OutboxResult<Vec<OutboxRecord>> {
        let sql = format!(
            "SELECT event_id, event_type, payload, published, created_at
             FROM {}
             WHERE NOT published
             ORDER BY created_at, event_id
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
            self.table
        );

        let records = sqlx::query_as::<_, OutboxRecord>(&sql)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(records)
    }

    async fn mark_published(&mut self, event_id: &str) -> OutboxResult<()> {
        let sql = format!(
            "UPDATE {} SET published = TRUE WHERE event_id = $1",
            self.table
        );

        // a failed statement aborts the whole transaction unless it runs
        // inside a savepoint; dropping the savepoint rolls back to it
        let mut savepoint = sqlx::Connection::begin(&mut *self.tx).await?;
        sqlx::query(&sql)
            .bind(event_id)
            .execute(&mut *savepoint)
            .await?;
        savepoint.commit().await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> OutboxResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// LISTEN/NOTIFY feed on a dedicated connection
#[derive(Debug, Clone)]
pub struct PgChangeFeed {
    pool: PgPool,
    channel: String,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self) -> OutboxResult<BoxStream<'static, ()>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| OutboxError::ChangeFeed(format!("failed to connect listener: {e}")))?;

        listener.listen(&self.channel).await.map_err(|e| {
            OutboxError::ChangeFeed(format!("failed to listen on {}: {e}", self.channel))
        })?;

        info!(channel = %self.channel, "Listening for outbox notifications");

        let channel = self.channel.clone();
        let notifications = listener.into_stream().filter_map(move |notification| {
            let channel = channel.clone();
            async move {
                match notification {
                    Ok(_) => Some(()),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Outbox notification error");
                        None
                    }
                }
            }
        });

        Ok(notifications.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("outbox" ; "plain")]
    #[test_case("storage_outbox" ; "underscored")]
    #[test_case("_outbox2" ; "leading underscore")]
    fn test_valid_identifiers(name: &str) {
        assert!(validate_identifier("table", name).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("1outbox" ; "leading digit")]
    #[test_case("outbox; DROP TABLE files" ; "injection")]
    #[test_case("public.outbox" ; "qualified")]
    fn test_invalid_identifiers(name: &str) {
        let err = validate_identifier("table", name).unwrap_err();
        assert!(matches!(err, OutboxError::Configuration(_)));
    }
}
