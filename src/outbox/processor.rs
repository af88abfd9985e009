// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox processor
//!
//! Runs one pass at startup, then one per change notification and one per
//! fallback tick until shutdown. Each pass works inside a single outbox
//! transaction and handles every row on its own: a row that fails to decode
//! or publish stays unpublished without holding up the others, and the
//! transaction commits at the end of the pass regardless.
//!
//! A row that was published but could not be marked ends the pass early.
//! The remaining rows are deferred to the next pass rather than published
//! while the outbox cannot record them.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use super::{ChangeFeed, EventRegistry, OutboxSettings, OutboxStore, PassReport};
use crate::consumer::pool::stopped;
use crate::errors::OutboxResult;
use crate::producer::Publish;
use crate::propagation::record_status;

/// Relays committed outbox rows to a producer
pub struct OutboxProcessor {
    name: String,
    store: Arc<dyn OutboxStore>,
    registry: EventRegistry,
    publisher: Arc<dyn Publish>,
    feed: Option<Arc<dyn ChangeFeed>>,
    settings: OutboxSettings,
}

impl OutboxProcessor {
    /// Create a processor driven by the fallback ticker only
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn OutboxStore>,
        registry: EventRegistry,
        publisher: Arc<dyn Publish>,
        settings: OutboxSettings,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            registry,
            publisher,
            feed: None,
            settings,
        }
    }

    /// Also run a pass whenever the feed reports new rows
    pub fn with_change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &OutboxSettings {
        &self.settings
    }

    /// Process the outbox until `shutdown` flips to `true`
    ///
    /// Fails only if the change feed cannot be opened. Failed passes are
    /// logged and retried on the next wake-up.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> OutboxResult<()> {
        let mut notifications: BoxStream<'static, ()> = match &self.feed {
            Some(feed) => feed.subscribe().await?,
            None => stream::pending().boxed(),
        };

        info!(
            processor = %self.name,
            table = %self.settings.table,
            channel = %self.settings.notify_channel,
            interval = ?self.settings.interval,
            "Outbox processor started"
        );

        self.run_pass("startup").await;

        let period = self.settings.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                next = notifications.next() => match next {
                    Some(()) => self.run_pass("notification").await,
                    None => {
                        warn!(processor = %self.name, "Outbox notification feed ended, relying on the ticker");
                        notifications = stream::pending().boxed();
                    }
                },
                _ = ticker.tick() => self.run_pass("tick").await,
            }
        }

        info!(processor = %self.name, "Outbox processor stopped");
        Ok(())
    }

    async fn run_pass(&self, trigger: &'static str) {
        match self.process().await {
            Ok(report) if report.fetched > 0 => {
                info!(
                    processor = %self.name,
                    trigger,
                    fetched = report.fetched,
                    published = report.published,
                    failed = report.failed,
                    undecodable = report.undecodable,
                    published_but_not_marked = report.published_but_not_marked,
                    deferred = report.deferred,
                    "Outbox pass completed"
                );
            }
            Ok(_) => debug!(processor = %self.name, trigger, "Outbox empty"),
            Err(e) => error!(processor = %self.name, trigger, error = %e, "Outbox pass failed"),
        }
    }

    /// Run one pass over at most `batch_size` unpublished rows
    ///
    /// Returns an error only when the transaction cannot be opened, read or
    /// committed; per-row failures are counted in the report. The first row
    /// that cannot be marked stops the pass and the rows after it are left
    /// for the next one.
    pub async fn process(&self) -> OutboxResult<PassReport> {
        let span = info_span!(
            "outbox.process",
            otel.name = %format!("{}.outbox.process", self.name),
            otel.kind = "internal",
            otel.status_code = field::Empty,
            error.message = field::Empty,
            processor = %self.name,
            outbox.table = %self.settings.table,
            outbox.events_count = field::Empty,
            outbox.published_count = field::Empty,
            outbox.failed_count = field::Empty,
            outbox.undecodable_count = field::Empty,
            outbox.published_not_marked_count = field::Empty,
            outbox.deferred_count = field::Empty,
        );

        let result = self.pass().instrument(span.clone()).await;
        if let Ok(report) = &result {
            record_report(&span, report);
        }
        record_status(&span, &result);
        result
    }

    async fn pass(&self) -> OutboxResult<PassReport> {
        let mut batch = self.store.begin().await?;
        let records = batch.fetch_unpublished(self.settings.batch_size).await?;

        let mut report = PassReport {
            fetched: records.len(),
            ..Default::default()
        };

        for (position, record) in records.into_iter().enumerate() {
            let event = match self.registry.decode(
                &record.event_type,
                &record.event_id,
                record.payload,
            ) {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        event.id = %record.event_id,
                        "event.type" = %record.event_type,
                        error = %e,
                        "Failed to decode outbox event"
                    );
                    report.undecodable += 1;
                    continue;
                }
            };

            if let Err(e) = self.publisher.publish(event.as_ref()).await {
                warn!(
                    event.id = %record.event_id,
                    "event.type" = %record.event_type,
                    error = %e,
                    "Failed to publish outbox event"
                );
                report.failed += 1;
                continue;
            }

            if let Err(e) = batch.mark_published(&record.event_id).await {
                warn!(
                    event.id = %record.event_id,
                    "event.type" = %record.event_type,
                    error = %e,
                    "Outbox event published but not marked, it will be published again"
                );
                report.published_but_not_marked += 1;
                report.deferred = report.fetched - position - 1;
                break;
            }

            report.published += 1;
        }

        batch.commit().await?;
        Ok(report)
    }
}

fn record_report(span: &Span, report: &PassReport) {
    span.record("outbox.events_count", report.fetched);
    span.record("outbox.published_count", report.published);
    span.record("outbox.failed_count", report.failed);
    span.record("outbox.undecodable_count", report.undecodable);
    span.record("outbox.published_not_marked_count", report.published_but_not_marked);
    span.record("outbox.deferred_count", report.deferred);
}
