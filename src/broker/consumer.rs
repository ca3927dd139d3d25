//! Shared consumer-group stage loop
//!
//! Every pipeline stage runs the same skeleton: bootstrap the consumer
//! group, read batches with a bounded block, hand each entry to the
//! stage handler, acknowledge on success, leave unacknowledged on
//! transient failure, and periodically reclaim entries left pending by
//! a crashed peer. Entries that exceed the delivery budget are diverted
//! to `<stream>.dlq` instead of being retried forever.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{dead_letter_stream, Broker, StreamEntry};
use crate::config::BrokerConfig;
use crate::stats::StageStats;
use crate::Result;

/// Maximum pending entries inspected per claim sweep.
const PENDING_SCAN_COUNT: usize = 100;

/// What to do with a delivered entry after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handling finished (or the entry is unusable); acknowledge it.
    Ack,
    /// Transient failure; leave pending for redelivery or claim.
    Retry,
}

/// Per-stage record processing logic.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Handle one delivered entry.
    ///
    /// Implementations classify their own failures: unusable records
    /// and permanent backend failures return [`Disposition::Ack`] (with
    /// a diagnostic), transient failures return [`Disposition::Retry`].
    /// An `Err` is treated as a local bug: logged and retried.
    async fn handle(&self, entry: &StreamEntry) -> Result<Disposition>;
}

/// Drives a [`StageHandler`] against one input stream.
pub struct StageWorker {
    broker: Arc<dyn Broker>,
    stream: String,
    group: String,
    consumer: String,
    config: BrokerConfig,
    stats: Arc<StageStats>,
    shutdown: watch::Receiver<bool>,
}

impl StageWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        config: BrokerConfig,
        stats: Arc<StageStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            config,
            stats,
            shutdown,
        }
    }

    /// Create the consumer group if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if the broker is unreachable; group bootstrap
    /// failure is a fatal startup condition.
    pub async fn bootstrap(&self) -> Result<()> {
        self.broker.ensure_group(&self.stream, &self.group).await
    }

    /// Run the live consumer loop until shutdown is signalled.
    ///
    /// # Errors
    ///
    /// Never returns an error from handling; broker errors are logged
    /// and retried after a short pause.
    pub async fn run(&self, handler: Arc<dyn StageHandler>) -> Result<()> {
        tracing::info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "consumer loop started"
        );

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                () = wait_for_shutdown(&mut shutdown) => break,
                read = self.broker.read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.config.read_count,
                    self.config.block.as_millis() as u64,
                ) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(stream = %self.stream, error = %e, "read_group failed");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            for entry in &entries {
                self.process_entry(handler.as_ref(), entry).await;
            }
        }

        tracing::info!(stream = %self.stream, consumer = %self.consumer, "consumer loop stopped");
        Ok(())
    }

    /// Run periodic stale-claim sweeps until shutdown is signalled.
    pub async fn run_claimer(&self, handler: Arc<dyn StageHandler>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                () = wait_for_shutdown(&mut shutdown) => break,
                () = tokio::time::sleep(self.config.claim_interval) => {}
            }

            if let Err(e) = self.claim_stale(handler.as_ref()).await {
                tracing::error!(stream = %self.stream, error = %e, "stale claim sweep failed");
            }
        }
    }

    /// One stale-claim sweep: reclaim entries idle past the threshold,
    /// dead-letter those over the delivery budget, reprocess the rest.
    ///
    /// # Errors
    ///
    /// Returns error if the pending listing itself fails.
    pub async fn claim_stale(&self, handler: &dyn StageHandler) -> Result<()> {
        let stale_ms = self.config.stale_idle.as_millis() as u64;
        let pending = self
            .broker
            .pending(&self.stream, &self.group, PENDING_SCAN_COUNT)
            .await?;

        let stale: Vec<_> = pending
            .into_iter()
            .filter(|p| p.idle_ms >= stale_ms)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        tracing::info!(
            stream = %self.stream,
            count = stale.len(),
            idle_ms = stale_ms,
            "claiming stale entries"
        );

        let (exhausted, retryable): (Vec<_>, Vec<_>) = stale
            .into_iter()
            .partition(|p| p.deliveries >= self.config.max_deliveries);

        // Over-budget entries are claimed only to be diverted and acked.
        for p in exhausted {
            let claimed = self
                .broker
                .claim(&self.stream, &self.group, &self.consumer, stale_ms, &[p.id.clone()])
                .await?;
            for entry in claimed {
                self.dead_letter(&entry, p.deliveries).await?;
            }
        }

        let ids: Vec<String> = retryable.iter().map(|p| p.id.clone()).collect();
        let claimed = self
            .broker
            .claim(&self.stream, &self.group, &self.consumer, stale_ms, &ids)
            .await?;
        self.stats.record_claimed(claimed.len() as u64);

        for entry in &claimed {
            tracing::info!(stream = %self.stream, id = %entry.id, "reprocessing claimed entry");
            self.process_entry(handler, entry).await;
        }

        Ok(())
    }

    async fn process_entry(&self, handler: &dyn StageHandler, entry: &StreamEntry) {
        self.stats.record_consumed();

        let disposition = match handler.handle(entry).await {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(
                    stream = %self.stream,
                    id = %entry.id,
                    error = %e,
                    "handler failed; leaving entry pending"
                );
                self.stats.record_handler_error();
                Disposition::Retry
            }
        };

        match disposition {
            Disposition::Ack => {
                if let Err(e) = self.broker.ack(&self.stream, &self.group, &entry.id).await {
                    tracing::error!(stream = %self.stream, id = %entry.id, error = %e, "ack failed");
                } else {
                    self.stats.record_acked();
                }
            }
            Disposition::Retry => {
                self.stats.record_retried();
            }
        }
    }

    async fn dead_letter(&self, entry: &StreamEntry, deliveries: u64) -> Result<()> {
        let dlq = dead_letter_stream(&self.stream);
        tracing::warn!(
            stream = %self.stream,
            id = %entry.id,
            deliveries,
            dlq = %dlq,
            "delivery budget exhausted, dead-lettering"
        );

        let mut fields: Vec<(String, String)> = entry
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.push(("dlq_source_id".to_string(), entry.id.clone()));
        fields.push(("dlq_source_stream".to_string(), self.stream.clone()));
        fields.push(("dlq_deliveries".to_string(), deliveries.to_string()));
        fields.push((
            "dlq_reason".to_string(),
            "max deliveries exceeded".to_string(),
        ));

        self.broker.append(&dlq, &fields).await?;
        self.broker.ack(&self.stream, &self.group, &entry.id).await?;
        self.stats.record_dead_lettered();

        Ok(())
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A closed channel means the sender is gone; treat as shutdown.
    while shutdown.changed().await.is_ok() {
        if *shutdown.borrow() {
            return;
        }
    }
}
