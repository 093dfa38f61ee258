//! Counter consolidation
//!
//! Requests are counted in the fast [`CounterCache`] under one key per
//! (request type, day). Flushing moves those counts into durable
//! [`AggregateStore`] records.
//!
//! A flush reads the counter, then drains exactly the observed amount with an
//! atomic decrement. A negative result means another flusher claimed part of
//! the same amount first: the drain is undone and nothing is written, and the
//! next flush picks up the corrected total. Only a drain that leaves the
//! counter non-negative owns its units and may add them to the aggregate.

pub mod scheduler;

use crate::aggregate::{AggregateStore, InsertOutcome};
use crate::cache::CounterCache;
use crate::core::clock::Clock;
use crate::core::error::{Result, TallyError};
use crate::core::types::{RecordId, RequestType, counter_key};
use crate::metrics;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many times creating an aggregate record is retried after losing the
/// unique-index race
pub const MAX_UPSERT_RETRIES: usize = 1;

/// Configuration for the consolidator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidatorConfig {
    /// Prepended to every counter key
    pub key_prefix: String,
    /// Counter value at which an increment flushes synchronously, `<= 0` disables
    pub autoflush_threshold: i64,
    /// Expiry refreshed on every increment
    pub counter_ttl_secs: u64,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            key_prefix: "app_req_".to_string(),
            autoflush_threshold: 100,
            counter_ttl_secs: 3 * 24 * 60 * 60,
        }
    }
}

/// Per-call overrides for [`Consolidator::record_event`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordOptions {
    pub autoflush: Option<i64>,
}

impl RecordOptions {
    pub fn with_autoflush(threshold: i64) -> Self {
        Self {
            autoflush: Some(threshold),
        }
    }
}

/// What a single counter flush did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending
    Empty,
    /// A concurrent drain got there first; the counter was restored
    RaceLost { observed: i64 },
    Committed { record_id: RecordId, amount: u64 },
}

impl FlushOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::RaceLost { .. } => "race_lost",
            Self::Committed { .. } => "committed",
        }
    }

    pub fn committed_amount(&self) -> u64 {
        match self {
            Self::Committed { amount, .. } => *amount,
            _ => 0,
        }
    }
}

/// Outcome of one flushed counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFlush {
    pub date: NaiveDate,
    pub request_type: RequestType,
    pub outcome: FlushOutcome,
}

/// Result of [`Consolidator::flush_all`]
#[derive(Debug, Clone, Default)]
pub struct FlushSummary {
    pub flushes: Vec<KeyFlush>,
}

impl FlushSummary {
    /// Units moved into aggregate records
    pub fn committed_units(&self) -> u64 {
        self.flushes.iter().map(|f| f.outcome.committed_amount()).sum()
    }

    pub fn races_lost(&self) -> usize {
        self.flushes
            .iter()
            .filter(|f| matches!(f.outcome, FlushOutcome::RaceLost { .. }))
            .count()
    }
}

/// One step of resolving the aggregate record for a (date, type) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Found(RecordId),
    Created(RecordId),
    /// A concurrent creator won the unique-index race
    Conflict,
}

/// Dates flushed or cleared when the caller names none: today, then yesterday
pub fn flush_window(today: NaiveDate) -> Vec<NaiveDate> {
    std::iter::once(today).chain(today.pred_opt()).collect()
}

/// Buffers request counts in the counter cache and consolidates them into
/// aggregate records.
pub struct Consolidator {
    cache: Arc<dyn CounterCache>,
    store: Arc<dyn AggregateStore>,
    clock: Arc<dyn Clock>,
    config: ConsolidatorConfig,
}

impl Consolidator {
    pub fn new(
        cache: Arc<dyn CounterCache>,
        store: Arc<dyn AggregateStore>,
        clock: Arc<dyn Clock>,
        config: ConsolidatorConfig,
    ) -> Self {
        info!(
            "Initializing consolidator with prefix={}, autoflush={}, ttl={}s",
            config.key_prefix, config.autoflush_threshold, config.counter_ttl_secs
        );

        Self {
            cache,
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ConsolidatorConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Cache key of the counter for `request_type` on `date`
    pub fn key_for(&self, request_type: RequestType, date: NaiveDate) -> String {
        counter_key(&self.config.key_prefix, request_type, date)
    }

    /// Count one request of `request_type` for today.
    ///
    /// Returns the counter value after the increment. When it reaches the
    /// effective auto-flush threshold, today and yesterday are flushed before
    /// returning.
    pub async fn record_event(
        &self,
        request_type: RequestType,
        options: RecordOptions,
    ) -> Result<i64> {
        let key = self.key_for(request_type, self.clock.today());

        let value = self.cache.increment(&key).await?;
        self.cache
            .set_expiry(&key, Duration::from_secs(self.config.counter_ttl_secs))
            .await?;
        metrics::record_event(request_type.key_name());

        let threshold = options
            .autoflush
            .unwrap_or(self.config.autoflush_threshold);
        if threshold > 0 && value >= threshold {
            debug!(
                "Auto-flush: key={}, value={}, threshold={}",
                key, value, threshold
            );
            metrics::AUTOFLUSH_TOTAL.inc();
            self.flush_all(None).await?;
        }

        Ok(value)
    }

    /// Flush every request type for `date`, or for today and yesterday when
    /// `date` is `None`.
    ///
    /// Every counter is attempted even when an earlier one fails. Failures are
    /// reported together as [`TallyError::PartialFailure`] once all are done.
    pub async fn flush_all(&self, date: Option<NaiveDate>) -> Result<FlushSummary> {
        let dates = self.dates_or_window(date);
        self.flush_dates(&dates).await
    }

    /// Flush every request type for each of `dates`
    pub async fn flush_dates(&self, dates: &[NaiveDate]) -> Result<FlushSummary> {
        let mut summary = FlushSummary::default();
        let mut failures = Vec::new();

        for &date in dates {
            for request_type in RequestType::ALL {
                match self.flush_one(request_type, date).await {
                    Ok(outcome) => summary.flushes.push(KeyFlush {
                        date,
                        request_type,
                        outcome,
                    }),
                    Err(e) => {
                        warn!("Flush of {} for {} failed: {}", request_type, date, e);
                        metrics::record_flush(request_type.key_name(), "error", 0);
                        failures.push(e);
                    }
                }
            }
        }

        if summary.committed_units() > 0 {
            info!(
                "Flushed {} counts across {} date(s)",
                summary.committed_units(),
                dates.len()
            );
        }

        collect_failures(summary, failures)
    }

    /// Move the pending count for one (request type, date) into its aggregate
    pub async fn flush_one(
        &self,
        request_type: RequestType,
        date: NaiveDate,
    ) -> Result<FlushOutcome> {
        let key = self.key_for(request_type, date);
        let outcome = self.drain(&key, request_type, date).await?;

        metrics::record_flush(
            request_type.key_name(),
            outcome.label(),
            outcome.committed_amount(),
        );
        Ok(outcome)
    }

    async fn drain(
        &self,
        key: &str,
        request_type: RequestType,
        date: NaiveDate,
    ) -> Result<FlushOutcome> {
        let observed = self.cache.get(key).await?;
        // Negative only while another flusher is mid-undo; nothing to claim
        if observed <= 0 {
            return Ok(FlushOutcome::Empty);
        }

        let remaining = self.cache.decrement_by(key, observed).await?;
        if remaining < 0 {
            self.cache.increment_by(key, observed).await?;
            debug!(
                "Flush race lost: key={}, observed={}, remaining={}",
                key, observed, remaining
            );
            return Ok(FlushOutcome::RaceLost { observed });
        }

        let amount = observed as u64;
        let record_id = match self.resolve_record(date, request_type).await {
            Ok(id) => id,
            Err(e) => {
                // Nothing durable was written, hand the units back
                if let Err(restore) = self.cache.increment_by(key, observed).await {
                    warn!(
                        "Dropped {} counts for key={}: restore failed ({}) after: {}",
                        observed, key, restore, e
                    );
                }
                return Err(e);
            }
        };

        if let Err(e) = self.store.add_to_count(record_id, amount).await {
            warn!(
                "Dropped {} counts for key={}: aggregate {} update failed",
                amount, key, record_id
            );
            return Err(e);
        }

        debug!(
            "Committed {} counts from key={} to aggregate {}",
            amount, key, record_id
        );
        Ok(FlushOutcome::Committed { record_id, amount })
    }

    /// Find the aggregate record for `(date, request_type)`, creating it with
    /// a zero count if needed.
    ///
    /// Losing the creation race to a concurrent writer is retried once. A
    /// conflict on the last attempt is [`TallyError::RecordConflict`].
    pub async fn resolve_record(
        &self,
        date: NaiveDate,
        request_type: RequestType,
    ) -> Result<RecordId> {
        for attempt in 0..=MAX_UPSERT_RETRIES {
            match self.find_or_create(date, request_type).await? {
                UpsertOutcome::Found(id) | UpsertOutcome::Created(id) => return Ok(id),
                UpsertOutcome::Conflict if attempt < MAX_UPSERT_RETRIES => {
                    debug!(
                        "Aggregate for ({}, {}) created concurrently, retrying lookup",
                        date, request_type
                    );
                    metrics::UPSERT_RETRIES_TOTAL.inc();
                }
                UpsertOutcome::Conflict => {}
            }
        }

        Err(TallyError::RecordConflict { date, request_type })
    }

    async fn find_or_create(
        &self,
        date: NaiveDate,
        request_type: RequestType,
    ) -> Result<UpsertOutcome> {
        if let Some(id) = self.store.find(date, request_type).await? {
            return Ok(UpsertOutcome::Found(id));
        }

        Ok(match self.store.insert(date, request_type, 0).await? {
            InsertOutcome::Created(id) => UpsertOutcome::Created(id),
            InsertOutcome::Conflict => UpsertOutcome::Conflict,
        })
    }

    /// Delete the counters for `date`, or for today and yesterday when `date`
    /// is `None`, discarding anything not yet flushed.
    ///
    /// Returns how many counters existed.
    pub async fn clear_all(&self, date: Option<NaiveDate>) -> Result<usize> {
        let dates = self.dates_or_window(date);
        let mut cleared = 0;
        let mut failures = Vec::new();

        for date in dates {
            for request_type in RequestType::ALL {
                let key = self.key_for(request_type, date);
                match self.cache.delete(&key).await {
                    Ok(true) => cleared += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Clearing key={} failed: {}", key, e);
                        failures.push(e);
                    }
                }
            }
        }

        info!("Cleared {} request counters", cleared);
        collect_failures(cleared, failures)
    }

    /// Pending (not yet flushed) count for one request type and date
    pub async fn counter_value(&self, request_type: RequestType, date: NaiveDate) -> Result<i64> {
        self.cache.get(&self.key_for(request_type, date)).await
    }

    fn dates_or_window(&self, date: Option<NaiveDate>) -> Vec<NaiveDate> {
        match date {
            Some(date) => vec![date],
            None => flush_window(self.clock.today()),
        }
    }
}

fn collect_failures<T>(value: T, failures: Vec<TallyError>) -> Result<T> {
    let mut failures = failures.into_iter();
    match failures.next() {
        None => Ok(value),
        Some(first) => Err(TallyError::PartialFailure {
            failed: 1 + failures.count(),
            first: Box::new(first),
        }),
    }
}
