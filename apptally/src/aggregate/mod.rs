//! Durable per-day aggregates
//!
//! [`AggregateStore`] is the seam to whatever relational store holds the
//! consolidated counts. A store must enforce uniqueness of
//! `(date, request_type)` and report a violation as
//! [`InsertOutcome::Conflict`] rather than an error, and must apply count
//! changes relative to the stored value.

pub mod memory;

pub use memory::MemoryAggregateStore;

use crate::core::error::Result;
use crate::core::types::{AggregateRecord, RecordId, RequestType};
use async_trait::async_trait;
use chrono::NaiveDate;

/// Result of an insert against the unique `(date, request_type)` index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(RecordId),
    /// Another writer already holds the pair
    Conflict,
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Point lookup by the unique key
    async fn find(&self, date: NaiveDate, request_type: RequestType) -> Result<Option<RecordId>>;

    /// Insert a new record, enforcing uniqueness of `(date, request_type)`
    async fn insert(
        &self,
        date: NaiveDate,
        request_type: RequestType,
        count: u64,
    ) -> Result<InsertOutcome>;

    /// `count = count + delta`, applied in place
    async fn add_to_count(&self, id: RecordId, delta: u64) -> Result<()>;

    async fn get(&self, id: RecordId) -> Result<Option<AggregateRecord>>;

    /// All records ordered by date, then request type
    async fn list(&self) -> Result<Vec<AggregateRecord>>;

    /// Count stored for a pair, `0` when no record exists yet
    async fn count_for(&self, date: NaiveDate, request_type: RequestType) -> Result<u64> {
        match self.find(date, request_type).await? {
            Some(id) => Ok(self.get(id).await?.map(|r| r.count).unwrap_or(0)),
            None => Ok(0),
        }
    }
}
