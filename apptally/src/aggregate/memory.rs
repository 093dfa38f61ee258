use super::{AggregateStore, InsertOutcome};
use crate::core::error::{Result, TallyError};
use crate::core::types::{AggregateRecord, RecordId, RequestType};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct Tables {
    next_id: u64,
    records: BTreeMap<RecordId, AggregateRecord>,
    unique: HashMap<(NaiveDate, RequestType), RecordId>,
    writes: u64,
}

/// Aggregate store kept in memory, with JSON snapshots for persistence.
///
/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryAggregateStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inserts and count updates applied so far
    pub fn write_count(&self) -> u64 {
        self.tables.read().writes
    }

    /// Write every record to `path` as a JSON array
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let records: Vec<AggregateRecord> = self.tables.read().records.values().cloned().collect();
        let json = serde_json::to_vec_pretty(&records)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!("Saved {} aggregate records to {:?}", records.len(), path);
        Ok(())
    }

    /// Rebuild a store from a snapshot written by [`save_snapshot`](Self::save_snapshot)
    pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await?;
        let records: Vec<AggregateRecord> = serde_json::from_slice(&content)?;

        let mut tables = Tables::default();
        for record in records {
            let pair = (record.date, record.request_type);
            if tables.unique.insert(pair, record.id).is_some() {
                return Err(TallyError::Snapshot(format!(
                    "duplicate aggregate for {} on {}",
                    record.request_type, record.date
                )));
            }
            if tables.records.contains_key(&record.id) {
                return Err(TallyError::Snapshot(format!(
                    "duplicate aggregate id {}",
                    record.id
                )));
            }
            tables.next_id = tables.next_id.max(record.id.0 + 1);
            tables.records.insert(record.id, record);
        }

        info!(
            "Loaded {} aggregate records from {:?}",
            tables.records.len(),
            path
        );
        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
        })
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn find(&self, date: NaiveDate, request_type: RequestType) -> Result<Option<RecordId>> {
        Ok(self.tables.read().unique.get(&(date, request_type)).copied())
    }

    async fn insert(
        &self,
        date: NaiveDate,
        request_type: RequestType,
        count: u64,
    ) -> Result<InsertOutcome> {
        let mut tables = self.tables.write();
        if tables.unique.contains_key(&(date, request_type)) {
            debug!("Unique violation on ({}, {})", date, request_type);
            return Ok(InsertOutcome::Conflict);
        }

        let id = RecordId(tables.next_id);
        tables.next_id += 1;
        tables.unique.insert((date, request_type), id);
        tables.records.insert(
            id,
            AggregateRecord {
                id,
                date,
                request_type,
                count,
            },
        );
        tables.writes += 1;

        debug!("Created aggregate {} for ({}, {})", id, date, request_type);
        Ok(InsertOutcome::Created(id))
    }

    async fn add_to_count(&self, id: RecordId, delta: u64) -> Result<()> {
        let mut tables = self.tables.write();
        let record = tables
            .records
            .get_mut(&id)
            .ok_or(TallyError::RecordNotFound(id))?;
        record.count = record
            .count
            .checked_add(delta)
            .ok_or_else(|| TallyError::Store(format!("count overflow on aggregate {}", id)))?;
        tables.writes += 1;
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<AggregateRecord>> {
        Ok(self.tables.read().records.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<AggregateRecord>> {
        let mut records: Vec<AggregateRecord> =
            self.tables.read().records.values().cloned().collect();
        records.sort_by_key(|r| (r.date, r.request_type));
        Ok(records)
    }
}
