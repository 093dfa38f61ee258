pub mod aggregate;
pub mod cache;
pub mod config;
pub mod consolidator;
pub mod core;
pub mod metrics;

// Re-export commonly used types
pub use aggregate::{AggregateStore, InsertOutcome, MemoryAggregateStore};
pub use cache::CounterCache;
pub use config::AppTallyConfig;
pub use consolidator::{
    Consolidator, ConsolidatorConfig, FlushOutcome, FlushSummary, KeyFlush, RecordOptions,
    UpsertOutcome, flush_window,
};
pub use self::core::{
    AggregateRecord, Clock, FixedClock, KVConfig, KVStore, RecordId, RequestType, Result,
    SystemClock, TallyError, counter_key,
};
