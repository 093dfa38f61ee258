pub mod clock;
pub mod error;
pub mod kv_store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Result, TallyError};
pub use kv_store::KVStore;
pub use types::{
    AggregateRecord, KVConfig, KVStats, RecordId, RequestType, StoredValue, counter_key,
};
