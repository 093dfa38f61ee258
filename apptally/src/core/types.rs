use super::error::TallyError;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Stored value in the KV store with metadata
#[derive(Debug, Clone)]
pub struct StoredValue {
    /// Raw byte data
    pub data: Vec<u8>,
    /// Optional expiration time
    pub ttl: Option<Instant>,
}

impl StoredValue {
    /// Create a new stored value without expiry
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, ttl: None }
    }

    /// Check if the value has expired
    pub fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|expires| Instant::now() >= expires)
    }

    /// Replace the expiration, counted from now.
    ///
    /// Fails without touching the current expiry when `ttl` is too large to
    /// represent as a deadline.
    pub fn expire_in(&mut self, ttl: Duration) -> Result<(), TallyError> {
        let deadline = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| TallyError::InvalidValue(format!("ttl out of range: {:?}", ttl)))?;
        self.ttl = Some(deadline);
        Ok(())
    }

    /// Get remaining TTL in seconds
    pub fn remaining_ttl_secs(&self) -> Option<u64> {
        self.ttl.map(|expires| {
            let now = Instant::now();
            if now >= expires {
                0
            } else {
                (expires - now).as_secs()
            }
        })
    }
}

/// Configuration for KV store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVConfig {
    /// TTL cleanup interval in milliseconds
    pub ttl_cleanup_interval_ms: u64,
}

impl Default for KVConfig {
    fn default() -> Self {
        Self {
            ttl_cleanup_interval_ms: 100,
        }
    }
}

/// Statistics for KV store
#[derive(Debug, Default, Clone, Serialize)]
pub struct KVStats {
    /// Total number of keys
    pub total_keys: usize,
    /// Number of GET operations
    pub gets: u64,
    /// Number of INCR operations
    pub incrs: u64,
    /// Number of DELETE operations
    pub dels: u64,
    /// Number of keys dropped because their TTL elapsed
    pub expired: u64,
}

/// Category a counted request belongs to.
///
/// The discriminants are persisted in aggregate records and the key names are
/// baked into counter keys, so neither may change once data exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestType {
    Anon = 0,
    LoggedIn = 1,
    Crawler = 2,
}

impl RequestType {
    /// Every request type, in persisted-id order
    pub const ALL: [RequestType; 3] = [Self::Anon, Self::LoggedIn, Self::Crawler];

    /// Integer stored in aggregate records
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    /// Name used inside counter keys
    pub fn key_name(self) -> &'static str {
        match self {
            Self::Anon => "anon",
            Self::LoggedIn => "logged_in",
            Self::Crawler => "crawler",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.key_name())
    }
}

// Persisted as the integer id
impl Serialize for RequestType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.id())
    }
}

impl<'de> Deserialize<'de> for RequestType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = u8::deserialize(deserializer)?;
        Self::from_id(id)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown request type id {}", id)))
    }
}

impl FromStr for RequestType {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.key_name() == s)
            .ok_or_else(|| TallyError::InvalidValue(format!("unknown request type: {}", s)))
    }
}

/// Build the cache key for one (request type, day) counter.
///
/// Format is `<prefix><type><YYYYMMDD>`, e.g. `app_req_anon20240105`. Writers
/// and flushers only meet through this string.
pub fn counter_key(prefix: &str, request_type: RequestType, date: NaiveDate) -> String {
    format!(
        "{}{}{}",
        prefix,
        request_type.key_name(),
        date.format("%Y%m%d")
    )
}

/// Identifier assigned to an aggregate record by its store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Durable total for one (date, request type) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub id: RecordId,
    pub date: NaiveDate,
    pub request_type: RequestType,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_format() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(
            counter_key("app_req_", RequestType::Anon, date),
            "app_req_anon20240105"
        );
        assert_eq!(
            counter_key("app_req_", RequestType::LoggedIn, date),
            "app_req_logged_in20240105"
        );
        assert_eq!(
            counter_key("x:", RequestType::Crawler, NaiveDate::from_ymd_opt(987, 12, 31).unwrap()),
            "x:crawler09871231"
        );
    }

    #[test]
    fn test_request_type_ids() {
        assert_eq!(RequestType::Anon.id(), 0);
        assert_eq!(RequestType::LoggedIn.id(), 1);
        assert_eq!(RequestType::Crawler.id(), 2);
        assert_eq!(RequestType::from_id(2), Some(RequestType::Crawler));
        assert_eq!(RequestType::from_id(3), None);
    }

    #[test]
    fn test_request_type_parse() {
        assert_eq!("logged_in".parse::<RequestType>().unwrap(), RequestType::LoggedIn);
        assert_eq!(RequestType::Crawler.to_string(), "crawler");
        assert!("robot".parse::<RequestType>().is_err());
    }

    #[test]
    fn test_request_type_serializes_as_id() {
        assert_eq!(serde_json::to_string(&RequestType::LoggedIn).unwrap(), "1");
        assert_eq!(
            serde_json::from_str::<RequestType>("2").unwrap(),
            RequestType::Crawler
        );
        assert!(serde_json::from_str::<RequestType>("7").is_err());
    }

    #[test]
    fn test_stored_value_expiry() {
        let mut value = StoredValue::new(b"1".to_vec());
        assert!(!value.is_expired());
        assert_eq!(value.remaining_ttl_secs(), None);

        value.expire_in(Duration::from_secs(60)).unwrap();
        assert!(!value.is_expired());
        assert!(value.remaining_ttl_secs().unwrap() > 50);

        value.expire_in(Duration::ZERO).unwrap();
        assert!(value.is_expired());
    }

    #[test]
    fn test_stored_value_rejects_unrepresentable_ttl() {
        let mut value = StoredValue::new(b"1".to_vec());
        value.expire_in(Duration::from_secs(60)).unwrap();

        let err = value.expire_in(Duration::from_secs(u64::MAX)).unwrap_err();
        assert!(matches!(err, TallyError::InvalidValue(_)));
        // Previous expiry is kept
        assert!(value.remaining_ttl_secs().unwrap() > 50);
    }
}
