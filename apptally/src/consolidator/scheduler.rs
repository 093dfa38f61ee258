//! Periodic flushing
//!
//! Auto-flush only watches today's counter, so counts left under yesterday's
//! key after midnight wait for the next `flush_all(None)`. The scheduler
//! issues that call on a fixed interval.

use super::Consolidator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

impl Consolidator {
    /// Start a background task flushing today and yesterday every `interval`.
    ///
    /// A zero interval disables the task and returns `None`.
    pub fn start_flush_scheduler(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if interval.is_zero() {
            info!("Periodic flush disabled");
            return None;
        }

        info!("Starting flush scheduler (interval={:?})", interval);

        let consolidator = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match consolidator.flush_all(None).await {
                    Ok(summary) => debug!(
                        "Periodic flush committed {} counts ({} races lost)",
                        summary.committed_units(),
                        summary.races_lost()
                    ),
                    Err(e) => warn!("Periodic flush failed: {}", e),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::aggregate::{AggregateStore, MemoryAggregateStore};
    use crate::cache::CounterCache;
    use crate::consolidator::{Consolidator, ConsolidatorConfig};
    use crate::core::{FixedClock, KVConfig, KVStore, RequestType};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_zero_interval_disables() {
        let consolidator = Arc::new(Consolidator::new(
            Arc::new(KVStore::new(KVConfig::default())),
            Arc::new(MemoryAggregateStore::new()),
            Arc::new(FixedClock::at_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())),
            ConsolidatorConfig::default(),
        ));
        assert!(consolidator.start_flush_scheduler(Duration::ZERO).is_none());
    }

    #[tokio::test]
    async fn test_scheduler_drains_yesterday() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let cache = Arc::new(KVStore::new(KVConfig::default()));
        let store = Arc::new(MemoryAggregateStore::new());
        let consolidator = Arc::new(Consolidator::new(
            cache.clone(),
            store.clone(),
            Arc::new(FixedClock::at_date(today)),
            ConsolidatorConfig::default(),
        ));

        let key = consolidator.key_for(RequestType::Crawler, yesterday);
        cache.increment_by(&key, 3).await.unwrap();

        let handle = consolidator
            .start_flush_scheduler(Duration::from_millis(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(
            store.count_for(yesterday, RequestType::Crawler).await.unwrap(),
            3
        );
        assert_eq!(
            consolidator
                .counter_value(RequestType::Crawler, yesterday)
                .await
                .unwrap(),
            0
        );
    }
}
