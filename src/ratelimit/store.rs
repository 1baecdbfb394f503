use std::{
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Hit count for one key inside its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

impl WindowRecord {
    fn fresh(now: DateTime<Utc>, window: TimeDelta) -> Self {
        Self {
            count: 0,
            reset_at: now + window,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Sharded in-memory window map shared by every local limiter.
///
/// Each mutation holds only the shard lock of the touched key, so concurrent
/// hits on one key are applied exactly once.
#[derive(Default)]
pub struct WindowStore {
    records: DashMap<String, WindowRecord>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Counts one hit for `key`, starting a new window first if the old one elapsed.
    pub fn hit(&self, key: &str, window: TimeDelta, now: DateTime<Utc>) -> WindowRecord {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| WindowRecord::fresh(now, window));

        if record.is_expired(now) {
            *record = WindowRecord::fresh(now, window);
        }

        record.count += 1;
        *record
    }

    /// Takes back one hit, but only from the window it was charged to.
    pub fn refund(&self, key: &str, reset_at: DateTime<Utc>) -> bool {
        match self.records.get_mut(key) {
            Some(mut record) if record.reset_at == reset_at && record.count > 0 => {
                record.count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<WindowRecord> {
        self.records.get(key).map(|record| *record)
    }

    pub fn restore(&self, key: &str, record: WindowRecord) {
        self.records.insert(key.to_string(), record);
    }

    /// Drops every record whose window has elapsed; returns how many went.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub fn spawn_sweeper(store: Arc<WindowStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = store.sweep(Utc::now());
            if removed > 0 {
                tracing::debug!(removed, live = store.len(), "swept expired rate limit windows");
            }
        }
    })
}
