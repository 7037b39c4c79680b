// Key/value cache with per-entry expiry checked lazily at read time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Clock;

/// Upper bound for TTLs that do not fit in a chrono `Duration`.
const MAX_TTL_DAYS: i64 = 365;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, now: DateTime<Utc>, ttl: StdDuration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(MAX_TTL_DAYS));
        Self {
            value,
            cached_at: now,
            expires_at: now + ttl,
        }
    }

    /// An entry is dead from its expiry instant onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes(now);
        if minutes < 1 {
            // Includes negative ages from clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// In-memory TTL cache. No size bound; entries leave only by expiry or
/// explicit invalidation.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_entry(key).map(|entry| entry.value.clone())
    }

    pub fn get_entry(&self, key: &str) -> Option<&CacheEntry<V>> {
        let now = self.clock.now();
        self.entries.get(key).filter(|entry| !entry.is_expired_at(now))
    }

    pub fn set(&mut self, key: impl Into<String>, value: V, ttl: StdDuration) {
        let entry = CacheEntry::new(value, self.clock.now(), ttl);
        self.entries.insert(key.into(), entry);
    }

    /// Mutate a live entry in place, keeping its expiry. Returns false when
    /// there is nothing live to update.
    pub fn update(&mut self, key: &str, f: impl FnOnce(&mut V)) -> bool {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                f(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    /// Remove an entry, returning its value if it was still live.
    pub fn invalidate(&mut self, key: &str) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .remove(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value)
    }

    pub fn invalidate_where(&mut self, mut matches: impl FnMut(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !matches(key));
        before - self.entries.len()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn clear_expired(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before - self.entries.len()
    }

    /// Number of stored entries, expired ones included until cleared.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn live_entries(&self) -> HashMap<String, CacheEntry<V>> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Re-insert previously snapshotted entries, skipping the expired ones.
    pub fn restore(&mut self, entries: HashMap<String, CacheEntry<V>>) -> usize {
        let now = self.clock.now();
        let mut restored = 0;
        for (key, entry) in entries {
            if !entry.is_expired_at(now) {
                self.entries.insert(key, entry);
                restored += 1;
            }
        }
        restored
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
