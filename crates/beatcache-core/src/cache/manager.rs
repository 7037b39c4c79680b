use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CacheEntry, Clock, TtlCache};
use crate::models::{UserStats, UserSummary};

/// Snapshot file name in the cache directory
const SNAPSHOT_FILE: &str = "social_cache.json";

/// Separator between follower and followee in follow-status keys
const EDGE_SEPARATOR: &str = "->";

/// Per-kind time-to-live settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub following: Duration,
    pub stats: Duration,
    pub suggestions: Duration,
    pub search: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            following: Duration::from_secs(5 * 60),
            stats: Duration::from_secs(2 * 60),
            suggestions: Duration::from_secs(10 * 60),
            search: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheSnapshot {
    #[serde(default)]
    following: HashMap<String, CacheEntry<bool>>,
    #[serde(default)]
    stats: HashMap<String, CacheEntry<UserStats>>,
    #[serde(default)]
    suggestions: HashMap<String, CacheEntry<SuggestionPage>>,
    #[serde(default)]
    search: HashMap<String, CacheEntry<Vec<UserSummary>>>,
}

/// A cached suggestion list for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionPage {
    pub users: Vec<UserSummary>,
    /// The store returned fewer users than were asked for
    pub exhausted: bool,
}

/// Typed cache for social-graph reads.
///
/// Each key is mutated independently; there are no multi-key transactions.
#[derive(Debug)]
pub struct SocialCache {
    following: TtlCache<bool>,
    stats: TtlCache<UserStats>,
    suggestions: TtlCache<SuggestionPage>,
    search: TtlCache<Vec<UserSummary>>,
    ttls: CacheTtls,
    snapshot_dir: Option<PathBuf>,
}

fn edge_key(follower_id: &str, followee_id: &str) -> String {
    format!("{}{}{}", follower_id, EDGE_SEPARATOR, followee_id)
}

fn search_key(query: &str) -> String {
    query.trim().to_lowercase()
}

impl SocialCache {
    pub fn new(clock: Arc<dyn Clock>, ttls: CacheTtls) -> Self {
        Self {
            following: TtlCache::new(clock.clone()),
            stats: TtlCache::new(clock.clone()),
            suggestions: TtlCache::new(clock.clone()),
            search: TtlCache::new(clock),
            ttls,
            snapshot_dir: None,
        }
    }

    /// Persist snapshots under `dir` (created on first save).
    pub fn with_snapshot_dir(mut self, dir: PathBuf) -> Self {
        self.snapshot_dir = Some(dir);
        self
    }

    pub fn ttls(&self) -> CacheTtls {
        self.ttls
    }

    // ===== Follow status =====

    pub fn load_following(&self, follower_id: &str, followee_id: &str) -> Option<bool> {
        self.following.get(&edge_key(follower_id, followee_id))
    }

    pub fn save_following(&mut self, follower_id: &str, followee_id: &str, following: bool) {
        self.following
            .set(edge_key(follower_id, followee_id), following, self.ttls.following);
    }

    // ===== Stats =====

    pub fn load_stats(&self, user_id: &str) -> Option<UserStats> {
        self.stats.get(user_id)
    }

    pub fn save_stats(&mut self, user_id: &str, stats: UserStats) {
        self.stats.set(user_id, stats, self.ttls.stats);
    }

    /// Adjust cached counters in place. Returns false when nothing is cached,
    /// in which case the next read goes to the store anyway.
    pub fn adjust_stats(&mut self, user_id: &str, f: impl FnOnce(&mut UserStats)) -> bool {
        self.stats.update(user_id, f)
    }

    pub fn stats_age(&self, user_id: &str) -> Option<String> {
        self.stats
            .get_entry(user_id)
            .map(|entry| entry.age_display(self.stats.now()))
    }

    // ===== Suggestions =====

    pub fn load_suggestions(&self, user_id: &str) -> Option<SuggestionPage> {
        self.suggestions.get(user_id)
    }

    /// Cache the result of asking the store for `requested` suggestions.
    pub fn save_suggestions(&mut self, user_id: &str, users: Vec<UserSummary>, requested: usize) {
        let page = SuggestionPage {
            exhausted: users.len() < requested,
            users,
        };
        self.suggestions.set(user_id, page, self.ttls.suggestions);
    }

    /// Drop a user from every cached suggestion list they appear in.
    pub fn remove_suggested(&mut self, owner_id: &str, suggested_id: &str) {
        self.suggestions
            .update(owner_id, |page| page.users.retain(|u| u.id != suggested_id));
    }

    // ===== Search =====

    pub fn load_search(&self, query: &str) -> Option<Vec<UserSummary>> {
        self.search.get(&search_key(query))
    }

    pub fn save_search(&mut self, query: &str, users: Vec<UserSummary>) {
        self.search.set(search_key(query), users, self.ttls.search);
    }

    // ===== Maintenance =====

    /// Forget everything cached about or for a user.
    pub fn invalidate_user(&mut self, user_id: &str) -> usize {
        let edges = self.following.invalidate_where(|key| {
            key.split_once(EDGE_SEPARATOR)
                .map(|(a, b)| a == user_id || b == user_id)
                .unwrap_or(false)
        });
        let stats = self.stats.invalidate_where(|key| key == user_id);
        let suggestions = self.suggestions.invalidate_where(|key| key == user_id);
        edges + stats + suggestions
    }

    pub fn clear_expired(&mut self) -> usize {
        let removed = self.following.clear_expired()
            + self.stats.clear_expired()
            + self.suggestions.clear_expired()
            + self.search.clear_expired();
        if removed > 0 {
            debug!(removed, "Cleared expired cache entries");
        }
        removed
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.snapshot_dir.as_ref().map(|dir| dir.join(SNAPSHOT_FILE))
    }

    /// Write live entries to the snapshot file. No-op without a snapshot dir.
    pub fn save_snapshot(&self) -> Result<()> {
        let Some(path) = self.snapshot_path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = CacheSnapshot {
            following: self.following.live_entries(),
            stats: self.stats.live_entries(),
            suggestions: self.suggestions.live_entries(),
            search: self.search.live_entries(),
        };
        let contents = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write cache snapshot: {}", path.display()))?;
        Ok(())
    }

    /// Restore live entries from the snapshot file. Returns how many came back.
    pub fn load_snapshot(&mut self) -> Result<usize> {
        let Some(path) = self.snapshot_path() else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache snapshot: {}", path.display()))?;
        let snapshot: CacheSnapshot =
            serde_json::from_str(&contents).context("Failed to parse cache snapshot")?;

        let restored = self.following.restore(snapshot.following)
            + self.stats.restore(snapshot.stats)
            + self.suggestions.restore(snapshot.suggestions)
            + self.search.restore(snapshot.search);
        debug!(restored, "Restored cache snapshot");
        Ok(restored)
    }

    /// Load the snapshot, discarding it if unreadable.
    pub fn load_snapshot_or_discard(&mut self) -> usize {
        match self.load_snapshot() {
            Ok(restored) => restored,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable cache snapshot");
                if let Some(path) = self.snapshot_path() {
                    let _ = std::fs::remove_file(path);
                }
                0
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use chrono::Utc;

    fn cache() -> (SocialCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (SocialCache::new(clock.clone(), CacheTtls::default()), clock)
    }

    fn summary(id: &str) -> UserSummary {
        UserSummary {
            id: id.to_string(),
            display_name: format!("{}_name", id),
            name: String::new(),
            profile_image: None,
        }
    }

    #[test]
    fn test_following_is_directional() {
        let (mut cache, _) = cache();
        cache.save_following("a", "b", true);
        assert_eq!(cache.load_following("a", "b"), Some(true));
        assert_eq!(cache.load_following("b", "a"), None);
    }

    #[test]
    fn test_following_expires_with_ttl() {
        let (mut cache, clock) = cache();
        cache.save_following("a", "b", true);
        clock.advance(chrono::Duration::from_std(CacheTtls::default().following).expect("ttl"));
        assert_eq!(cache.load_following("a", "b"), None);
    }

    #[test]
    fn test_adjust_stats_requires_live_entry() {
        let (mut cache, _) = cache();
        assert!(!cache.adjust_stats("b", |s| s.adjust_followers(1)));

        cache.save_stats("b", UserStats::new(4, 2));
        assert!(cache.adjust_stats("b", |s| s.adjust_followers(1)));
        assert_eq!(cache.load_stats("b"), Some(UserStats::new(5, 2)));
    }

    #[test]
    fn test_search_key_is_normalized() {
        let (mut cache, _) = cache();
        cache.save_search("  Nova ", vec![summary("u1")]);
        assert_eq!(cache.load_search("nova").map(|v| v.len()), Some(1));
    }

    #[test]
    fn test_remove_suggested() {
        let (mut cache, _) = cache();
        cache.save_suggestions("me", vec![summary("u1"), summary("u2")], 2);
        cache.remove_suggested("me", "u1");
        let remaining = cache.load_suggestions("me").expect("suggestions");
        assert_eq!(remaining.users, vec![summary("u2")]);
        // Shrinking the list locally does not make it look exhausted
        assert!(!remaining.exhausted);
    }

    #[test]
    fn test_invalidate_user() {
        let (mut cache, _) = cache();
        cache.save_following("a", "b", true);
        cache.save_following("c", "a", true);
        cache.save_following("c", "d", false);
        cache.save_stats("a", UserStats::new(1, 1));
        cache.save_suggestions("a", vec![summary("x")], 10);

        assert_eq!(cache.invalidate_user("a"), 4);
        assert_eq!(cache.load_following("a", "b"), None);
        assert_eq!(cache.load_following("c", "a"), None);
        assert_eq!(cache.load_following("c", "d"), Some(false));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let mut cache = SocialCache::new(clock.clone(), CacheTtls::default())
            .with_snapshot_dir(dir.path().to_path_buf());
        cache.save_following("a", "b", true);
        cache.save_stats("b", UserStats::new(9, 3));
        cache.save_snapshot().expect("save snapshot");

        let mut restored = SocialCache::new(clock.clone(), CacheTtls::default())
            .with_snapshot_dir(dir.path().to_path_buf());
        assert_eq!(restored.load_snapshot().expect("load snapshot"), 2);
        assert_eq!(restored.load_following("a", "b"), Some(true));
        assert_eq!(restored.load_stats("b"), Some(UserStats::new(9, 3)));
    }

    #[test]
    fn test_snapshot_drops_entries_expired_while_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let mut cache = SocialCache::new(clock.clone(), CacheTtls::default())
            .with_snapshot_dir(dir.path().to_path_buf());
        cache.save_stats("b", UserStats::new(1, 1));
        cache.save_suggestions("me", vec![summary("x")], 10);
        cache.save_snapshot().expect("save snapshot");

        // Past the stats TTL but within the suggestions TTL
        clock.advance(chrono::Duration::minutes(3));
        let mut restored = SocialCache::new(clock, CacheTtls::default())
            .with_snapshot_dir(dir.path().to_path_buf());
        assert_eq!(restored.load_snapshot().expect("load snapshot"), 1);
        assert_eq!(restored.load_stats("b"), None);
        assert!(restored.load_suggestions("me").is_some());
    }

    #[test]
    fn test_corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(SNAPSHOT_FILE), "{not json").expect("write");

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut cache = SocialCache::new(clock, CacheTtls::default())
            .with_snapshot_dir(dir.path().to_path_buf());
        assert_eq!(cache.load_snapshot_or_discard(), 0);
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());
    }
}
