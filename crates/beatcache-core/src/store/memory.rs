//! In-process profile store.
//!
//! Behaves like the remote document store closely enough to drive the
//! synchronizer and coordinator end to end: liked songs support push
//! subscriptions, and failures can be injected to exercise rollback and
//! stale-cache paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};

use super::{ProfileStore, StoreError};
use crate::models::{NewProfile, ProfileUpdate, UserProfile, UserStats, UserSummary};
use crate::utils::{cmp_ignore_case, contains_ignore_case};

#[derive(Default)]
struct Inner {
    profiles: HashMap<String, UserProfile>,
    /// (follower, followee)
    edges: BTreeSet<(String, String)>,
    liked_watchers: HashMap<String, watch::Sender<Vec<String>>>,
    next_id: u64,
}

impl Inner {
    fn require(&self, user_id: &str) -> Result<&UserProfile, StoreError> {
        self.profiles
            .get(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }

    fn name_taken(&self, display_name: &str, except: Option<&str>) -> bool {
        self.profiles.values().any(|p| {
            p.display_name.eq_ignore_ascii_case(display_name) && Some(p.id.as_str()) != except
        })
    }

    fn notify_liked(&self, user_id: &str) {
        if let (Some(tx), Some(profile)) = (self.liked_watchers.get(user_id), self.profiles.get(user_id)) {
            tx.send_replace(profile.liked_songs.iter().cloned().collect());
        }
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    push_enabled: bool,
    offline: AtomicBool,
    failing_mutations: AtomicUsize,
    requests: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            push_enabled: true,
            offline: AtomicBool::new(false),
            failing_mutations: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
        }
    }

    /// A store whose liked-songs feed can only be polled.
    pub fn without_push() -> Self {
        Self {
            push_enabled: false,
            ..Self::new()
        }
    }

    pub async fn insert_profile(&self, profile: UserProfile) {
        let mut inner = self.inner.lock().await;
        let id = profile.id.clone();
        inner.profiles.insert(id.clone(), profile);
        inner.notify_liked(&id);
    }

    /// Delete a profile and its follow edges, as an account removal would.
    pub async fn remove_profile(&self, user_id: &str) -> Option<UserProfile> {
        let mut inner = self.inner.lock().await;
        inner.edges.retain(|(a, b)| a != user_id && b != user_id);
        inner.liked_watchers.remove(user_id);
        inner.profiles.remove(user_id)
    }

    pub async fn profile(&self, user_id: &str) -> Option<UserProfile> {
        self.inner.lock().await.profiles.get(user_id).cloned()
    }

    /// Every call made through `ProfileStore`, successful or not.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `count` mutating calls fail as unavailable.
    pub fn fail_next_mutations(&self, count: usize) {
        self.failing_mutations.store(count, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    fn check_mutation(&self) -> Result<(), StoreError> {
        self.check()?;
        let injected = self
            .failing_mutations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

fn sorted_summaries<'a>(profiles: impl Iterator<Item = &'a UserProfile>) -> Vec<UserSummary> {
    let mut users: Vec<UserSummary> = profiles.map(|p| p.summary()).collect();
    users.sort_by(|a, b| cmp_ignore_case(&a.display_name, &b.display_name));
    users
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().await.profiles.get(user_id).cloned())
    }

    async fn find_by_display_name(
        &self,
        display_name: &str,
    ) -> Result<Option<UserProfile>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .profiles
            .values()
            .find(|p| p.display_name.eq_ignore_ascii_case(display_name))
            .cloned())
    }

    async fn create_profile(&self, new: &NewProfile) -> Result<UserProfile, StoreError> {
        self.check_mutation()?;
        let mut inner = self.inner.lock().await;
        if inner.name_taken(&new.display_name, None) {
            return Err(StoreError::Conflict(format!(
                "display name {} is taken",
                new.display_name
            )));
        }
        inner.next_id += 1;
        let mut profile = UserProfile::new(format!("user-{}", inner.next_id), &new.display_name);
        profile.name = new.name.clone();
        profile.passkey = new.passkey.clone();
        profile.bio = new.bio.clone();
        profile.profile_image = new.profile_image.clone();
        profile.created_at = Some(Utc::now());
        inner.profiles.insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<UserProfile, StoreError> {
        self.check_mutation()?;
        let mut inner = self.inner.lock().await;
        inner.require(user_id)?;
        if let Some(ref display_name) = update.display_name {
            if inner.name_taken(display_name, Some(user_id)) {
                return Err(StoreError::Conflict(format!(
                    "display name {} is taken",
                    display_name
                )));
            }
        }
        let profile = inner
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        update.apply_to(profile);
        Ok(profile.clone())
    }

    async fn record_login(&self, user_id: &str) -> Result<UserProfile, StoreError> {
        self.check_mutation()?;
        let mut inner = self.inner.lock().await;
        let profile = inner
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        profile.last_login = Some(Utc::now());
        profile.login_count += 1;
        Ok(profile.clone())
    }

    async fn is_following(&self, follower_id: &str, followee_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .edges
            .contains(&(follower_id.to_string(), followee_id.to_string())))
    }

    async fn follow(&self, follower_id: &str, followee_id: &str) -> Result<(), StoreError> {
        self.check_mutation()?;
        let mut inner = self.inner.lock().await;
        inner.require(follower_id)?;
        inner.require(followee_id)?;
        inner
            .edges
            .insert((follower_id.to_string(), followee_id.to_string()));
        Ok(())
    }

    async fn unfollow(&self, follower_id: &str, followee_id: &str) -> Result<(), StoreError> {
        self.check_mutation()?;
        let mut inner = self.inner.lock().await;
        inner
            .edges
            .remove(&(follower_id.to_string(), followee_id.to_string()));
        Ok(())
    }

    async fn followers_of(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        inner.require(user_id)?;
        Ok(inner
            .edges
            .iter()
            .filter(|(_, b)| b == user_id)
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn following_of(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        inner.require(user_id)?;
        Ok(inner
            .edges
            .iter()
            .filter(|(a, _)| a == user_id)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn user_stats(&self, user_id: &str) -> Result<UserStats, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        inner.require(user_id)?;
        let followers = inner.edges.iter().filter(|(_, b)| b == user_id).count() as u64;
        let following = inner.edges.iter().filter(|(a, _)| a == user_id).count() as u64;
        Ok(UserStats::new(followers, following))
    }

    async fn liked_songs(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner.require(user_id)?.liked_songs.iter().cloned().collect())
    }

    async fn like_song(&self, user_id: &str, track_id: &str) -> Result<(), StoreError> {
        self.check_mutation()?;
        let mut inner = self.inner.lock().await;
        let profile = inner
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        if profile.liked_songs.insert(track_id.to_string()) {
            inner.notify_liked(user_id);
        }
        Ok(())
    }

    async fn unlike_song(&self, user_id: &str, track_id: &str) -> Result<(), StoreError> {
        self.check_mutation()?;
        let mut inner = self.inner.lock().await;
        let profile = inner
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        if profile.liked_songs.remove(track_id) {
            inner.notify_liked(user_id);
        }
        Ok(())
    }

    async fn suggested_users(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<UserSummary>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        let candidates = inner.profiles.values().filter(|p| {
            p.id != user_id
                && !inner
                    .edges
                    .contains(&(user_id.to_string(), p.id.clone()))
        });
        let mut users = sorted_summaries(candidates);
        users.truncate(limit);
        Ok(users)
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, StoreError> {
        self.check()?;
        let query = query.trim();
        let inner = self.inner.lock().await;
        let matches = inner.profiles.values().filter(|p| {
            contains_ignore_case(&p.display_name, query) || contains_ignore_case(&p.name, query)
        });
        Ok(sorted_summaries(matches))
    }

    async fn subscribe_liked_songs(
        &self,
        user_id: &str,
    ) -> Result<Option<watch::Receiver<Vec<String>>>, StoreError> {
        self.check()?;
        if !self.push_enabled {
            return Ok(None);
        }
        let mut inner = self.inner.lock().await;
        let current: Vec<String> = inner.require(user_id)?.liked_songs.iter().cloned().collect();
        let tx = inner
            .liked_watchers
            .entry(user_id.to_string())
            .or_insert_with(|| watch::channel(current).0);
        Ok(Some(tx.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_profile(display_name: &str) -> NewProfile {
        NewProfile {
            display_name: display_name.to_string(),
            name: format!("{} Person", display_name),
            passkey: "pass1234".to_string(),
            bio: String::new(),
            profile_image: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_display_name() {
        let store = MemoryStore::new();
        store.create_profile(&new_profile("mira")).await.expect("create");
        let err = store.create_profile(&new_profile("MIRA")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_follow_is_idempotent_and_counted() {
        let store = MemoryStore::new();
        let a = store.create_profile(&new_profile("alpha")).await.expect("a");
        let b = store.create_profile(&new_profile("bravo")).await.expect("b");

        store.follow(&a.id, &b.id).await.expect("follow");
        store.follow(&a.id, &b.id).await.expect("follow again");

        assert_eq!(store.user_stats(&b.id).await.expect("stats"), UserStats::new(1, 0));
        assert_eq!(store.user_stats(&a.id).await.expect("stats"), UserStats::new(0, 1));
        assert_eq!(store.followers_of(&b.id).await.expect("followers"), vec![a.id.clone()]);
        assert!(store.is_following(&a.id, &b.id).await.expect("is_following"));
        assert!(!store.is_following(&b.id, &a.id).await.expect("is_following"));
    }

    #[tokio::test]
    async fn test_missing_profile_is_none_not_error() {
        let store = MemoryStore::new();
        assert!(store.fetch_profile("nobody").await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let store = MemoryStore::new();
        let a = store.create_profile(&new_profile("alpha")).await.expect("a");

        store.set_offline(true);
        assert!(matches!(
            store.fetch_profile(&a.id).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);

        store.fail_next_mutations(1);
        assert!(store.like_song(&a.id, "t1").await.is_err());
        assert!(store.like_song(&a.id, "t1").await.is_ok());
    }

    #[tokio::test]
    async fn test_liked_songs_push_delivers_full_list() {
        let store = MemoryStore::new();
        let a = store.create_profile(&new_profile("alpha")).await.expect("a");
        let mut rx = store
            .subscribe_liked_songs(&a.id)
            .await
            .expect("subscribe")
            .expect("push supported");
        assert!(rx.borrow().is_empty());

        store.like_song(&a.id, "t2").await.expect("like");
        store.like_song(&a.id, "t1").await.expect("like");
        rx.changed().await.expect("changed");
        assert_eq!(*rx.borrow_and_update(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn test_without_push_has_no_subscription() {
        let store = MemoryStore::without_push();
        let a = store.create_profile(&new_profile("alpha")).await.expect("a");
        assert!(store.subscribe_liked_songs(&a.id).await.expect("subscribe").is_none());
    }

    #[tokio::test]
    async fn test_suggestions_exclude_self_and_followed() {
        let store = MemoryStore::new();
        let a = store.create_profile(&new_profile("alpha")).await.expect("a");
        let b = store.create_profile(&new_profile("bravo")).await.expect("b");
        let c = store.create_profile(&new_profile("charlie")).await.expect("c");
        store.follow(&a.id, &b.id).await.expect("follow");

        let suggested = store.suggested_users(&a.id, 10).await.expect("suggested");
        let ids: Vec<&str> = suggested.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec![c.id.as_str()]);
    }

    #[tokio::test]
    async fn test_search_matches_display_name_and_name() {
        let store = MemoryStore::new();
        store.create_profile(&new_profile("alpha")).await.expect("a");
        store.create_profile(&new_profile("bravo")).await.expect("b");

        assert_eq!(store.search_users("ALP").await.expect("search").len(), 1);
        assert_eq!(store.search_users("person").await.expect("search").len(), 2);
    }

    #[tokio::test]
    async fn test_record_login_bumps_counter() {
        let store = MemoryStore::new();
        let a = store.create_profile(&new_profile("alpha")).await.expect("a");
        let after = store.record_login(&a.id).await.expect("login");
        assert_eq!(after.login_count, 1);
        assert!(after.last_login.is_some());
    }
}
