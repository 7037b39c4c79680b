//! Optimistic follow/unfollow and like/unlike.
//!
//! Each action is applied to local state first, then sent to the store. A
//! failed remote call rolls the local change back and returns the error. A
//! successful follow change triggers a background re-fetch of both users'
//! stats so the optimistic counters converge on the store's numbers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ActionError;
use crate::store::ProfileStore;
use crate::sync::{send_event, SharedCache, SharedSession, SyncEvent};

/// Result of a mutation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Applied locally and confirmed by the store
    Applied,
    /// Already in the requested state; nothing was sent
    Unchanged,
    /// The same action is still in flight
    Pending,
}

/// Marks a key as in flight until dropped.
struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

fn follow_key(follower_id: &str, followee_id: &str) -> String {
    format!("follow:{}:{}", follower_id, followee_id)
}

fn like_key(user_id: &str, track_id: &str) -> String {
    format!("like:{}:{}", user_id, track_id)
}

#[derive(Clone)]
pub struct MutationCoordinator {
    store: Arc<dyn ProfileStore>,
    session: SharedSession,
    cache: SharedCache,
    events: mpsc::Sender<SyncEvent>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl MutationCoordinator {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        session: SharedSession,
        cache: SharedCache,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            session,
            cache,
            events,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn try_begin(&self, key: String) -> Option<InFlight> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        inserted.then(|| InFlight {
            keys: self.in_flight.clone(),
            key,
        })
    }

    async fn current_user_id(&self) -> Result<String, ActionError> {
        self.session
            .read()
            .await
            .user_id()
            .map(str::to_string)
            .ok_or(ActionError::NotSignedIn)
    }

    // =========================================================================
    // Follow graph
    // =========================================================================

    pub async fn follow(&self, followee_id: &str) -> Result<MutationOutcome, ActionError> {
        self.set_following(followee_id, true).await
    }

    pub async fn unfollow(&self, followee_id: &str) -> Result<MutationOutcome, ActionError> {
        self.set_following(followee_id, false).await
    }

    async fn set_following(
        &self,
        followee_id: &str,
        follow: bool,
    ) -> Result<MutationOutcome, ActionError> {
        let followee_id = followee_id.trim();
        if followee_id.is_empty() {
            return Err(ActionError::validation("No user selected"));
        }
        let follower_id = self.current_user_id().await?;
        if follower_id == followee_id {
            return Err(ActionError::validation("You cannot follow yourself"));
        }

        let Some(_guard) = self.try_begin(follow_key(&follower_id, followee_id)) else {
            debug!(follower_id = %follower_id, followee_id, "Follow change already pending");
            return Ok(MutationOutcome::Pending);
        };

        let cached = self.cache.lock().await.load_following(&follower_id, followee_id);
        let current = match cached {
            Some(current) => current,
            None => self.store.is_following(&follower_id, followee_id).await?,
        };
        if current == follow {
            self.cache
                .lock()
                .await
                .save_following(&follower_id, followee_id, current);
            return Ok(MutationOutcome::Unchanged);
        }

        // Optimistic local change
        let delta = if follow { 1 } else { -1 };
        let (previous_follower, previous_followee) = {
            let mut cache = self.cache.lock().await;
            let previous = (cache.load_stats(&follower_id), cache.load_stats(followee_id));
            cache.save_following(&follower_id, followee_id, follow);
            cache.adjust_stats(&follower_id, |s| s.adjust_following(delta));
            cache.adjust_stats(followee_id, |s| s.adjust_followers(delta));
            previous
        };

        let result = if follow {
            self.store.follow(&follower_id, followee_id).await
        } else {
            self.store.unfollow(&follower_id, followee_id).await
        };

        if let Err(e) = result {
            warn!(follower_id = %follower_id, followee_id, follow, error = %e, "Follow change failed, rolling back");
            let mut cache = self.cache.lock().await;
            cache.save_following(&follower_id, followee_id, current);
            if let Some(stats) = previous_follower {
                cache.save_stats(&follower_id, stats);
            }
            if let Some(stats) = previous_followee {
                cache.save_stats(followee_id, stats);
            }
            return Err(e.into());
        }

        if follow {
            self.cache
                .lock()
                .await
                .remove_suggested(&follower_id, followee_id);
        }
        info!(follower_id = %follower_id, followee_id, follow, "Follow change applied");
        self.spawn_correction(follower_id, followee_id.to_string());
        Ok(MutationOutcome::Applied)
    }

    /// Re-fetch both users' stats and the edge itself, overwriting the
    /// optimistic values.
    fn spawn_correction(&self, follower_id: String, followee_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let (follower_stats, followee_stats, edge) = futures::join!(
                this.store.user_stats(&follower_id),
                this.store.user_stats(&followee_id),
                this.store.is_following(&follower_id, &followee_id),
            );

            // Held across the cache writes so a logout cannot slip in between
            let session = this.session.read().await;
            if !session.is_user(&follower_id) {
                debug!(follower_id = %follower_id, followee_id = %followee_id, "Session changed during stats correction, discarding result");
                return;
            }
            let mut cache = this.cache.lock().await;

            for (user_id, stats) in [(&follower_id, follower_stats), (&followee_id, followee_stats)] {
                match stats {
                    Ok(stats) => {
                        cache.save_stats(user_id, stats);
                        send_event(
                            &this.events,
                            SyncEvent::StatsCorrected {
                                user_id: user_id.clone(),
                                stats,
                            },
                        );
                    }
                    Err(e) => this.correction_failed(user_id, e.to_string()),
                }
            }

            match edge {
                Ok(following) => {
                    cache.save_following(&follower_id, &followee_id, following);
                    send_event(
                        &this.events,
                        SyncEvent::FollowConfirmed {
                            follower_id,
                            followee_id,
                            following,
                        },
                    );
                }
                Err(e) => this.correction_failed(&follower_id, e.to_string()),
            }
        });
    }

    fn correction_failed(&self, user_id: &str, error: String) {
        warn!(user_id, error = %error, "Stats correction failed, keeping optimistic values");
        send_event(
            &self.events,
            SyncEvent::SyncFailed {
                operation: "stats_correction",
                error,
            },
        );
    }

    // =========================================================================
    // Liked songs
    // =========================================================================

    pub async fn like(&self, track_id: &str) -> Result<MutationOutcome, ActionError> {
        self.set_liked(track_id, true).await
    }

    pub async fn unlike(&self, track_id: &str) -> Result<MutationOutcome, ActionError> {
        self.set_liked(track_id, false).await
    }

    /// Flip `track_id` in the session's liked set. Returns the new count, or
    /// `None` when it was already in the requested state.
    async fn flip_local(
        &self,
        user_id: &str,
        track_id: &str,
        like: bool,
    ) -> Result<Option<usize>, ActionError> {
        let mut session = self.session.write().await;
        if !session.is_user(user_id) {
            return Err(ActionError::NotSignedIn);
        }
        let Some(profile) = session.data.as_mut() else {
            return Err(ActionError::NotSignedIn);
        };
        let changed = if like {
            profile.liked_songs.insert(track_id.to_string())
        } else {
            profile.liked_songs.remove(track_id)
        };
        if !changed {
            return Ok(None);
        }
        let count = profile.liked_songs.len();
        if let Err(e) = session.save() {
            warn!(error = %e, "Failed to persist liked songs");
        }
        Ok(Some(count))
    }

    async fn set_liked(&self, track_id: &str, like: bool) -> Result<MutationOutcome, ActionError> {
        let track_id = track_id.trim();
        if track_id.is_empty() {
            return Err(ActionError::validation("No track selected"));
        }
        let user_id = self.current_user_id().await?;

        let Some(_guard) = self.try_begin(like_key(&user_id, track_id)) else {
            debug!(user_id = %user_id, track_id, "Like change already pending");
            return Ok(MutationOutcome::Pending);
        };

        let Some(count) = self.flip_local(&user_id, track_id, like).await? else {
            return Ok(MutationOutcome::Unchanged);
        };

        let result = if like {
            self.store.like_song(&user_id, track_id).await
        } else {
            self.store.unlike_song(&user_id, track_id).await
        };

        if let Err(e) = result {
            warn!(user_id = %user_id, track_id, like, error = %e, "Like change failed, rolling back");
            // The session may have ended meanwhile; nothing to undo then
            let _ = self.flip_local(&user_id, track_id, !like).await;
            return Err(e.into());
        }

        info!(user_id = %user_id, track_id, like, "Like change applied");
        send_event(
            &self.events,
            SyncEvent::LikedSongsChanged { user_id, count },
        );
        Ok(MutationOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::cache::{CacheTtls, SocialCache, SystemClock};
    use crate::models::{UserProfile, UserStats};
    use crate::store::{MemoryStore, StoreError};
    use crate::sync::EVENT_CHANNEL_SIZE;
    use tokio::sync::RwLock;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: SharedCache,
        session: SharedSession,
        coordinator: MutationCoordinator,
        events: mpsc::Receiver<SyncEvent>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        for (id, name) in [("user-a", "alpha"), ("user-b", "bravo"), ("user-c", "charlie")] {
            store.insert_profile(UserProfile::new(id, name)).await;
        }

        let mut session = Session::new(dir.path().to_path_buf());
        session.update(store.profile("user-a").await.expect("profile"));
        let session = Arc::new(RwLock::new(session));
        let cache = Arc::new(tokio::sync::Mutex::new(SocialCache::new(
            Arc::new(SystemClock),
            CacheTtls::default(),
        )));
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let coordinator = MutationCoordinator::new(store.clone(), session.clone(), cache.clone(), tx);

        Fixture {
            store,
            cache,
            session,
            coordinator,
            events: rx,
            _dir: dir,
        }
    }

    async fn wait_for_confirmation(events: &mut mpsc::Receiver<SyncEvent>) -> bool {
        while let Some(event) = events.recv().await {
            if let SyncEvent::FollowConfirmed { following, .. } = event {
                return following;
            }
        }
        panic!("event channel closed");
    }

    #[tokio::test]
    async fn test_follow_is_visible_immediately_and_confirmed() {
        let mut fx = fixture().await;
        fx.cache.lock().await.save_stats("user-b", UserStats::new(0, 0));

        let outcome = fx.coordinator.follow("user-b").await.expect("follow");
        assert_eq!(outcome, MutationOutcome::Applied);
        {
            let cache = fx.cache.lock().await;
            assert_eq!(cache.load_following("user-a", "user-b"), Some(true));
            assert_eq!(cache.load_stats("user-b").map(|s| s.followers), Some(1));
        }

        assert!(wait_for_confirmation(&mut fx.events).await);
        let cache = fx.cache.lock().await;
        assert_eq!(cache.load_stats("user-b"), Some(UserStats::new(1, 0)));
        assert_eq!(cache.load_stats("user-a"), Some(UserStats::new(0, 1)));
    }

    #[tokio::test]
    async fn test_second_follow_does_not_double_count() {
        let mut fx = fixture().await;
        fx.cache.lock().await.save_stats("user-b", UserStats::new(0, 0));

        fx.coordinator.follow("user-b").await.expect("follow");
        wait_for_confirmation(&mut fx.events).await;

        let outcome = fx.coordinator.follow("user-b").await.expect("follow again");
        assert_eq!(outcome, MutationOutcome::Unchanged);
        assert_eq!(
            fx.cache.lock().await.load_stats("user-b").map(|s| s.followers),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_follow_uses_store_state_on_cache_miss() {
        let fx = fixture().await;
        fx.store.follow("user-a", "user-b").await.expect("remote follow");
        let outcome = fx.coordinator.follow("user-b").await.expect("follow");
        assert_eq!(outcome, MutationOutcome::Unchanged);
        assert_eq!(fx.cache.lock().await.load_following("user-a", "user-b"), Some(true));
    }

    #[tokio::test]
    async fn test_failed_follow_rolls_back() {
        let fx = fixture().await;
        {
            let mut cache = fx.cache.lock().await;
            cache.save_following("user-a", "user-b", false);
            cache.save_stats("user-a", UserStats::new(3, 4));
            cache.save_stats("user-b", UserStats::new(7, 0));
        }
        fx.store.fail_next_mutations(1);

        let err = fx.coordinator.follow("user-b").await.unwrap_err();
        assert!(matches!(err, ActionError::Store(StoreError::Unavailable(_))));

        let cache = fx.cache.lock().await;
        assert_eq!(cache.load_following("user-a", "user-b"), Some(false));
        assert_eq!(cache.load_stats("user-a"), Some(UserStats::new(3, 4)));
        assert_eq!(cache.load_stats("user-b"), Some(UserStats::new(7, 0)));
        assert!(!fx.store.is_following("user-a", "user-b").await.expect("edge"));
    }

    #[tokio::test]
    async fn test_unfollow_reverses_follow() {
        let mut fx = fixture().await;
        fx.coordinator.follow("user-c").await.expect("follow");
        wait_for_confirmation(&mut fx.events).await;

        let outcome = fx.coordinator.unfollow("user-c").await.expect("unfollow");
        assert_eq!(outcome, MutationOutcome::Applied);
        assert!(!wait_for_confirmation(&mut fx.events).await);
        assert_eq!(
            fx.cache.lock().await.load_stats("user-c"),
            Some(UserStats::new(0, 0))
        );
    }

    #[tokio::test]
    async fn test_correction_after_session_ends_leaves_cache_alone() {
        let fx = fixture().await;
        fx.cache.lock().await.save_following("user-a", "user-b", false);

        fx.coordinator.follow("user-b").await.expect("follow");
        // Sign out before the correction task gets to run
        fx.session.write().await.data = None;
        fx.cache.lock().await.invalidate_user("user-a");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let cache = fx.cache.lock().await;
        assert_eq!(cache.load_following("user-a", "user-b"), None);
        assert_eq!(cache.load_stats("user-a"), None);
        assert_eq!(cache.load_stats("user-b"), None);
    }

    #[tokio::test]
    async fn test_follow_validation() {
        let fx = fixture().await;
        assert!(matches!(
            fx.coordinator.follow("user-a").await,
            Err(ActionError::Validation(_))
        ));
        assert!(matches!(
            fx.coordinator.follow("   ").await,
            Err(ActionError::Validation(_))
        ));
        assert_eq!(fx.store.request_count(), 0);

        fx.session.write().await.data = None;
        assert!(matches!(
            fx.coordinator.follow("user-b").await,
            Err(ActionError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn test_pending_while_in_flight() {
        let fx = fixture().await;
        let guard = fx
            .coordinator
            .try_begin(follow_key("user-a", "user-b"))
            .expect("first claim");
        assert_eq!(
            fx.coordinator.follow("user-b").await.expect("follow"),
            MutationOutcome::Pending
        );
        // Other keys are independent
        fx.cache.lock().await.save_following("user-a", "user-c", false);
        assert_eq!(
            fx.coordinator.follow("user-c").await.expect("follow"),
            MutationOutcome::Applied
        );

        drop(guard);
        assert_eq!(
            fx.coordinator.follow("user-b").await.expect("follow"),
            MutationOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_like_and_unlike() {
        let mut fx = fixture().await;

        assert_eq!(
            fx.coordinator.like("track-9").await.expect("like"),
            MutationOutcome::Applied
        );
        assert!(fx.session.read().await.data.as_ref().expect("session").has_liked("track-9"));
        assert!(fx.store.profile("user-a").await.expect("profile").has_liked("track-9"));
        assert_eq!(
            fx.events.recv().await,
            Some(SyncEvent::LikedSongsChanged {
                user_id: "user-a".into(),
                count: 1
            })
        );

        assert_eq!(
            fx.coordinator.like("track-9").await.expect("like again"),
            MutationOutcome::Unchanged
        );
        assert_eq!(
            fx.coordinator.unlike("track-9").await.expect("unlike"),
            MutationOutcome::Applied
        );
        assert_eq!(
            fx.session.read().await.data.as_ref().expect("session").liked_count(),
            0
        );
    }

    #[tokio::test]
    async fn test_failed_like_rolls_back() {
        let fx = fixture().await;
        fx.store.fail_next_mutations(1);

        assert!(fx.coordinator.like("track-9").await.is_err());
        assert!(!fx.session.read().await.data.as_ref().expect("session").has_liked("track-9"));
        assert!(!fx.store.profile("user-a").await.expect("profile").has_liked("track-9"));
    }
}
