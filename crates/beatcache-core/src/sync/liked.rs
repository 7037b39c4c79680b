//! Liked-songs feed for the signed-in user.
//!
//! Listens to the store's push subscription when it has one and polls on a
//! fixed interval either way. Both paths feed the same sink, which only
//! touches the session when the set actually changed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{send_event, SharedSession, SyncEvent, SyncHandle};
use crate::store::ProfileStore;

#[derive(Clone)]
pub struct LikedSongsFeed {
    store: Arc<dyn ProfileStore>,
    session: SharedSession,
    events: mpsc::Sender<SyncEvent>,
}

/// Wait for the next pushed list. Resolves to `None` once the publisher is
/// gone and never resolves without a subscription.
async fn next_push(push: &mut Option<watch::Receiver<Vec<String>>>) -> Option<Vec<String>> {
    match push {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

impl LikedSongsFeed {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        session: SharedSession,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            session,
            events,
        }
    }

    /// Follow `user_id`'s liked songs until the session moves to someone
    /// else or the handle is dropped. The first poll runs immediately.
    pub fn spawn(self, user_id: String, poll_interval: Duration) -> SyncHandle {
        SyncHandle::new(tokio::spawn(async move {
            self.run(&user_id, poll_interval).await;
        }))
    }

    async fn run(&self, user_id: &str, poll_interval: Duration) {
        let mut push = match self.store.subscribe_liked_songs(user_id).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(user_id, error = %e, "Liked songs subscription failed, polling only");
                None
            }
        };
        if push.is_none() {
            debug!(user_id, "No push subscription for liked songs");
        }

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut push_closed = false;
            let update = tokio::select! {
                pushed = next_push(&mut push) => {
                    if pushed.is_none() {
                        push_closed = true;
                    }
                    pushed
                }
                _ = ticker.tick() => self.poll(user_id).await,
            };

            if push_closed {
                debug!(user_id, "Liked songs subscription closed, polling only");
                push = None;
            }

            if let Some(tracks) = update {
                if !self.apply(user_id, tracks).await {
                    debug!(user_id, "Session ended, stopping liked songs feed");
                    break;
                }
            } else if !self.session.read().await.is_user(user_id) {
                break;
            }
        }
    }

    async fn poll(&self, user_id: &str) -> Option<Vec<String>> {
        match self.store.liked_songs(user_id).await {
            Ok(tracks) => Some(tracks),
            Err(e) => {
                warn!(user_id, error = %e, "Liked songs poll failed");
                send_event(
                    &self.events,
                    SyncEvent::SyncFailed {
                        operation: "liked_songs",
                        error: e.to_string(),
                    },
                );
                None
            }
        }
    }

    /// Store the list on the session. Returns false when the session no
    /// longer belongs to `user_id`.
    async fn apply(&self, user_id: &str, tracks: Vec<String>) -> bool {
        let incoming: BTreeSet<String> = tracks.into_iter().collect();

        let mut session = self.session.write().await;
        if !session.is_user(user_id) {
            return false;
        }
        let Some(profile) = session.data.as_mut() else {
            return false;
        };
        if profile.liked_songs == incoming {
            return true;
        }
        profile.liked_songs = incoming;
        let count = profile.liked_songs.len();
        if let Err(e) = session.save() {
            warn!(error = %e, "Failed to persist liked songs");
        }
        drop(session);

        info!(user_id, count, "Liked songs updated");
        send_event(
            &self.events,
            SyncEvent::LikedSongsChanged {
                user_id: user_id.to_string(),
                count,
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::models::UserProfile;
    use crate::store::MemoryStore;
    use crate::sync::EVENT_CHANNEL_SIZE;
    use tokio::sync::RwLock;

    async fn signed_in(
        store: &Arc<MemoryStore>,
        dir: &tempfile::TempDir,
    ) -> (SharedSession, UserProfile) {
        let mut profile = UserProfile::new("user-7", "mira");
        profile.passkey = "pass1234".into();
        store.insert_profile(profile.clone()).await;

        let mut session = Session::new(dir.path().to_path_buf());
        session.update(profile.clone());
        (Arc::new(RwLock::new(session)), profile)
    }

    fn liked_counts(events: &mut mpsc::Receiver<SyncEvent>) -> Vec<usize> {
        let mut counts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::LikedSongsChanged { count, .. } = event {
                counts.push(count);
            }
        }
        counts
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_updates_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let (session, profile) = signed_in(&store, &dir).await;
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let _handle = LikedSongsFeed::new(store.clone(), session.clone(), tx)
            .spawn(profile.id.clone(), Duration::from_secs(3600));
        tokio::task::yield_now().await;

        store.like_song(&profile.id, "track-1").await.expect("like");
        store.like_song(&profile.id, "track-2").await.expect("like");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let local = session.read().await.data.clone().expect("session");
        assert!(local.has_liked("track-1"));
        assert!(local.has_liked("track-2"));
        assert_eq!(liked_counts(&mut rx).last(), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_only_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::without_push());
        let (session, profile) = signed_in(&store, &dir).await;
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let _handle = LikedSongsFeed::new(store.clone(), session.clone(), tx)
            .spawn(profile.id.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Initial poll saw an empty list that matched the session
        assert!(liked_counts(&mut rx).is_empty());

        store.like_song(&profile.id, "track-1").await.expect("like");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!session.read().await.data.as_ref().expect("session").has_liked("track-1"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(session.read().await.data.as_ref().expect("session").has_liked("track-1"));
        assert_eq!(liked_counts(&mut rx), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_session_changes_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let (session, profile) = signed_in(&store, &dir).await;
        let (tx, _rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let handle = LikedSongsFeed::new(store.clone(), session.clone(), tx)
            .spawn(profile.id.clone(), Duration::from_secs(60));
        tokio::task::yield_now().await;

        session.write().await.update(UserProfile::new("user-8", "nova"));
        store.like_song(&profile.id, "track-1").await.expect("like");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_finished());
        assert!(!session.read().await.data.as_ref().expect("session").has_liked("track-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_keeps_local_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::without_push());
        let (session, profile) = signed_in(&store, &dir).await;
        session
            .write()
            .await
            .data
            .as_mut()
            .expect("session")
            .liked_songs
            .insert("local-only".into());
        store.set_offline(true);
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let _handle = LikedSongsFeed::new(store.clone(), session.clone(), tx)
            .spawn(profile.id.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(session.read().await.data.as_ref().expect("session").has_liked("local-only"));
        assert!(matches!(
            rx.try_recv(),
            Ok(SyncEvent::SyncFailed { operation: "liked_songs", .. })
        ));
    }
}
