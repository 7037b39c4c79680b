//! Reconciliation of local state against the remote profile store.
//!
//! - `ProfileSynchronizer`: start-up restore, login/logout, periodic poll
//! - `LikedSongsFeed`: push subscription with a fallback poll
//!
//! Background work runs in spawned tokio tasks and reports what it changed
//! as `SyncEvent`s on an mpsc channel. Errors in background work are logged
//! and swallowed; the previous local state stays in place.

pub mod liked;
pub mod synchronizer;

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::Session;
use crate::cache::SocialCache;
use crate::models::{UserProfile, UserStats};

pub use liked::LikedSongsFeed;
pub use synchronizer::{ProfileSynchronizer, ReconcileOutcome};

/// Buffer size for the sync event channel.
pub const EVENT_CHANNEL_SIZE: usize = 32;

pub type SharedSession = Arc<RwLock<Session>>;
pub type SharedCache = Arc<Mutex<SocialCache>>;

/// State changes made by the sync layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Persisted session made active at start-up, before any remote check
    SessionRestored(UserProfile),
    SessionStarted(UserProfile),
    /// Authoritative profile replaced the local copy
    SessionRefreshed(UserProfile),
    /// Remote profile no longer exists; the session was torn down
    SessionRevoked { user_id: String },
    SessionEnded { user_id: String },
    LikedSongsChanged { user_id: String, count: usize },
    StatsCorrected { user_id: String, stats: UserStats },
    FollowConfirmed { follower_id: String, followee_id: String, following: bool },
    SyncFailed { operation: &'static str, error: String },
}

/// Deliver an event without blocking background work. A full or closed
/// channel drops the event.
pub(crate) fn send_event(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(?event, "Sync event channel full, dropping event");
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Sync event receiver dropped");
        }
    }
}

/// Owns a background task; dropping the handle stops it.
#[derive(Debug)]
pub struct SyncHandle {
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
