//! Remote profile store boundary.
//!
//! `ProfileStore` is the only way the rest of the crate talks to the
//! document store holding profiles, follow edges and liked songs.
//!
//! - `HttpProfileStore`: JSON-over-HTTP client with rate-limit backoff
//! - `MemoryStore`: in-process store with push subscriptions, used for
//!   tests and the CLI demo mode

pub mod client;
pub mod error;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::models::{NewProfile, ProfileUpdate, UserProfile, UserStats, UserSummary};

pub use client::HttpProfileStore;
pub use error::StoreError;
pub use memory::MemoryStore;

/// Client-side contract of the remote profile store.
///
/// Follow, unfollow and stat reads are idempotent and safe to retry.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch a profile; `Ok(None)` is the explicit "not found" signal.
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;

    async fn find_by_display_name(
        &self,
        display_name: &str,
    ) -> Result<Option<UserProfile>, StoreError>;

    async fn create_profile(&self, profile: &NewProfile) -> Result<UserProfile, StoreError>;

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<UserProfile, StoreError>;

    /// Stamp `last_login` and bump `login_count`, returning the new record.
    async fn record_login(&self, user_id: &str) -> Result<UserProfile, StoreError>;

    async fn is_following(&self, follower_id: &str, followee_id: &str) -> Result<bool, StoreError>;

    async fn follow(&self, follower_id: &str, followee_id: &str) -> Result<(), StoreError>;

    async fn unfollow(&self, follower_id: &str, followee_id: &str) -> Result<(), StoreError>;

    async fn followers_of(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn following_of(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn user_stats(&self, user_id: &str) -> Result<UserStats, StoreError>;

    async fn liked_songs(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn like_song(&self, user_id: &str, track_id: &str) -> Result<(), StoreError>;

    async fn unlike_song(&self, user_id: &str, track_id: &str) -> Result<(), StoreError>;

    async fn suggested_users(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<UserSummary>, StoreError>;

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, StoreError>;

    /// Push subscription to a user's liked songs. Each change delivers the
    /// full current list. `None` means the store only supports polling.
    async fn subscribe_liked_songs(
        &self,
        _user_id: &str,
    ) -> Result<Option<watch::Receiver<Vec<String>>>, StoreError> {
        Ok(None)
    }
}
