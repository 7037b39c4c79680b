//! Service object for the signed-in listener.
//!
//! `UserContext` wires the profile store, the persisted session, the social
//! cache, the synchronizer and the mutation coordinator together. Front ends
//! construct one explicitly and drain its `SyncEvent` channel to learn about
//! changes made in the background.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::auth::{AdminGate, CredentialStore, Session, SessionVault};
use crate::cache::{SocialCache, SystemClock};
use crate::config::{Config, SyncSettings};
use crate::error::ActionError;
use crate::models::{NewProfile, ProfileUpdate, UserProfile, UserStats, UserSummary};
use crate::mutation::{MutationCoordinator, MutationOutcome};
use crate::store::{HttpProfileStore, ProfileStore};
use crate::sync::{
    LikedSongsFeed, ProfileSynchronizer, ReconcileOutcome, SharedCache, SharedSession, SyncEvent,
    SyncHandle, EVENT_CHANNEL_SIZE,
};

/// Number of suggested users requested when the caller has no preference.
pub const DEFAULT_SUGGESTION_LIMIT: usize = 10;

pub struct UserContext {
    store: Arc<dyn ProfileStore>,
    session: SharedSession,
    cache: SharedCache,
    settings: SyncSettings,
    admin: AdminGate,

    synchronizer: ProfileSynchronizer,
    mutations: MutationCoordinator,

    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: Option<mpsc::Receiver<SyncEvent>>,
    background: Vec<SyncHandle>,
}

impl UserContext {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        session: Session,
        cache: SocialCache,
        settings: SyncSettings,
    ) -> Self {
        let session = Arc::new(RwLock::new(session));
        let cache = Arc::new(Mutex::new(cache));
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let synchronizer =
            ProfileSynchronizer::new(store.clone(), session.clone(), cache.clone(), tx.clone());
        let mutations =
            MutationCoordinator::new(store.clone(), session.clone(), cache.clone(), tx.clone());
        let admin = AdminGate::new(None, settings.admin_token_ttl(), Arc::new(SystemClock));

        Self {
            store,
            session,
            cache,
            settings,
            admin,
            synchronizer,
            mutations,
            events_tx: tx,
            events_rx: Some(rx),
            background: Vec::new(),
        }
    }

    /// Gate admin-only views behind a password hash.
    pub fn with_admin(mut self, admin: AdminGate) -> Self {
        self.admin = admin;
        self
    }

    /// Build a context talking to the configured HTTP store.
    pub fn from_config(config: &Config) -> Result<Self> {
        let server_url = config
            .server_url
            .as_deref()
            .context("No server URL configured (set BEATCACHE_SERVER_URL)")?;
        let mut store = HttpProfileStore::new(server_url)?;
        if let Some(ref key) = config.api_key {
            store = store.with_api_key(key.clone());
        }
        Ok(Self::from_config_with_store(config, Arc::new(store)))
    }

    /// Build a context with local state laid out per `config` but talking to
    /// `store`.
    pub fn from_config_with_store(config: &Config, store: Arc<dyn ProfileStore>) -> Self {
        let cache_dir = config.cache_dir().unwrap_or_else(|_| PathBuf::from("./cache"));
        debug!(?cache_dir, "Cache directory configured");

        let mut session = Session::new(cache_dir.clone());
        if config.encrypt_session {
            match CredentialStore::vault_secret().and_then(|secret| SessionVault::new(&secret)) {
                Ok(vault) => session = session.with_vault(vault),
                Err(e) => warn!(error = %e, "Session vault unavailable, storing session unencrypted"),
            }
        }

        let cache = SocialCache::new(Arc::new(SystemClock), config.sync.cache_ttls())
            .with_snapshot_dir(cache_dir);
        let admin = AdminGate::new(
            config.admin_password_hash.clone(),
            config.sync.admin_token_ttl(),
            Arc::new(SystemClock),
        );

        Self::new(store, session, cache, config.sync).with_admin(admin)
    }

    /// Hand the event receiver to the caller. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events_rx.take()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore the cache snapshot and the persisted session, then check the
    /// session against the store in the background.
    pub async fn start(&mut self) -> Option<UserProfile> {
        let restored = self.cache.lock().await.load_snapshot_or_discard();
        debug!(restored, "Cache snapshot loaded");

        let profile = self.synchronizer.restore().await?;
        // Detached; the outcome arrives as an event
        drop(self.synchronizer.spawn_startup_reconcile());
        Some(profile)
    }

    /// Fetch the authoritative profile now.
    pub async fn reconcile_now(&self) -> ReconcileOutcome {
        self.synchronizer.reconcile_now().await
    }

    /// Start periodic reconciliation and the liked-songs feed for the
    /// current user. Returns false when nobody is signed in.
    pub async fn start_background_sync(&mut self) -> bool {
        self.stop_background_sync();
        let Some(user_id) = self.session.read().await.user_id().map(str::to_string) else {
            return false;
        };

        info!(user_id = %user_id, "Starting background sync");
        let periodic = self
            .synchronizer
            .spawn_periodic(self.settings.profile_poll_interval());
        let liked = LikedSongsFeed::new(self.store.clone(), self.session.clone(), self.events_tx.clone())
            .spawn(user_id, self.settings.liked_poll_interval());
        self.background = vec![periodic, liked];
        true
    }

    pub fn stop_background_sync(&mut self) {
        if !self.background.is_empty() {
            debug!("Stopping background sync");
        }
        self.background.clear();
    }

    pub fn is_syncing(&self) -> bool {
        self.background.iter().any(|h| !h.is_finished())
    }

    /// Write the live cache entries to disk.
    pub async fn persist_cache(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.clear_expired();
        cache.save_snapshot()
    }

    // =========================================================================
    // Session
    // =========================================================================

    pub async fn current_user(&self) -> Option<UserProfile> {
        self.synchronizer.current_user().await
    }

    pub async fn login(&mut self, display_name: &str, passkey: &str) -> Result<UserProfile, ActionError> {
        let profile = self.synchronizer.login(display_name, passkey).await?;
        self.restart_background_sync().await;
        Ok(profile)
    }

    pub async fn sign_up(&mut self, new: &NewProfile) -> Result<UserProfile, ActionError> {
        let profile = self.synchronizer.sign_up(new).await?;
        self.restart_background_sync().await;
        Ok(profile)
    }

    pub async fn logout(&mut self) -> Result<(), ActionError> {
        self.stop_background_sync();
        self.admin.lock();
        self.synchronizer.logout().await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, ActionError> {
        self.synchronizer.update_profile(update).await
    }

    /// Background work follows the session to its new owner.
    async fn restart_background_sync(&mut self) {
        if !self.background.is_empty() {
            self.start_background_sync().await;
        }
    }

    async fn require_user_id(&self) -> Result<String, ActionError> {
        self.session
            .read()
            .await
            .user_id()
            .map(str::to_string)
            .ok_or(ActionError::NotSignedIn)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub async fn follow(&self, user_id: &str) -> Result<MutationOutcome, ActionError> {
        self.mutations.follow(user_id).await
    }

    pub async fn unfollow(&self, user_id: &str) -> Result<MutationOutcome, ActionError> {
        self.mutations.unfollow(user_id).await
    }

    pub async fn like(&self, track_id: &str) -> Result<MutationOutcome, ActionError> {
        self.mutations.like(track_id).await
    }

    pub async fn unlike(&self, track_id: &str) -> Result<MutationOutcome, ActionError> {
        self.mutations.unlike(track_id).await
    }

    // =========================================================================
    // Read-through queries
    // =========================================================================

    /// Whether the current user follows `user_id`.
    pub async fn is_following(&self, user_id: &str) -> Result<bool, ActionError> {
        let me = self.require_user_id().await?;
        if let Some(following) = self.cache.lock().await.load_following(&me, user_id) {
            return Ok(following);
        }
        let following = self.store.is_following(&me, user_id).await?;
        self.cache.lock().await.save_following(&me, user_id, following);
        Ok(following)
    }

    pub async fn user_stats(&self, user_id: &str) -> Result<UserStats, ActionError> {
        if let Some(stats) = self.cache.lock().await.load_stats(user_id) {
            return Ok(stats);
        }
        let stats = self.store.user_stats(user_id).await?;
        self.cache.lock().await.save_stats(user_id, stats);
        Ok(stats)
    }

    /// Age of the cached stats for `user_id`, e.g. "2m ago".
    pub async fn stats_age(&self, user_id: &str) -> Option<String> {
        self.cache.lock().await.stats_age(user_id)
    }

    /// Users the current user might follow, excluding themselves and anyone
    /// they already follow.
    ///
    /// The cached list is reused while it still covers `limit`, or while the
    /// store had nobody further to offer when it was fetched.
    pub async fn suggested_users(&self, limit: usize) -> Result<Vec<UserSummary>, ActionError> {
        let me = self.require_user_id().await?;
        let cached = self.cache.lock().await.load_suggestions(&me);
        if let Some(page) = cached {
            let users = self.eligible_suggestions(&me, page.users).await;
            if page.exhausted || users.len() >= limit {
                return Ok(users.into_iter().take(limit).collect());
            }
            debug!(user_id = %me, cached = users.len(), limit, "Cached suggestions too short, refetching");
        }

        let requested = limit.max(DEFAULT_SUGGESTION_LIMIT);
        let fetched = self.store.suggested_users(&me, requested).await?;
        self.cache
            .lock()
            .await
            .save_suggestions(&me, fetched.clone(), requested);
        let users = self.eligible_suggestions(&me, fetched).await;
        Ok(users.into_iter().take(limit).collect())
    }

    async fn eligible_suggestions(&self, me: &str, users: Vec<UserSummary>) -> Vec<UserSummary> {
        let cache = self.cache.lock().await;
        users
            .into_iter()
            .filter(|u| u.id != me && cache.load_following(me, &u.id) != Some(true))
            .collect()
    }

    /// Search users by display name or name. A blank query matches nobody.
    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ActionError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        if let Some(users) = self.cache.lock().await.load_search(query) {
            return Ok(users);
        }
        let users = self.store.search_users(query.trim()).await?;
        self.cache.lock().await.save_search(query, users.clone());
        Ok(users)
    }

    pub async fn followers_of(&self, user_id: &str) -> Result<Vec<String>, ActionError> {
        Ok(self.store.followers_of(user_id).await?)
    }

    pub async fn following_of(&self, user_id: &str) -> Result<Vec<String>, ActionError> {
        Ok(self.store.following_of(user_id).await?)
    }

    /// The current user's liked tracks; empty when signed out.
    pub async fn liked_songs(&self) -> Vec<String> {
        self.session
            .read()
            .await
            .data
            .as_ref()
            .map(|p| p.liked_songs.iter().cloned().collect())
            .unwrap_or_default()
    }

    // =========================================================================
    // Admin
    // =========================================================================

    pub fn unlock_admin(&mut self, password: &str) -> Result<String, ActionError> {
        self.admin.unlock(password)
    }

    pub fn is_admin(&self, token: &str) -> bool {
        self.admin.is_unlocked(token)
    }
}
