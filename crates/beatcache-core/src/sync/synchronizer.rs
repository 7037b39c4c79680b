//! Session/profile synchronizer.
//!
//! The persisted session is trusted immediately at start-up and then checked
//! against the store in the background. A profile that no longer exists
//! remotely tears the session down; any other failure leaves the local copy
//! in place until the next successful fetch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{send_event, SharedCache, SharedSession, SyncEvent, SyncHandle};
use crate::error::ActionError;
use crate::models::{NewProfile, ProfileUpdate, UserProfile};
use crate::store::{ProfileStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    NoSession,
    Unchanged,
    Refreshed,
    Revoked,
    /// Remote error; local state kept
    Failed,
    /// The session switched users while the fetch was in flight
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileMode {
    /// Replace the whole local profile with the remote one
    Full,
    /// Replace only when display name, bio or image differ; keep the local
    /// liked songs, which the liked-songs feed owns
    WatchedFields,
}

#[derive(Clone)]
pub struct ProfileSynchronizer {
    store: Arc<dyn ProfileStore>,
    session: SharedSession,
    cache: SharedCache,
    events: mpsc::Sender<SyncEvent>,
}

fn map_conflict(e: StoreError) -> ActionError {
    match e {
        StoreError::Conflict(_) => ActionError::validation("Display name is already taken"),
        other => ActionError::Store(other),
    }
}

impl ProfileSynchronizer {
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
        }
    }

    pub async fn current_user(&self) -> Option<UserProfile> {
        self.session.read().await.data.clone()
    }

    // =========================================================================
    // Start-up
    // =========================================================================

    /// Make the persisted session active without contacting the store.
    pub async fn restore(&self) -> Option<UserProfile> {
        let mut session = self.session.write().await;
        match session.load() {
            Ok(true) => {}
            Ok(false) => {
                debug!("No persisted session");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session");
                if let Err(e) = session.clear() {
                    warn!(error = %e, "Failed to remove unreadable session");
                }
                return None;
            }
        }
        let profile = session.data.clone()?;
        drop(session);

        info!(user_id = %profile.id, "Session restored from disk");
        send_event(&self.events, SyncEvent::SessionRestored(profile.clone()));
        Some(profile)
    }

    /// Check the restored session against the store in the background.
    pub fn spawn_startup_reconcile(&self) -> JoinHandle<ReconcileOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.reconcile(ReconcileMode::Full).await })
    }

    /// Fetch the authoritative profile now and overwrite the local copy.
    pub async fn reconcile_now(&self) -> ReconcileOutcome {
        self.reconcile(ReconcileMode::Full).await
    }

    /// Poll the store on `interval` until the session ends or the handle is
    /// dropped. The first check happens one interval from now.
    pub fn spawn_periodic(&self, interval: Duration) -> SyncHandle {
        let this = self.clone();
        SyncHandle::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match this.reconcile(ReconcileMode::WatchedFields).await {
                    ReconcileOutcome::NoSession | ReconcileOutcome::Revoked => {
                        debug!("Session gone, stopping periodic reconciliation");
                        break;
                    }
                    outcome => debug!(?outcome, "Periodic reconciliation"),
                }
            }
        }))
    }

    async fn reconcile(&self, mode: ReconcileMode) -> ReconcileOutcome {
        let user_id = match self.session.read().await.user_id() {
            Some(id) => id.to_string(),
            None => return ReconcileOutcome::NoSession,
        };

        match self.store.fetch_profile(&user_id).await {
            Ok(Some(remote)) => self.apply_remote(&user_id, remote, mode).await,
            Ok(None) => self.revoke(&user_id).await,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Profile reconciliation failed, keeping local copy");
                send_event(
                    &self.events,
                    SyncEvent::SyncFailed {
                        operation: "reconcile",
                        error: e.to_string(),
                    },
                );
                ReconcileOutcome::Failed
            }
        }
    }

    async fn apply_remote(
        &self,
        user_id: &str,
        mut remote: UserProfile,
        mode: ReconcileMode,
    ) -> ReconcileOutcome {
        let mut session = self.session.write().await;
        if !session.is_user(user_id) {
            debug!(user_id, "Session changed during reconciliation, discarding result");
            return ReconcileOutcome::Superseded;
        }
        let Some(local) = session.data.as_ref() else {
            return ReconcileOutcome::NoSession;
        };

        let changed = match mode {
            ReconcileMode::Full => *local != remote,
            ReconcileMode::WatchedFields => {
                let differs = local.sync_fields_differ(&remote);
                remote.liked_songs = local.liked_songs.clone();
                differs
            }
        };
        if !changed {
            return ReconcileOutcome::Unchanged;
        }

        session.update(remote.clone());
        if let Err(e) = session.save() {
            warn!(error = %e, "Failed to persist refreshed session");
        }
        drop(session);

        info!(user_id, "Session refreshed from remote profile");
        send_event(&self.events, SyncEvent::SessionRefreshed(remote));
        ReconcileOutcome::Refreshed
    }

    async fn revoke(&self, user_id: &str) -> ReconcileOutcome {
        let mut session = self.session.write().await;
        if !session.is_user(user_id) {
            return ReconcileOutcome::Superseded;
        }
        if let Err(e) = session.clear() {
            warn!(error = %e, "Failed to remove persisted session");
        }
        drop(session);

        self.cache.lock().await.invalidate_user(user_id);
        warn!(user_id, "Remote profile no longer exists, session revoked");
        send_event(
            &self.events,
            SyncEvent::SessionRevoked {
                user_id: user_id.to_string(),
            },
        );
        ReconcileOutcome::Revoked
    }

    // =========================================================================
    // Login / sign-up / logout
    // =========================================================================

    pub async fn login(&self, display_name: &str, passkey: &str) -> Result<UserProfile, ActionError> {
        let display_name = display_name.trim();
        if display_name.is_empty() || passkey.is_empty() {
            return Err(ActionError::validation("Display name and passkey required"));
        }

        // Unknown names and wrong passkeys look the same to the caller
        let profile = self
            .store
            .find_by_display_name(display_name)
            .await?
            .ok_or(ActionError::CredentialMismatch)?;
        if !profile.passkey_matches(passkey) {
            warn!(display_name, "Login rejected");
            return Err(ActionError::CredentialMismatch);
        }

        let profile = self.record_login(profile).await;
        self.begin_session(profile.clone()).await;
        Ok(profile)
    }

    pub async fn sign_up(&self, new: &NewProfile) -> Result<UserProfile, ActionError> {
        new.validate()?;
        if self
            .store
            .find_by_display_name(&new.display_name)
            .await?
            .is_some()
        {
            return Err(ActionError::validation("Display name is already taken"));
        }

        let created = self.store.create_profile(new).await.map_err(map_conflict)?;
        info!(user_id = %created.id, "Profile created");

        let profile = self.record_login(created).await;
        self.begin_session(profile.clone()).await;
        Ok(profile)
    }

    /// Stamp the login remotely; a failure still lets the user in.
    async fn record_login(&self, profile: UserProfile) -> UserProfile {
        match self.store.record_login(&profile.id).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(user_id = %profile.id, error = %e, "Failed to record login");
                profile
            }
        }
    }

    async fn begin_session(&self, profile: UserProfile) {
        let mut session = self.session.write().await;
        if let Some(previous) = session.user_id() {
            if previous != profile.id {
                debug!(previous, "Replacing session for another user");
            }
        }
        session.update(profile.clone());
        if let Err(e) = session.save() {
            warn!(error = %e, "Failed to save session");
        }
        drop(session);

        info!(user_id = %profile.id, "Login successful");
        send_event(&self.events, SyncEvent::SessionStarted(profile));
    }

    pub async fn logout(&self) -> Result<(), ActionError> {
        let mut session = self.session.write().await;
        let user_id = session
            .user_id()
            .map(str::to_string)
            .ok_or(ActionError::NotSignedIn)?;
        if let Err(e) = session.clear() {
            warn!(error = %e, "Failed to remove persisted session");
        }
        drop(session);

        self.cache.lock().await.invalidate_user(&user_id);
        info!(user_id = %user_id, "Logged out");
        send_event(&self.events, SyncEvent::SessionEnded { user_id });
        Ok(())
    }

    // =========================================================================
    // Profile edits
    // =========================================================================

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, ActionError> {
        update.validate()?;
        let user_id = self
            .session
            .read()
            .await
            .user_id()
            .map(str::to_string)
            .ok_or(ActionError::NotSignedIn)?;

        let mut remote = match self.store.update_profile(&user_id, update).await {
            Ok(profile) => profile,
            Err(StoreError::NotFound(msg)) => {
                self.revoke(&user_id).await;
                return Err(ActionError::Store(StoreError::NotFound(msg)));
            }
            Err(e) => return Err(map_conflict(e)),
        };

        let mut session = self.session.write().await;
        if session.is_user(&user_id) {
            if let Some(ref local) = session.data {
                remote.liked_songs = local.liked_songs.clone();
            }
            session.update(remote.clone());
            if let Err(e) = session.save() {
                warn!(error = %e, "Failed to persist updated profile");
            }
        }
        drop(session);

        send_event(&self.events, SyncEvent::SessionRefreshed(remote.clone()));
        Ok(remote)
    }
}
