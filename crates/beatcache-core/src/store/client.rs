//! HTTP client for the remote profile store.
//!
//! The store speaks JSON with camelCase field names. Requests that the
//! store rate-limits are retried with exponential backoff; transport
//! failures on idempotent requests get a fixed-delay retry.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ProfileStore, StoreError};
use crate::models::{NewProfile, ProfileUpdate, UserProfile, UserStats, UserSummary};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Retries for transport failures on idempotent requests.
const MAX_TRANSPORT_RETRIES: u32 = 2;

/// Fixed delay between transport retries.
const TRANSPORT_RETRY_DELAY_MS: u64 = 500;

/// Header carrying the project API key, when one is configured.
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
struct FollowStatusResponse {
    following: bool,
}

#[derive(Debug, Serialize)]
struct EmptyBody {}

/// JSON/HTTP implementation of `ProfileStore`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpProfileStore {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpProfileStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid profile store URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Profile store URL cannot be used as a base: {}", base_url);
        }

        Ok(Self {
            client,
            base_url,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Build `{base}/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if let Some(ref key) = self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
    }

    /// Send a request, retrying on 429 with backoff and, for idempotent
    /// requests, on transport errors with a fixed delay.
    async fn send(
        &self,
        build: impl Fn() -> RequestBuilder,
        idempotent: bool,
    ) -> Result<Response, StoreError> {
        let mut rate_limit_retries = 0;
        let mut transport_retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = match build().send().await {
                Ok(response) => response,
                Err(e) if idempotent && transport_retries < MAX_TRANSPORT_RETRIES => {
                    transport_retries += 1;
                    warn!(error = %e, retry = transport_retries, "Request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(TRANSPORT_RETRY_DELAY_MS)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if response.status().is_success() {
                return Ok(response);
            }

            if response.status().as_u16() == 429 {
                rate_limit_retries += 1;
                if rate_limit_retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(StoreError::RateLimited);
                }
                warn!(
                    url = %response.url(),
                    retry = rate_limit_retries,
                    backoff_ms,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }

            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::from_status(status, &body));
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
        let url = response.url().clone();
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::InvalidResponse(format!("{} from {}", e, url)))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, StoreError> {
        let response = self.send(|| self.request(Method::GET, url.clone()), true).await?;
        Self::parse(response).await
    }

    async fn send_json<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        method: Method,
        url: Url,
        body: &B,
        idempotent: bool,
    ) -> Result<T, StoreError> {
        let response = self
            .send(|| self.request(method.clone(), url.clone()).json(body), idempotent)
            .await?;
        Self::parse(response).await
    }

    async fn send_empty(&self, method: Method, url: Url) -> Result<(), StoreError> {
        self.send(|| self.request(method.clone(), url.clone()), true)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for HttpProfileStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        match self.get_json(self.endpoint(&["users", user_id])).await {
            Ok(profile) => Ok(Some(profile)),
            Err(StoreError::NotFound(_)) => {
                debug!(user_id, "Profile not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_by_display_name(
        &self,
        display_name: &str,
    ) -> Result<Option<UserProfile>, StoreError> {
        let mut url = self.endpoint(&["users"]);
        url.query_pairs_mut().append_pair("displayName", display_name);
        let matches: Vec<UserProfile> = self.get_json(url).await?;
        Ok(matches
            .into_iter()
            .find(|p| p.display_name.eq_ignore_ascii_case(display_name)))
    }

    async fn create_profile(&self, profile: &NewProfile) -> Result<UserProfile, StoreError> {
        self.send_json(Method::POST, self.endpoint(&["users"]), profile, false)
            .await
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<UserProfile, StoreError> {
        self.send_json(Method::PATCH, self.endpoint(&["users", user_id]), update, true)
            .await
    }

    async fn record_login(&self, user_id: &str) -> Result<UserProfile, StoreError> {
        self.send_json(
            Method::POST,
            self.endpoint(&["users", user_id, "logins"]),
            &EmptyBody {},
            false,
        )
        .await
    }

    async fn is_following(&self, follower_id: &str, followee_id: &str) -> Result<bool, StoreError> {
        let status: FollowStatusResponse = self
            .get_json(self.endpoint(&["follows", follower_id, followee_id]))
            .await?;
        Ok(status.following)
    }

    async fn follow(&self, follower_id: &str, followee_id: &str) -> Result<(), StoreError> {
        self.send_empty(Method::PUT, self.endpoint(&["follows", follower_id, followee_id]))
            .await
    }

    async fn unfollow(&self, follower_id: &str, followee_id: &str) -> Result<(), StoreError> {
        match self
            .send_empty(Method::DELETE, self.endpoint(&["follows", follower_id, followee_id]))
            .await
        {
            // Already gone is the state we wanted
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn followers_of(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.get_json(self.endpoint(&["users", user_id, "followers"]))
            .await
    }

    async fn following_of(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.get_json(self.endpoint(&["users", user_id, "following"]))
            .await
    }

    async fn user_stats(&self, user_id: &str) -> Result<UserStats, StoreError> {
        self.get_json(self.endpoint(&["users", user_id, "stats"]))
            .await
    }

    async fn liked_songs(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let songs: Option<Vec<String>> = self
            .get_json(self.endpoint(&["users", user_id, "likedSongs"]))
            .await?;
        Ok(songs.unwrap_or_default())
    }

    async fn like_song(&self, user_id: &str, track_id: &str) -> Result<(), StoreError> {
        self.send_empty(
            Method::PUT,
            self.endpoint(&["users", user_id, "likedSongs", track_id]),
        )
        .await
    }

    async fn unlike_song(&self, user_id: &str, track_id: &str) -> Result<(), StoreError> {
        match self
            .send_empty(
                Method::DELETE,
                self.endpoint(&["users", user_id, "likedSongs", track_id]),
            )
            .await
        {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn suggested_users(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<UserSummary>, StoreError> {
        let mut url = self.endpoint(&["users", user_id, "suggestions"]);
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, StoreError> {
        let mut url = self.endpoint(&["users", "search"]);
        url.query_pairs_mut().append_pair("q", query.trim());
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_and_encodes_segments() {
        let store = HttpProfileStore::new("https://store.example/api/v1/").expect("store");
        let url = store.endpoint(&["users", "a b/c", "likedSongs"]);
        assert_eq!(
            url.as_str(),
            "https://store.example/api/v1/users/a%20b%2Fc/likedSongs"
        );
    }

    #[test]
    fn test_endpoint_without_trailing_slash() {
        let store = HttpProfileStore::new("https://store.example/api").expect("store");
        assert_eq!(
            store.endpoint(&["follows", "u1", "u2"]).as_str(),
            "https://store.example/api/follows/u1/u2"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(HttpProfileStore::new("not a url").is_err());
        assert!(HttpProfileStore::new("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_parse_follow_status() {
        let status: FollowStatusResponse =
            serde_json::from_str(r#"{"following": true}"#).expect("follow status");
        assert!(status.following);
    }

    #[test]
    fn test_parse_summary_list() {
        let json = r#"[{"id": "u1", "displayName": "mira", "profileImage": null}]"#;
        let users: Vec<UserSummary> = serde_json::from_str(json).expect("summaries");
        assert_eq!(users[0].display_name, "mira");
        assert!(users[0].profile_image.is_none());
    }
}
