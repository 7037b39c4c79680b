//! Social-graph views: follow edges, counters and user summaries.

use serde::{Deserialize, Serialize};

/// Directed "follower follows followee" relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct FollowEdge {
    #[serde(rename = "followerId")]
    pub follower_id: String,
    #[serde(rename = "followeeId")]
    pub followee_id: String,
}

impl FollowEdge {
    pub fn new(follower_id: impl Into<String>, followee_id: impl Into<String>) -> Self {
        Self {
            follower_id: follower_id.into(),
            followee_id: followee_id.into(),
        }
    }
}

/// Follower/following counters for a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct UserStats {
    #[serde(default)]
    pub followers: u64,
    #[serde(default)]
    pub following: u64,
}

impl UserStats {
    pub fn new(followers: u64, following: u64) -> Self {
        Self { followers, following }
    }

    /// Apply a +1/-1 delta to the follower count, saturating at zero.
    pub fn adjust_followers(&mut self, delta: i64) {
        self.followers = apply_delta(self.followers, delta);
    }

    pub fn adjust_following(&mut self, delta: i64) {
        self.following = apply_delta(self.following, delta);
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Lightweight user entry used by suggestion and search lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct UserSummary {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "profileImage", default)]
    pub profile_image: Option<String>,
}
