//! Data models for beatcache entities.
//!
//! - `UserProfile`: the remote profile record and the persisted session body
//! - `NewProfile`, `ProfileUpdate`: validated write payloads
//! - `UserStats`, `UserSummary`, `FollowEdge`: social-graph views

pub mod profile;
pub mod social;

pub use profile::{NewProfile, ProfileUpdate, UserProfile};
pub use social::{FollowEdge, UserStats, UserSummary};
