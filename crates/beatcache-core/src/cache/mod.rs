//! Client-side caching for social-graph reads.
//!
//! This module provides the `SocialCache` for follow status, user stats,
//! suggested users and search results. Every entry carries its own expiry
//! and a read past that expiry behaves as a miss.
//!
//! Live entries can be snapshotted to the cache directory so a restart does
//! not start cold.

pub mod clock;
pub mod manager;
pub mod ttl;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{CacheTtls, SocialCache, SuggestionPage};
pub use ttl::{CacheEntry, TtlCache};
