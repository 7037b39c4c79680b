//! Core library for beatcache.
//!
//! beatcache keeps a listener's social graph and liked songs in sync with a
//! remote profile store. It provides:
//!
//! - `store`: the `ProfileStore` boundary plus HTTP and in-process backends
//! - `cache`: a TTL cache for follow status, stats, suggestions and searches
//! - `auth`: the persisted session, keychain credentials and the admin gate
//! - `sync`: start-up, periodic and liked-songs reconciliation
//! - `mutation`: optimistic follow/like with rollback and stat correction
//! - `context`: `UserContext`, the service object wiring it all together
//! - `upload`: the unsigned profile-image upload client

pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod mutation;
pub mod store;
pub mod sync;
pub mod upload;
pub mod utils;

pub use context::UserContext;
pub use error::ActionError;
pub use store::{ProfileStore, StoreError};
