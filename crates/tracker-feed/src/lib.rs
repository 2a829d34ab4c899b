//! # Fleet Tracker - Feed Adapters
//!
//! Change-feed subscriptions and store writes against the hosted backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Sync Session (tracker-core)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Backend = ChangeFeed + BackendStore            │
//! │     (raw device / location / geofence events, writes)        │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌─────────────────────────┐   ┌──────────────────────────────┐
//! │     MemoryBackend       │   │         RestBackend          │
//! │  (broadcast channels)   │   │  (PostgREST, interval poll)  │
//! └─────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! Records cross this boundary untyped. Field-name fallbacks, defaults and
//! merge rules live in the reconciler, so a new backend only has to move
//! JSON objects.
//!
//! ## Features
//!
//! - `rest`: Enable the hosted REST backend (default)

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod memory;
pub mod raw;
#[cfg(feature = "rest")]
pub mod rest;
pub mod traits;

pub use error::{FeedError, Result};
pub use memory::MemoryBackend;
pub use raw::{FeedEvent, RawDeviceEvent, RawGeofenceEvent, RawLocationEvent};
#[cfg(feature = "rest")]
pub use rest::{RestBackend, RestConfig};
pub use traits::{Backend, BackendStore, ChangeFeed, FeedStream};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
