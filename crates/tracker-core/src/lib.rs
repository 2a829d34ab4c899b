//! # Fleet Tracker - Core
//!
//! Real-time device state for a fleet of GPS trackers: raw feed events are
//! normalized, merged last-writer-wins into per-device snapshots, and turned
//! into derived alerts and geofence transitions.
//!
//! ## Architecture
//!
//! ```text
//!   ChangeFeed (devices, locations, geofences)
//!                     │
//!                     ▼
//!   ┌───────────────────────────────────┐
//!   │  Sync Session (feed loop + sweep) │──── alert writer ───▶ BackendStore
//!   └───────────────────────────────────┘
//!                     │
//!                     ▼
//!   normalize ─▶ Reconciler ─▶ AlertDeriver / geofence
//!                     │
//!                     ▼
//!   ┌───────────────────────────────────┐
//!   │   Tracker (query facade, events)  │◀─── write intents ───▶ BackendStore
//!   └───────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tracker_core::{Tracker, TrackerConfig};
//! use tracker_domain::{AlertFilter, OwnerScope};
//! use tracker_feed::MemoryBackend;
//!
//! let tracker = Tracker::new(
//!     Arc::new(MemoryBackend::new()),
//!     OwnerScope::new("owner-1"),
//!     TrackerConfig::default(),
//! );
//! tracker.start().await?;
//! let open = tracker.list_alerts(AlertFilter::Unresolved).await;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod alerts;
pub mod config;
pub mod error;
pub mod facade;
pub mod geofence;
pub mod normalize;
pub mod provisioning;
pub mod reconciler;
mod session;

pub use alerts::{AlertChange, AlertDeriver, Thresholds};
pub use config::{ReconnectConfig, TrackerConfig};
pub use error::{FieldError, Result, TrackerError, ValidationErrors};
pub use facade::{GeofenceCrossing, Tracker, TrackerEvent};
pub use normalize::RejectReason;
pub use reconciler::{MergeOutcome, Movement, Reconciler};

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
