//! # API Context
//!
//! Shared state handed to every GraphQL resolver and REST handler.

use std::sync::Arc;

use tracker_core::{Tracker, TrackerConfig};
use tracker_domain::OwnerScope;
use tracker_feed::Backend;

/// Application context shared across all resolvers
#[derive(Clone)]
pub struct ApiContext {
    /// Query facade over the reconciled device state
    pub tracker: Tracker,
}

impl ApiContext {
    pub const fn new(tracker: Tracker) -> Self {
        Self { tracker }
    }

    /// Context over a fresh tracker for `backend`
    pub fn for_backend(backend: Arc<dyn Backend>, owner_id: &str, config: TrackerConfig) -> Self {
        Self::new(Tracker::new(backend, OwnerScope::new(owner_id), config))
    }

    /// Owner scope every read is filtered by
    pub fn scope(&self) -> &OwnerScope {
        self.tracker.scope()
    }
}
