//! Process-scoped shared state
//!
//! Everything that outlives a single token request lives here, each piece
//! behind its own synchronization:
//!
//! - the detected source (`OnceLock`)
//! - the IMDSv2 probe outcome (read-write lock plus an async gate)
//! - certificate bindings (read-write lock keyed by identity)
//!
//! Managers built with [`SharedState::global`] share one instance; tests
//! build their own with [`SharedState::new`].

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::binding::BindingCache;
use crate::detect::SourceDetector;
use crate::probe::ImdsProbe;

static GLOBAL_STATE: Lazy<Arc<SharedState>> = Lazy::new(|| Arc::new(SharedState::default()));

/// Detection memo, probe cache and binding cache
#[derive(Debug, Default)]
pub struct SharedState {
    detector: SourceDetector,
    probe: ImdsProbe,
    bindings: BindingCache,
}

impl SharedState {
    /// Fresh, empty state
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide instance
    pub fn global() -> Arc<Self> {
        GLOBAL_STATE.clone()
    }

    /// Source detection memo
    pub fn detector(&self) -> &SourceDetector {
        &self.detector
    }

    /// IMDSv2 probe cache
    pub fn probe(&self) -> &ImdsProbe {
        &self.probe
    }

    /// Certificate binding cache
    pub fn bindings(&self) -> &BindingCache {
        &self.bindings
    }
}
