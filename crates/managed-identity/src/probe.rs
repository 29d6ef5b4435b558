//! Cached IMDSv2 availability probe
//!
//! The probe costs a network round trip (up to the probe timeout when IMDS
//! is absent), so its outcome is computed once per process. Concurrent
//! first callers serialize on an async mutex and re-check after acquiring
//! it, so only one of them actually probes.

use std::future::Future;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::sources::credential::CsrMetadata;

/// Outcome of a capability check.
///
/// `Unavailable` is an expected answer that triggers fallback; errors are
/// reserved for failures the caller must see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability<T> {
    /// The feature is usable
    Available(T),
    /// The feature is not usable on this host, with the reason
    Unavailable(String),
}

impl<T> Availability<T> {
    /// True for [`Availability::Available`]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// Process-wide cache of the IMDSv2 probe outcome
#[derive(Debug, Default)]
pub struct ImdsProbe {
    outcome: RwLock<Option<Availability<CsrMetadata>>>,
    gate: Mutex<()>,
}

impl ImdsProbe {
    /// Nothing probed yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached outcome, if a probe has completed
    pub fn cached(&self) -> Option<Availability<CsrMetadata>> {
        self.outcome.read().clone()
    }

    /// Return the cached outcome or run `probe` to produce it.
    ///
    /// Errors from `probe` (cancellation) are returned without being cached.
    ///
    /// # Errors
    ///
    /// Whatever `probe` returns.
    pub async fn check<F, Fut>(&self, probe: F) -> Result<Availability<CsrMetadata>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Availability<CsrMetadata>>>,
    {
        if let Some(outcome) = self.cached() {
            return Ok(outcome);
        }

        let _gate = self.gate.lock().await;
        if let Some(outcome) = self.cached() {
            debug!("[Managed Identity] IMDSv2 probe completed by a concurrent caller");
            return Ok(outcome);
        }

        let outcome = probe().await?;
        debug!(available = outcome.is_available(), "[Managed Identity] Caching IMDSv2 probe outcome");
        *self.outcome.write() = Some(outcome.clone());
        Ok(outcome)
    }
}
