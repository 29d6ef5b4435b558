//! Source detection
//!
//! [`detect`] is a pure function of the environment snapshot. The first
//! matching rule wins, and the order matters because several hosts set
//! overlapping variables:
//!
//! 1. `IDENTITY_ENDPOINT` + `IDENTITY_HEADER` + `IDENTITY_SERVER_THUMBPRINT`
//!    → Service Fabric (federated when `APP_IDENTITY_ENDPOINT` is also set)
//! 2. `IDENTITY_ENDPOINT` + `IDENTITY_HEADER` → App Service
//! 3. `MSI_ENDPOINT` + `MSI_SECRET` → Machine Learning
//! 4. `MSI_ENDPOINT` → Cloud Shell
//! 5. `IDENTITY_ENDPOINT` + `IMDS_ENDPOINT` → Azure Arc
//! 6. otherwise → IMDS

use std::sync::OnceLock;

use tracing::{debug, info};

use crate::env::EnvironmentVariables;
use crate::source::ManagedIdentitySource;

/// Map an environment snapshot to the source that serves it.
pub fn detect(env: &EnvironmentVariables) -> ManagedIdentitySource {
    let identity_endpoint = env.identity_endpoint.is_some();
    let identity_header = env.identity_header.is_some();

    if identity_endpoint && identity_header && env.identity_server_thumbprint.is_some() {
        if env.app_identity_endpoint.is_some() {
            return ManagedIdentitySource::ServiceFabricFederated;
        }
        return ManagedIdentitySource::ServiceFabric;
    }

    if identity_endpoint && identity_header {
        return ManagedIdentitySource::AppService;
    }

    if env.msi_endpoint.is_some() {
        if env.msi_secret.is_some() {
            return ManagedIdentitySource::MachineLearning;
        }
        return ManagedIdentitySource::CloudShell;
    }

    if identity_endpoint && env.imds_endpoint.is_some() {
        return ManagedIdentitySource::AzureArc;
    }

    ManagedIdentitySource::Imds
}

/// Process-lifetime memo of [`detect`].
///
/// The first call evaluates the environment, every later call is a
/// lock-free read of the stored value.
#[derive(Debug, Default)]
pub struct SourceDetector {
    detected: OnceLock<ManagedIdentitySource>,
}

impl SourceDetector {
    /// Detector with nothing memoized yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Detected source, evaluating `env` only on first use
    pub fn get_or_detect(&self, env: &EnvironmentVariables) -> ManagedIdentitySource {
        *self.detected.get_or_init(|| {
            let source = detect(env);
            info!(source = %source, "[Managed Identity] Detected managed identity source");
            source
        })
    }

    /// Memoized value, if detection has already run
    pub fn cached(&self) -> Option<ManagedIdentitySource> {
        let cached = self.detected.get().copied();
        debug!(?cached, "[Managed Identity] Source detection cache lookup");
        cached
    }
}
