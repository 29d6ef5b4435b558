//! Managed identity orchestrator
//!
//! [`ManagedIdentityManager`] is the entry point: it resolves the source
//! once, builds the matching [`SourceClient`] and forwards the call.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::client::{AcquireTokenParameters, RequestContext};
use crate::config::ManagedIdentityConfig;
use crate::env::EnvironmentVariables;
use crate::error::{ManagedIdentityError, Result, codes};
use crate::http::{HttpManager, ReqwestHttpManager};
use crate::probe::Availability;
use crate::response::ManagedIdentityResponse;
use crate::source::ManagedIdentitySource;
use crate::sources::SourceClient;
use crate::sources::credential::fetch_csr_metadata;
use crate::state::SharedState;

/// Acquires managed identity tokens for one configuration
#[derive(Debug, Clone)]
pub struct ManagedIdentityManager {
    config: Arc<ManagedIdentityConfig>,
    http: Arc<dyn HttpManager>,
    env: Arc<EnvironmentVariables>,
    state: Arc<SharedState>,
}

impl ManagedIdentityManager {
    /// Manager using reqwest, the process environment and the process-wide
    /// shared state.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: ManagedIdentityConfig) -> Result<Self> {
        let http = ReqwestHttpManager::new(config.request_timeout, config.retry_policy.clone())
            .map_err(|e| ManagedIdentityError::from_transport(e, ManagedIdentitySource::None))?;
        Self::with_parts(
            config,
            Arc::new(http),
            EnvironmentVariables::from_process(),
            SharedState::global(),
        )
    }

    /// Manager with explicit collaborators
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn with_parts(
        config: ManagedIdentityConfig,
        http: Arc<dyn HttpManager>,
        env: EnvironmentVariables,
        state: Arc<SharedState>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            http,
            env: Arc::new(env),
            state,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &ManagedIdentityConfig {
        &self.config
    }

    fn context(&self) -> RequestContext {
        RequestContext::new(
            self.http.clone(),
            self.config.clone(),
            self.env.clone(),
            self.state.clone(),
        )
    }

    /// Report the source without probing.
    ///
    /// An environment that falls through to IMDS reports
    /// [`ManagedIdentitySource::DefaultToImds`] until a probe has confirmed
    /// the credential endpoint, and [`ManagedIdentitySource::ImdsV2`] after.
    pub fn detect_managed_identity_source(&self) -> ManagedIdentitySource {
        let detected = self.state.detector().get_or_detect(&self.env);
        if detected != ManagedIdentitySource::Imds {
            return detected;
        }
        match self.state.probe().cached() {
            Some(Availability::Available(_)) => ManagedIdentitySource::ImdsV2,
            _ => ManagedIdentitySource::DefaultToImds,
        }
    }

    /// Resolve the source requests will use.
    ///
    /// With `enable_imds_v2`, an IMDS host that passes the probe is upgraded
    /// to the credential flow.
    ///
    /// # Errors
    ///
    /// Only cancellation during the probe.
    pub async fn source(&self, cancel: &CancellationToken) -> Result<ManagedIdentitySource> {
        let detected = self.state.detector().get_or_detect(&self.env);
        if detected == ManagedIdentitySource::Imds
            && self.config.enable_imds_v2
            && self.is_imds_v2_available(cancel).await?
        {
            debug!("[Managed Identity] Using the credential flow on IMDS");
            return Ok(ManagedIdentitySource::Credential);
        }
        Ok(detected)
    }

    /// Probe the IMDS credential endpoint, once per process.
    ///
    /// # Errors
    ///
    /// Only cancellation; every other failure means "not available".
    pub async fn is_imds_v2_available(&self, cancel: &CancellationToken) -> Result<bool> {
        let ctx = self.context();
        let outcome = self
            .state
            .probe()
            .check(|| fetch_csr_metadata(&ctx, cancel, true))
            .await?;
        Ok(outcome.is_available())
    }

    /// Acquire a token for `params.resource`.
    ///
    /// # Errors
    ///
    /// A configuration error for an empty resource or for mTLS PoP outside
    /// the credential flow, otherwise whatever the source reports.
    #[instrument(skip_all, fields(resource = %params.resource))]
    pub async fn acquire_token(
        &self,
        params: &AcquireTokenParameters,
        cancel: &CancellationToken,
    ) -> Result<ManagedIdentityResponse> {
        if params.resource.trim().is_empty() {
            let message = "[Managed Identity] A resource is required to acquire a token.";
            error!("{message}");
            return Err(ManagedIdentityError::configuration(
                codes::INVALID_REQUEST,
                message,
                ManagedIdentitySource::None,
            ));
        }

        let source = self.source(cancel).await?;
        if params.mtls_pop && !source.is_credential() {
            let message = format!(
                "[Managed Identity] mTLS Proof-of-Possession is only supported by the certificate-bound credential flow, not by {source}."
            );
            error!("{message}");
            return Err(ManagedIdentityError::configuration(
                codes::MTLS_POP_NOT_SUPPORTED,
                message,
                source,
            ));
        }

        let ctx = self.context();
        let client = SourceClient::create(source, &ctx)?;
        info!(
            source = %source,
            correlation_id = %ctx.correlation_id(),
            "[Managed Identity] Acquiring token"
        );
        client.authenticate(&ctx, params, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagedIdentityId;
    use crate::env::names;
    use crate::error::ErrorKind;
    use crate::http::{HttpRequest, HttpResponse, TransportError};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct NotFound;

    #[async_trait]
    impl HttpManager for NotFound {
        async fn send(&self, _: HttpRequest, _: &CancellationToken) -> std::result::Result<HttpResponse, TransportError> {
            Ok(HttpResponse::new(404, ""))
        }
    }

    fn manager(config: ManagedIdentityConfig, env: &[(&str, &str)]) -> ManagedIdentityManager {
        ManagedIdentityManager::with_parts(
            config,
            Arc::new(NotFound),
            EnvironmentVariables::from_pairs(env.iter().copied()),
            SharedState::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = ManagedIdentityManager::with_parts(
            ManagedIdentityConfig::new(ManagedIdentityId::ObjectId(String::new())),
            Arc::new(NotFound),
            EnvironmentVariables::default(),
            SharedState::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_default_to_imds_until_probed() {
        let m = manager(ManagedIdentityConfig::default(), &[]);
        assert_eq!(m.detect_managed_identity_source(), ManagedIdentitySource::DefaultToImds);

        let m = manager(ManagedIdentityConfig::default(), &[(names::MSI_ENDPOINT, "http://localhost:50342")]);
        assert_eq!(m.detect_managed_identity_source(), ManagedIdentitySource::CloudShell);
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_imds() {
        let m = manager(ManagedIdentityConfig::default().with_imds_v2(true), &[]);
        let cancel = CancellationToken::new();
        assert!(!m.is_imds_v2_available(&cancel).await.unwrap());
        assert_eq!(m.source(&cancel).await.unwrap(), ManagedIdentitySource::Imds);
        assert_eq!(m.detect_managed_identity_source(), ManagedIdentitySource::DefaultToImds);
    }

    #[tokio::test]
    async fn test_empty_resource_rejected() {
        let m = manager(ManagedIdentityConfig::default(), &[]);
        let err = m
            .acquire_token(&AcquireTokenParameters::new("  "), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.error_code(), codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_mtls_pop_requires_credential_flow() {
        let m = manager(ManagedIdentityConfig::default(), &[]);
        let err = m
            .acquire_token(
                &AcquireTokenParameters::new("https://management.azure.com").with_mtls_pop(true),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), codes::MTLS_POP_NOT_SUPPORTED);
        assert_eq!(err.managed_identity_source(), ManagedIdentitySource::Imds);
    }
}
