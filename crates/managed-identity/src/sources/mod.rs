//! Per-source clients
//!
//! [`SourceClient`] is a closed set: one variant per wire protocol, built
//! by [`SourceClient::create`] from a [`ManagedIdentitySource`]. Every
//! variant shares the lifecycle in [`crate::client`] and only supplies the
//! request builder and, where the protocol deviates, its own response
//! handling.

pub mod app_service;
pub mod azure_arc;
pub mod cloud_shell;
pub mod credential;
pub mod imds;
pub mod machine_learning;
pub mod service_fabric;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::{self, AcquireTokenParameters, RequestContext, handle_default_response};
use crate::error::{ManagedIdentityError, Result, codes, messages};
use crate::request::ManagedIdentityRequest;
use crate::response::ManagedIdentityResponse;
use crate::source::ManagedIdentitySource;

pub use app_service::AppServiceSource;
pub use azure_arc::AzureArcSource;
pub use cloud_shell::CloudShellSource;
pub use credential::CredentialSource;
pub use imds::ImdsSource;
pub use machine_learning::MachineLearningSource;
pub use service_fabric::ServiceFabricSource;

/// A source-specific client, ready to authenticate
#[derive(Debug, Clone)]
pub enum SourceClient {
    /// IMDS bearer tokens
    Imds(ImdsSource),
    /// App Service / Functions
    AppService(AppServiceSource),
    /// Machine Learning compute
    MachineLearning(MachineLearningSource),
    /// Cloud Shell
    CloudShell(CloudShellSource),
    /// Azure Arc, with the challenge leg
    AzureArc(AzureArcSource),
    /// Service Fabric, standard or federated
    ServiceFabric(ServiceFabricSource),
    /// Certificate-bound IMDSv2 flow
    Credential(CredentialSource),
}

impl SourceClient {
    /// Build the client for `source`.
    ///
    /// Construction validates the environment the source needs, so a
    /// malformed endpoint fails here rather than at send time.
    ///
    /// # Errors
    ///
    /// A configuration error for missing or malformed environment, for a
    /// user-assigned identity on a source that cannot serve one, or for
    /// [`ManagedIdentitySource::None`].
    pub fn create(source: ManagedIdentitySource, ctx: &RequestContext) -> Result<Self> {
        debug!(source = %source, "[Managed Identity] Creating source client");
        let client = match source {
            ManagedIdentitySource::Imds | ManagedIdentitySource::DefaultToImds => Self::Imds(ImdsSource::new(ctx)?),
            ManagedIdentitySource::AppService => Self::AppService(AppServiceSource::new(ctx)?),
            ManagedIdentitySource::MachineLearning => Self::MachineLearning(MachineLearningSource::new(ctx)?),
            ManagedIdentitySource::CloudShell => Self::CloudShell(CloudShellSource::new(ctx)?),
            ManagedIdentitySource::AzureArc => Self::AzureArc(AzureArcSource::new(ctx)?),
            ManagedIdentitySource::ServiceFabric => Self::ServiceFabric(ServiceFabricSource::new(ctx)?),
            ManagedIdentitySource::ServiceFabricFederated => {
                Self::ServiceFabric(ServiceFabricSource::federated(ctx)?)
            }
            ManagedIdentitySource::Credential | ManagedIdentitySource::ImdsV2 => {
                Self::Credential(CredentialSource::new(ctx)?)
            }
            ManagedIdentitySource::None => {
                let message = "[Managed Identity] No managed identity source is available in this environment.";
                error!("{message}");
                return Err(ManagedIdentityError::configuration(
                    codes::SOURCE_UNAVAILABLE,
                    message,
                    ManagedIdentitySource::None,
                ));
            }
        };
        Ok(client)
    }

    /// Source this client talks to
    pub fn source(&self) -> ManagedIdentitySource {
        match self {
            Self::Imds(_) => ManagedIdentitySource::Imds,
            Self::AppService(_) => ManagedIdentitySource::AppService,
            Self::MachineLearning(_) => ManagedIdentitySource::MachineLearning,
            Self::CloudShell(_) => ManagedIdentitySource::CloudShell,
            Self::AzureArc(_) => ManagedIdentitySource::AzureArc,
            Self::ServiceFabric(sf) => sf.source(),
            Self::Credential(_) => ManagedIdentitySource::Credential,
        }
    }

    /// Build the first request for this source.
    ///
    /// The credential flow builds its requests internally and has no
    /// single request to return.
    pub fn create_request(
        &self,
        ctx: &RequestContext,
        params: &AcquireTokenParameters,
    ) -> Option<ManagedIdentityRequest> {
        let request = match self {
            Self::Imds(s) => s.create_request(ctx, params),
            Self::AppService(s) => s.create_request(ctx, params),
            Self::MachineLearning(s) => s.create_request(params),
            Self::CloudShell(s) => s.create_request(params),
            Self::AzureArc(s) => s.create_request(params),
            Self::ServiceFabric(s) => s.create_request(ctx, params),
            Self::Credential(_) => return None,
        };
        Some(request)
    }

    /// Acquire a token.
    ///
    /// # Errors
    ///
    /// Any [`ManagedIdentityError`]; the error always names this source.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
        params: &AcquireTokenParameters,
        cancel: &CancellationToken,
    ) -> Result<ManagedIdentityResponse> {
        let source = self.source();
        let result = match self {
            Self::Credential(credential) => credential.authenticate(ctx, params, cancel).await,
            _ => self.authenticate_single(ctx, params, cancel).await,
        };

        result.map_err(|err| {
            let err = err.with_source_if_unset(source);
            error!(
                source = %source,
                code = err.error_code(),
                status = ?err.status_code(),
                "[Managed Identity] Authentication failed: {}",
                err.message()
            );
            err
        })
    }

    async fn authenticate_single(
        &self,
        ctx: &RequestContext,
        params: &AcquireTokenParameters,
        cancel: &CancellationToken,
    ) -> Result<ManagedIdentityResponse> {
        let source = self.source();
        if cancel.is_cancelled() {
            error!(source = %source, "{}", messages::TIMEOUT);
            return Err(ManagedIdentityError::cancelled(source));
        }

        let Some(request) = self.create_request(ctx, params) else {
            return Err(ManagedIdentityError::configuration(
                codes::INVALID_REQUEST,
                "[Managed Identity] This source does not build a single token request.",
                source,
            ));
        };
        let response = client::send(ctx, request, source, cancel).await?;

        match self {
            Self::Imds(imds) => imds.handle_response(&response),
            Self::AzureArc(arc) => arc.handle_response(ctx, response, params, cancel).await,
            _ => handle_default_response(&response, source),
        }
    }
}
