//! Azure Machine Learning compute
//!
//! Same shape as App Service on the older 2017 API: the secret travels in a
//! `secret` header and the identity is always named by client id.

use http::Method;
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info};
use url::Url;

use crate::client::{AcquireTokenParameters, RequestContext, missing_environment, parse_endpoint};
use crate::config::ManagedIdentityId;
use crate::env::names;
use crate::error::{ManagedIdentityError, Result, codes};
use crate::request::ManagedIdentityRequest;
use crate::source::ManagedIdentitySource;

/// Token API version
pub const API_VERSION: &str = "2017-09-01";
/// Header carrying `MSI_SECRET`
pub const SECRET_HEADER: &str = "secret";
/// Query key naming the identity
pub const CLIENT_ID_PARAM: &str = "clientid";

/// Machine Learning managed identity endpoint
#[derive(Debug, Clone)]
pub struct MachineLearningSource {
    endpoint: Url,
    secret: SecretString,
    client_id: String,
}

impl MachineLearningSource {
    pub(crate) fn new(ctx: &RequestContext) -> Result<Self> {
        let source = ManagedIdentitySource::MachineLearning;
        let endpoint = ctx
            .env
            .msi_endpoint
            .as_deref()
            .ok_or_else(|| missing_environment(names::MSI_ENDPOINT, source))?;
        let endpoint = parse_endpoint(endpoint, names::MSI_ENDPOINT, source)?;
        let secret = ctx
            .env
            .msi_secret
            .clone()
            .ok_or_else(|| missing_environment(names::MSI_SECRET, source))?;

        let client_id = match ctx.identity() {
            ManagedIdentityId::SystemAssigned => ctx
                .env
                .default_identity_client_id
                .clone()
                .ok_or_else(|| missing_environment(names::DEFAULT_IDENTITY_CLIENT_ID, source))?,
            ManagedIdentityId::ClientId(id) => id.clone(),
            ManagedIdentityId::ResourceId(_) | ManagedIdentityId::ObjectId(_) => {
                let message = "[Managed Identity] Machine Learning supports only client id for user-assigned managed identity.";
                error!("{message}");
                return Err(ManagedIdentityError::configuration(
                    codes::USER_ASSIGNED_NOT_SUPPORTED,
                    message,
                    source,
                ));
            }
        };

        info!(endpoint = %endpoint, "[Managed Identity] Creating Machine Learning managed identity source");
        Ok(Self {
            endpoint,
            secret,
            client_id,
        })
    }

    pub(crate) fn create_request(&self, params: &AcquireTokenParameters) -> ManagedIdentityRequest {
        let mut request = ManagedIdentityRequest::new(Method::GET, self.endpoint.clone());
        request
            .header(SECRET_HEADER, self.secret.expose_secret().as_str())
            .query("api-version", API_VERSION)
            .query("resource", params.resource.as_str())
            .query(CLIENT_ID_PARAM, self.client_id.as_str());
        request
    }
}
