//! Azure Instance Metadata Service

use http::Method;
use tracing::{error, info};
use url::Url;

use crate::client::{
    AcquireTokenParameters, IMDS_QUALIFIER_KEYS, RequestContext, handle_default_response,
    message_from_error_response, parse_endpoint, user_assigned_query_param,
};
use crate::config::RequestKind;
use crate::env::{EnvironmentVariables, names};
use crate::error::{ErrorKind, ManagedIdentityError, Result, codes, messages};
use crate::http::HttpResponse;
use crate::request::{ManagedIdentityRequest, headers};
use crate::response::ManagedIdentityResponse;
use crate::source::ManagedIdentitySource;

/// Link-local IMDS address
pub const DEFAULT_IMDS_BASE: &str = "http://169.254.169.254";
/// Token path on IMDS
pub const TOKEN_PATH: &str = "/metadata/identity/oauth2/token";
/// Token API version
pub const API_VERSION: &str = "2018-02-01";

/// IMDS base URI: the pod identity override when set, otherwise the
/// link-local address
///
/// # Errors
///
/// Returns a configuration error if the override is not an http(s) URI.
pub(crate) fn imds_base(env: &EnvironmentVariables) -> Result<Url> {
    match env.pod_identity_endpoint.as_deref() {
        Some(pod) => {
            info!(endpoint = pod, "[Managed Identity] Using the pod identity endpoint for IMDS");
            parse_endpoint(pod, names::POD_IDENTITY_AUTHORITY_HOST, ManagedIdentitySource::Imds)
        }
        None => parse_endpoint(DEFAULT_IMDS_BASE, "IMDS", ManagedIdentitySource::Imds),
    }
}

/// IMDS base URI with `path` replacing whatever path it carried
pub(crate) fn imds_endpoint(env: &EnvironmentVariables, path: &str) -> Result<Url> {
    let mut url = imds_base(env)?;
    url.set_path(path);
    url.set_query(None);
    Ok(url)
}

/// Bearer tokens from IMDS
#[derive(Debug, Clone)]
pub struct ImdsSource {
    endpoint: Url,
}

impl ImdsSource {
    pub(crate) fn new(ctx: &RequestContext) -> Result<Self> {
        let endpoint = imds_endpoint(&ctx.env, TOKEN_PATH)?;
        info!(endpoint = %endpoint, "[Managed Identity] Creating IMDS managed identity source");
        Ok(Self { endpoint })
    }

    /// Token endpoint in use
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub(crate) fn create_request(
        &self,
        ctx: &RequestContext,
        params: &AcquireTokenParameters,
    ) -> ManagedIdentityRequest {
        let mut request =
            ManagedIdentityRequest::new(Method::GET, self.endpoint.clone()).with_kind(RequestKind::Imds);
        request
            .header(headers::METADATA, "true")
            .query("api-version", API_VERSION)
            .query("resource", params.resource.as_str());

        if let Some((key, value)) = user_assigned_query_param(ctx.identity(), IMDS_QUALIFIER_KEYS) {
            info!(key, "[Managed Identity] Adding user assigned id to the IMDS request");
            request.query(key, value);
        }
        request
    }

    /// 400 means the identity is not assigned; 502/504 are gateway errors.
    pub(crate) fn handle_response(&self, response: &HttpResponse) -> Result<ManagedIdentityResponse> {
        let (kind, fixed) = match response.status {
            400 => (ErrorKind::IdentityUnavailable, messages::IDENTITY_UNAVAILABLE),
            502 | 504 => (ErrorKind::Gateway, messages::GATEWAY_ERROR),
            _ => return handle_default_response(response, ManagedIdentitySource::Imds),
        };

        let message = format!("{fixed} {}", message_from_error_response(&response.body));
        error!(status = response.status, "{message}");
        Err(
            ManagedIdentityError::new(kind, codes::REQUEST_FAILED, message, ManagedIdentitySource::Imds)
                .with_status(response.status),
        )
    }
}
