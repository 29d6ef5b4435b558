//! Service Fabric, standard and federated
//!
//! Both variants send the `IDENTITY_HEADER` secret and pin the server
//! certificate to `IDENTITY_SERVER_THUMBPRINT` (see [`crate::tls`]). The
//! federated variant asks the node for a federated managed identity
//! credential at `APP_IDENTITY_ENDPOINT` instead of a token.

use http::Method;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use url::Url;

use crate::client::{
    AcquireTokenParameters, DEFAULT_QUALIFIER_KEYS, RequestContext, apply_claims_and_capabilities,
    missing_environment, parse_endpoint, user_assigned_query_param,
};
use crate::env::names;
use crate::error::Result;
use crate::request::ManagedIdentityRequest;
use crate::source::ManagedIdentitySource;

/// Token API version
pub const API_VERSION: &str = "2019-07-01-preview";
/// Header carrying `IDENTITY_HEADER`
pub const SECRET_HEADER: &str = "secret";
/// Path of the federated credential endpoint
pub const FEDERATED_CREDENTIAL_PATH: &str = "/metadata/identity/oauth2/fmi/credential";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Variant {
    Standard,
    Federated { api_version: String },
}

/// Service Fabric managed identity endpoint
#[derive(Debug, Clone)]
pub struct ServiceFabricSource {
    endpoint: Url,
    secret: SecretString,
    thumbprint: String,
    variant: Variant,
}

impl ServiceFabricSource {
    pub(crate) fn new(ctx: &RequestContext) -> Result<Self> {
        Self::build(ctx, ManagedIdentitySource::ServiceFabric)
    }

    pub(crate) fn federated(ctx: &RequestContext) -> Result<Self> {
        Self::build(ctx, ManagedIdentitySource::ServiceFabricFederated)
    }

    fn build(ctx: &RequestContext, source: ManagedIdentitySource) -> Result<Self> {
        let env = &ctx.env;
        let identity_endpoint = env
            .identity_endpoint
            .as_deref()
            .ok_or_else(|| missing_environment(names::IDENTITY_ENDPOINT, source))?;
        let secret = env
            .identity_header
            .clone()
            .ok_or_else(|| missing_environment(names::IDENTITY_HEADER, source))?;
        let thumbprint = env
            .identity_server_thumbprint
            .clone()
            .ok_or_else(|| missing_environment(names::IDENTITY_SERVER_THUMBPRINT, source))?;

        let (endpoint, variant) = if source == ManagedIdentitySource::ServiceFabricFederated {
            let app_endpoint = env
                .app_identity_endpoint
                .as_deref()
                .ok_or_else(|| missing_environment(names::APP_IDENTITY_ENDPOINT, source))?;
            let mut endpoint = parse_endpoint(app_endpoint, names::APP_IDENTITY_ENDPOINT, source)?;
            endpoint.set_path(FEDERATED_CREDENTIAL_PATH);
            let api_version = env
                .identity_api_version
                .clone()
                .unwrap_or_else(|| API_VERSION.to_string());
            (endpoint, Variant::Federated { api_version })
        } else {
            let endpoint = parse_endpoint(identity_endpoint, names::IDENTITY_ENDPOINT, source)?;
            if ctx.identity().is_user_assigned() {
                warn!(
                    "[Managed Identity] Service Fabric user assigned managed identity ClientId or ResourceId is not configurable at runtime."
                );
            }
            (endpoint, Variant::Standard)
        };

        info!(endpoint = %endpoint, source = %source, "[Managed Identity] Creating Service Fabric managed identity source");
        Ok(Self {
            endpoint,
            secret,
            thumbprint,
            variant,
        })
    }

    /// Which of the two variants this is
    pub fn source(&self) -> ManagedIdentitySource {
        match self.variant {
            Variant::Standard => ManagedIdentitySource::ServiceFabric,
            Variant::Federated { .. } => ManagedIdentitySource::ServiceFabricFederated,
        }
    }

    /// Endpoint requests go to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub(crate) fn create_request(
        &self,
        ctx: &RequestContext,
        params: &AcquireTokenParameters,
    ) -> ManagedIdentityRequest {
        let mut request = ManagedIdentityRequest::new(Method::GET, self.endpoint.clone());
        request.server_certificate_thumbprint = Some(self.thumbprint.clone());
        request
            .header(SECRET_HEADER, self.secret.expose_secret().as_str())
            .query("resource", params.resource.as_str());

        match &self.variant {
            Variant::Standard => {
                request.query("api-version", API_VERSION);
                if let Some((key, value)) = user_assigned_query_param(ctx.identity(), DEFAULT_QUALIFIER_KEYS) {
                    request.query(key, value);
                }
                apply_claims_and_capabilities(&mut request, params, &ctx.config);
            }
            Variant::Federated { api_version } => {
                request.query("api-version", api_version.as_str());
            }
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagedIdentityConfig, ManagedIdentityId};
    use crate::error::{ErrorKind, codes};
    use crate::sources::tests::context;
    use pretty_assertions::assert_eq;

    const ENV: &[(&str, &str)] = &[
        (names::IDENTITY_ENDPOINT, "https://localhost:2377/metadata/identity/oauth2/token"),
        (names::IDENTITY_HEADER, "sf-secret"),
        (names::IDENTITY_SERVER_THUMBPRINT, "ABCDEF0123"),
    ];

    fn federated_env(api_version: Option<&'static str>) -> Vec<(&'static str, &'static str)> {
        let mut env = ENV.to_vec();
        env.push((names::APP_IDENTITY_ENDPOINT, "https://localhost:2378/some/other/path"));
        if let Some(v) = api_version {
            env.push((names::IDENTITY_API_VERSION, v));
        }
        env
    }

    #[test]
    fn test_standard_request_shape() {
        let ctx = context(ManagedIdentityConfig::new(ManagedIdentityId::ClientId("cid".into())), ENV);
        let source = ServiceFabricSource::new(&ctx).unwrap();
        assert_eq!(source.source(), ManagedIdentitySource::ServiceFabric);

        let request = source.create_request(&ctx, &AcquireTokenParameters::new("r"));
        assert_eq!(request.server_certificate_thumbprint.as_deref(), Some("ABCDEF0123"));
        assert_eq!(request.headers.get(SECRET_HEADER).map(String::as_str), Some("sf-secret"));
        assert_eq!(request.query_parameters.get("api-version").map(String::as_str), Some(API_VERSION));
        assert_eq!(request.query_parameters.get("client_id").map(String::as_str), Some("cid"));
        assert_eq!(request.query_parameters.get("bypass_cache").map(String::as_str), Some("false"));
    }

    #[test]
    fn test_federated_forces_path_and_drops_qualifiers() {
        let ctx = context(
            ManagedIdentityConfig::new(ManagedIdentityId::ClientId("cid".into())),
            &federated_env(None),
        );
        let source = ServiceFabricSource::federated(&ctx).unwrap();
        assert_eq!(source.source(), ManagedIdentitySource::ServiceFabricFederated);
        assert_eq!(
            source.endpoint().as_str(),
            "https://localhost:2378/metadata/identity/oauth2/fmi/credential"
        );

        let request = source.create_request(&ctx, &AcquireTokenParameters::new("r").with_claims("{}"));
        assert_eq!(request.server_certificate_thumbprint.as_deref(), Some("ABCDEF0123"));
        assert_eq!(request.query_parameters.get("api-version").map(String::as_str), Some(API_VERSION));
        assert!(!request.query_parameters.contains_key("client_id"));
        assert!(!request.query_parameters.contains_key("bypass_cache"));
    }

    #[test]
    fn test_federated_api_version_override() {
        let ctx = context(ManagedIdentityConfig::default(), &federated_env(Some("2024-06-11")));
        let request = ServiceFabricSource::federated(&ctx)
            .unwrap()
            .create_request(&ctx, &AcquireTokenParameters::new("r"));
        assert_eq!(request.query_parameters.get("api-version").map(String::as_str), Some("2024-06-11"));
    }

    #[test]
    fn test_missing_thumbprint_fails_at_construction() {
        let ctx = context(ManagedIdentityConfig::default(), &ENV[..2]);
        let err = ServiceFabricSource::new(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.error_code(), codes::MISSING_ENVIRONMENT);
        assert!(err.message().contains(names::IDENTITY_SERVER_THUMBPRINT));
    }
}
