//! App Service and Azure Functions

use http::Method;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
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
pub const API_VERSION: &str = "2019-08-01";
/// Header carrying `IDENTITY_HEADER`
pub const SECRET_HEADER: &str = "X-IDENTITY-HEADER";

/// App Service managed identity endpoint
#[derive(Debug, Clone)]
pub struct AppServiceSource {
    endpoint: Url,
    secret: SecretString,
}

impl AppServiceSource {
    pub(crate) fn new(ctx: &RequestContext) -> Result<Self> {
        let source = ManagedIdentitySource::AppService;
        let endpoint = ctx
            .env
            .identity_endpoint
            .as_deref()
            .ok_or_else(|| missing_environment(names::IDENTITY_ENDPOINT, source))?;
        let endpoint = parse_endpoint(endpoint, names::IDENTITY_ENDPOINT, source)?;
        let secret = ctx
            .env
            .identity_header
            .clone()
            .ok_or_else(|| missing_environment(names::IDENTITY_HEADER, source))?;

        info!(endpoint = %endpoint, "[Managed Identity] Creating App Service managed identity source");
        Ok(Self { endpoint, secret })
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
        let mut request = ManagedIdentityRequest::new(Method::GET, self.endpoint.clone());
        request
            .header(SECRET_HEADER, self.secret.expose_secret().as_str())
            .query("api-version", API_VERSION)
            .query("resource", params.resource.as_str());

        if let Some((key, value)) = user_assigned_query_param(ctx.identity(), DEFAULT_QUALIFIER_KEYS) {
            request.query(key, value);
        }
        apply_claims_and_capabilities(&mut request, params, &ctx.config);
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sha256_hex;
    use crate::config::{ManagedIdentityConfig, ManagedIdentityId};
    use crate::error::{ErrorKind, codes};
    use crate::sources::tests::context;
    use pretty_assertions::assert_eq;

    const ENV: &[(&str, &str)] = &[
        (names::IDENTITY_ENDPOINT, "http://127.0.0.1:41564/msi/token"),
        (names::IDENTITY_HEADER, "app-secret"),
    ];

    #[test]
    fn test_request_shape() {
        let ctx = context(
            ManagedIdentityConfig::new(ManagedIdentityId::ClientId("cid".into())),
            ENV,
        );
        let request = AppServiceSource::new(&ctx)
            .unwrap()
            .create_request(&ctx, &AcquireTokenParameters::new("https://vault.azure.net"));

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.endpoint.as_str(), "http://127.0.0.1:41564/msi/token");
        assert_eq!(request.headers.get(SECRET_HEADER).map(String::as_str), Some("app-secret"));
        assert_eq!(request.query_parameters.get("api-version").map(String::as_str), Some(API_VERSION));
        assert_eq!(request.query_parameters.get("client_id").map(String::as_str), Some("cid"));
        assert_eq!(request.query_parameters.get("bypass_cache").map(String::as_str), Some("false"));
    }

    #[test]
    fn test_resource_id_uses_mi_res_id() {
        let ctx = context(
            ManagedIdentityConfig::new(ManagedIdentityId::ResourceId("/sub/rg/mi".into())),
            ENV,
        );
        let request = AppServiceSource::new(&ctx)
            .unwrap()
            .create_request(&ctx, &AcquireTokenParameters::new("r"));
        assert_eq!(request.query_parameters.get("mi_res_id").map(String::as_str), Some("/sub/rg/mi"));
        assert!(!request.query_parameters.contains_key("msi_res_id"));
    }

    #[test]
    fn test_revocation_sends_token_hash() {
        let ctx = context(ManagedIdentityConfig::default().with_client_capabilities(["cp1"]), ENV);
        let params = AcquireTokenParameters::new("r")
            .with_claims("{}")
            .with_revoked_token("revoked");
        let request = AppServiceSource::new(&ctx).unwrap().create_request(&ctx, &params);

        assert_eq!(request.query_parameters.get("bypass_cache").map(String::as_str), Some("true"));
        assert_eq!(request.query_parameters.get("xms_cc").map(String::as_str), Some("cp1"));
        assert_eq!(request.query_parameters.get("token_sha256_to_refresh"), Some(&sha256_hex("revoked")));
    }

    #[test]
    fn test_malformed_endpoint_is_configuration_error() {
        let ctx = context(
            ManagedIdentityConfig::default(),
            &[
                (names::IDENTITY_ENDPOINT, "127.0.0.1:41564/msi/token"),
                (names::IDENTITY_HEADER, "app-secret"),
            ],
        );
        let err = AppServiceSource::new(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.error_code(), codes::INVALID_ENDPOINT);
        assert_eq!(err.managed_identity_source(), ManagedIdentitySource::AppService);
    }
}
