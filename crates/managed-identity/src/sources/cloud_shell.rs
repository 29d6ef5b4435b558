//! Azure Cloud Shell

use http::Method;
use tracing::info;
use url::Url;

use crate::client::{
    AcquireTokenParameters, RequestContext, missing_environment, parse_endpoint, user_assigned_not_supported,
};
use crate::env::names;
use crate::error::Result;
use crate::request::{ManagedIdentityRequest, headers};
use crate::source::ManagedIdentitySource;

/// Cloud Shell token endpoint. System-assigned only.
#[derive(Debug, Clone)]
pub struct CloudShellSource {
    endpoint: Url,
}

impl CloudShellSource {
    pub(crate) fn new(ctx: &RequestContext) -> Result<Self> {
        let source = ManagedIdentitySource::CloudShell;
        if ctx.identity().is_user_assigned() {
            return Err(user_assigned_not_supported(source));
        }

        let endpoint = ctx
            .env
            .msi_endpoint
            .as_deref()
            .ok_or_else(|| missing_environment(names::MSI_ENDPOINT, source))?;
        let endpoint = parse_endpoint(endpoint, names::MSI_ENDPOINT, source)?;

        info!(endpoint = %endpoint, "[Managed Identity] Creating Cloud Shell managed identity source");
        Ok(Self { endpoint })
    }

    pub(crate) fn create_request(&self, params: &AcquireTokenParameters) -> ManagedIdentityRequest {
        let mut request = ManagedIdentityRequest::new(Method::POST, self.endpoint.clone());
        request
            .header(headers::METADATA, "true")
            .body_parameter("resource", params.resource.as_str());
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

    const ENV: &[(&str, &str)] = &[(names::MSI_ENDPOINT, "http://localhost:50342/oauth2/token")];

    #[test]
    fn test_post_with_form_body() {
        let ctx = context(ManagedIdentityConfig::default(), ENV);
        let request = CloudShellSource::new(&ctx)
            .unwrap()
            .create_request(&AcquireTokenParameters::new("https://management.azure.com/"));

        assert_eq!(request.method, Method::POST);
        assert!(request.query_parameters.is_empty());
        assert_eq!(request.headers.get("Metadata").map(String::as_str), Some("true"));
        let body = request.body().unwrap();
        assert_eq!(body.content, "resource=https%3A%2F%2Fmanagement.azure.com%2F");
    }

    #[test]
    fn test_user_assigned_rejected_at_construction() {
        let ctx = context(ManagedIdentityConfig::new(ManagedIdentityId::ClientId("x".into())), ENV);
        let err = CloudShellSource::new(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.error_code(), codes::USER_ASSIGNED_NOT_SUPPORTED);
        assert_eq!(err.managed_identity_source(), ManagedIdentitySource::CloudShell);
    }
}
