//! Shared request/response lifecycle
//!
//! Every source runs through the same steps:
//!
//! 1. short-circuit if cancellation was already requested
//! 2. build a [`ManagedIdentityRequest`] (source specific)
//! 3. send it through the [`HttpManager`]
//! 4. handle the response (source specific override, or
//!    [`handle_default_response`])
//!
//! Transport failures are classified in [`send`]; everything else is
//! already a [`ManagedIdentityError`] by the time it reaches the caller.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use crate::config::{ManagedIdentityConfig, ManagedIdentityId};
use crate::env::EnvironmentVariables;
use crate::error::{ManagedIdentityError, Result, codes, messages};
use crate::http::{HttpManager, HttpResponse};
use crate::request::ManagedIdentityRequest;
use crate::response::{ERROR_MESSAGE_PARSERS, ManagedIdentityResponse};
use crate::source::ManagedIdentitySource;
use crate::state::SharedState;

/// Per-call token request parameters
#[derive(Debug, Clone, Default)]
pub struct AcquireTokenParameters {
    /// Resource (audience) the token is for, e.g. `https://management.azure.com/`
    pub resource: String,
    /// Claims challenge from a resource provider; forces a fresh token
    pub claims: Option<String>,
    /// Token the caller was told is revoked, sent as its SHA-256 so the
    /// endpoint can skip its own cache for it
    pub revoked_token: Option<SecretString>,
    /// Request an mTLS proof-of-possession token instead of a bearer token
    pub mtls_pop: bool,
}

impl AcquireTokenParameters {
    /// Parameters for `resource`
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Self::default()
        }
    }

    /// Attach a claims challenge
    pub fn with_claims(mut self, claims: impl Into<String>) -> Self {
        self.claims = Some(claims.into());
        self
    }

    /// Attach the revoked access token
    pub fn with_revoked_token(mut self, token: impl Into<String>) -> Self {
        self.revoked_token = Some(SecretString::new(token.into()));
        self
    }

    /// Request an mTLS PoP token
    pub fn with_mtls_pop(mut self, mtls_pop: bool) -> Self {
        self.mtls_pop = mtls_pop;
        self
    }

    fn claims(&self) -> Option<&str> {
        self.claims.as_deref().filter(|c| !c.is_empty())
    }
}

/// Everything a source needs for one authentication attempt
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub(crate) http: Arc<dyn HttpManager>,
    pub(crate) config: Arc<ManagedIdentityConfig>,
    pub(crate) env: Arc<EnvironmentVariables>,
    pub(crate) state: Arc<SharedState>,
    pub(crate) correlation_id: Uuid,
}

impl RequestContext {
    pub(crate) fn new(
        http: Arc<dyn HttpManager>,
        config: Arc<ManagedIdentityConfig>,
        env: Arc<EnvironmentVariables>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            http,
            config,
            env,
            state,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Correlation id sent with IMDSv2 and token endpoint requests
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub(crate) fn identity(&self) -> &ManagedIdentityId {
        &self.config.managed_identity_id
    }
}

/// Send a request, classifying transport failures.
///
/// # Errors
///
/// Returns [`ErrorKind::UnreachableNetwork`](crate::ErrorKind::UnreachableNetwork),
/// [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled) or a request failure
/// depending on how the transport failed.
pub(crate) async fn send(
    ctx: &RequestContext,
    request: ManagedIdentityRequest,
    source: ManagedIdentitySource,
    cancel: &CancellationToken,
) -> Result<HttpResponse> {
    if cancel.is_cancelled() {
        error!(source = %source, "{}", messages::TIMEOUT);
        return Err(ManagedIdentityError::cancelled(source));
    }

    let http_request = request.into_http_request(Some(ctx.config.request_timeout));
    debug!(
        source = %source,
        method = %http_request.method,
        uri = %http_request.uri,
        "[Managed Identity] Sending request"
    );

    ctx.http.send(http_request, cancel).await.map_err(|err| {
        let classified = ManagedIdentityError::from_transport(err, source);
        if classified.kind() == crate::ErrorKind::Cancelled {
            error!(source = %source, "{}", messages::TIMEOUT);
        } else {
            error!(source = %source, error = %classified, "[Managed Identity] Request could not be sent");
        }
        classified
    })
}

/// Handle a response the way every source does unless it overrides it:
/// 200 is parsed and validated, anything else becomes a service error.
///
/// # Errors
///
/// Returns a request failure carrying the status for non-200 responses, or
/// a parse / invalid-response error for unusable 200 bodies.
pub(crate) fn handle_default_response(
    response: &HttpResponse,
    source: ManagedIdentitySource,
) -> Result<ManagedIdentityResponse> {
    if response.status == 200 {
        info!(source = %source, "[Managed Identity] Successful response received");
        return get_successful_response(&response.body, source);
    }

    let message = message_from_error_response(&response.body);
    error!(
        source = %source,
        status = response.status,
        "[Managed Identity] request failed, HttpStatusCode: {} Error message: {}",
        response.status,
        message
    );
    Err(ManagedIdentityError::request_failed(message, source, Some(response.status)))
}

/// Parse and validate a 200 body.
///
/// Parse failure and missing fields are reported as different error kinds.
///
/// # Errors
///
/// [`ErrorKind::ResponseParse`](crate::ErrorKind::ResponseParse) when the body
/// is not the expected JSON, [`ErrorKind::InvalidResponse`](crate::ErrorKind::InvalidResponse)
/// when `access_token` or `expires_on` is empty.
pub fn get_successful_response(body: &str, source: ManagedIdentitySource) -> Result<ManagedIdentityResponse> {
    let parsed: ManagedIdentityResponse = serde_json::from_str(body).map_err(|err| {
        error!(source = %source, error = %err, "{}", messages::PARSE_FAILURE);
        ManagedIdentityError::new(
            crate::ErrorKind::ResponseParse,
            codes::RESPONSE_PARSE_FAILURE,
            messages::PARSE_FAILURE,
            source,
        )
        .with_status(200)
        .with_inner(err)
    })?;

    if parsed.access_token.is_empty() || parsed.expires_on.is_empty() {
        error!(source = %source, "{}", messages::INVALID_RESPONSE);
        return Err(ManagedIdentityError::new(
            crate::ErrorKind::InvalidResponse,
            codes::INVALID_RESPONSE,
            messages::INVALID_RESPONSE,
            source,
        )
        .with_status(200));
    }

    Ok(parsed)
}

/// Best-effort diagnostic string from an error body. Never fails.
pub fn message_from_error_response(body: &str) -> String {
    if body.trim().is_empty() {
        return messages::NO_RESPONSE_RECEIVED.to_string();
    }

    ERROR_MESSAGE_PARSERS
        .iter()
        .find_map(|parse| parse(body))
        .unwrap_or_else(|| {
            format!(
                "{} Error response received from the server: {}.",
                messages::UNEXPECTED_ERROR_RESPONSE,
                body
            )
        })
}

/// Add `bypass_cache` (always), plus `xms_cc` and `token_sha256_to_refresh`
/// when a claims challenge is present.
pub(crate) fn apply_claims_and_capabilities(
    request: &mut ManagedIdentityRequest,
    params: &AcquireTokenParameters,
    config: &ManagedIdentityConfig,
) {
    let Some(claims) = params.claims() else {
        request.query("bypass_cache", "false");
        return;
    };

    request.query("bypass_cache", "true");
    if !config.client_capabilities.is_empty() {
        request.query("xms_cc", config.client_capabilities.join(","));
    }
    if let Some(token) = &params.revoked_token {
        request.query("token_sha256_to_refresh", sha256_hex(token.expose_secret()));
    }
    debug!(
        claims_len = claims.len(),
        capabilities = config.client_capabilities.len(),
        "[Managed Identity] Claims present, bypassing the endpoint cache"
    );
}

pub(crate) fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Query keys for the three user-assigned qualifiers
#[derive(Debug, Clone, Copy)]
pub(crate) struct QualifierKeys {
    pub(crate) client_id: &'static str,
    pub(crate) resource_id: &'static str,
    pub(crate) object_id: &'static str,
}

/// Keys used by App Service, Service Fabric and Azure Arc era endpoints
pub(crate) const DEFAULT_QUALIFIER_KEYS: QualifierKeys = QualifierKeys {
    client_id: "client_id",
    resource_id: "mi_res_id",
    object_id: "object_id",
};

/// IMDS names the resource id parameter differently
pub(crate) const IMDS_QUALIFIER_KEYS: QualifierKeys = QualifierKeys {
    client_id: "client_id",
    resource_id: "msi_res_id",
    object_id: "object_id",
};

/// The single query parameter selecting a user-assigned identity, if any
pub(crate) fn user_assigned_query_param(
    id: &ManagedIdentityId,
    keys: QualifierKeys,
) -> Option<(&'static str, &str)> {
    match id {
        ManagedIdentityId::SystemAssigned => None,
        ManagedIdentityId::ClientId(v) => Some((keys.client_id, v)),
        ManagedIdentityId::ResourceId(v) => Some((keys.resource_id, v)),
        ManagedIdentityId::ObjectId(v) => Some((keys.object_id, v)),
    }
}

/// Parse an endpoint taken from the environment.
///
/// Only absolute http(s) URIs are accepted; anything else is a
/// configuration error rather than "source not present".
///
/// # Errors
///
/// Returns a configuration error naming the variable and the source.
pub(crate) fn parse_endpoint(value: &str, variable: &str, source: ManagedIdentitySource) -> Result<Url> {
    let invalid = || {
        let message = format!(
            "[Managed Identity] The environment variable {variable} contains an invalid Uri {value} in {source} managed identity source."
        );
        error!("{message}");
        ManagedIdentityError::configuration(codes::INVALID_ENDPOINT, message, source)
    };

    let url = Url::parse(value).map_err(|e| invalid().with_inner(e))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url)
}

/// Configuration error for a missing environment variable
pub(crate) fn missing_environment(variable: &str, source: ManagedIdentitySource) -> ManagedIdentityError {
    let message = format!("[Managed Identity] The environment variable {variable} is required by the {source} managed identity source.");
    error!("{message}");
    ManagedIdentityError::configuration(codes::MISSING_ENVIRONMENT, message, source)
}

/// Configuration error for a user-assigned identity on a system-assigned-only source
pub(crate) fn user_assigned_not_supported(source: ManagedIdentitySource) -> ManagedIdentityError {
    let message = format!(
        "[Managed Identity] User assigned identity is not supported by the {source} Managed Identity. To authenticate with the system assigned identity use ManagedIdentityId::SystemAssigned."
    );
    error!("{message}");
    ManagedIdentityError::configuration(codes::USER_ASSIGNED_NOT_SUPPORTED, message, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use http::Method;
    use pretty_assertions::assert_eq;

    fn request() -> ManagedIdentityRequest {
        ManagedIdentityRequest::new(Method::GET, Url::parse("http://localhost/token").unwrap())
    }

    #[test]
    fn test_success_response() {
        let r = get_successful_response(
            r#"{"access_token":"AT1","expires_on":"1700000000","resource":"r","token_type":"Bearer"}"#,
            ManagedIdentitySource::Imds,
        )
        .unwrap();
        assert_eq!(r.access_token, "AT1");
        assert_eq!(r.token_type.as_deref(), Some("Bearer"));
    }

    #[test]
    fn test_parse_failure_distinct_from_invalid_response() {
        let err = get_successful_response("<html>", ManagedIdentitySource::AppService).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseParse);
        assert_eq!(err.message(), messages::PARSE_FAILURE);

        let err = get_successful_response(r#"{"access_token":"","expires_on":"1"}"#, ManagedIdentitySource::AppService)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
        assert_eq!(err.error_code(), codes::INVALID_RESPONSE);

        let err = get_successful_response(r#"{"access_token":"t"}"#, ManagedIdentitySource::AppService).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[test]
    fn test_default_response_error_carries_status_and_source() {
        let response = HttpResponse::new(500, r#"{"error":"server_error","error_description":"down"}"#);
        let err = handle_default_response(&response, ManagedIdentitySource::AppService).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestFailed);
        assert_eq!(err.status_code(), Some(500));
        assert_eq!(err.managed_identity_source(), ManagedIdentitySource::AppService);
        assert!(err.message().contains("Error Description: down"));
    }

    #[test]
    fn test_error_message_fallback_chain() {
        assert_eq!(message_from_error_response(""), messages::NO_RESPONSE_RECEIVED);

        let message = message_from_error_response(r#"{"notExpectedJson":"someValue"}"#);
        assert!(message.starts_with(messages::UNEXPECTED_ERROR_RESPONSE));
        assert!(message.contains(r#"{"notExpectedJson":"someValue"}"#));

        let message = message_from_error_response("notExpectedJson");
        assert!(message.contains("notExpectedJson"));

        let message = message_from_error_response(r#"{"error":{"code":"BadRequest","message":"nope"}}"#);
        assert_eq!(message, "[Managed Identity] Error Code: BadRequest Error Message: nope");
    }

    #[test]
    fn test_bypass_cache_always_sent() {
        let config = ManagedIdentityConfig::default().with_client_capabilities(["cp1", "cp2"]);

        let mut req = request();
        apply_claims_and_capabilities(&mut req, &AcquireTokenParameters::new("r"), &config);
        assert_eq!(req.query_parameters.get("bypass_cache").map(String::as_str), Some("false"));
        assert!(!req.query_parameters.contains_key("xms_cc"));

        let mut req = request();
        let params = AcquireTokenParameters::new("r")
            .with_claims(r#"{"access_token":{"nbf":{"essential":true}}}"#)
            .with_revoked_token("old-token");
        apply_claims_and_capabilities(&mut req, &params, &config);
        assert_eq!(req.query_parameters.get("bypass_cache").map(String::as_str), Some("true"));
        assert_eq!(req.query_parameters.get("xms_cc").map(String::as_str), Some("cp1,cp2"));
        assert_eq!(
            req.query_parameters.get("token_sha256_to_refresh"),
            Some(&sha256_hex("old-token"))
        );
    }

    #[test]
    fn test_empty_claims_treated_as_absent() {
        let mut req = request();
        let params = AcquireTokenParameters::new("r").with_claims("");
        apply_claims_and_capabilities(&mut req, &params, &ManagedIdentityConfig::default());
        assert_eq!(req.query_parameters.get("bypass_cache").map(String::as_str), Some("false"));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_qualifier_keys() {
        let id = ManagedIdentityId::ResourceId("/subscriptions/x".into());
        assert_eq!(
            user_assigned_query_param(&id, IMDS_QUALIFIER_KEYS),
            Some(("msi_res_id", "/subscriptions/x"))
        );
        assert_eq!(
            user_assigned_query_param(&id, DEFAULT_QUALIFIER_KEYS),
            Some(("mi_res_id", "/subscriptions/x"))
        );
        assert_eq!(
            user_assigned_query_param(&ManagedIdentityId::SystemAssigned, DEFAULT_QUALIFIER_KEYS),
            None
        );
    }

    #[test]
    fn test_parse_endpoint() {
        assert!(parse_endpoint("http://localhost:40342/token", "IDENTITY_ENDPOINT", ManagedIdentitySource::AzureArc).is_ok());

        for bad in ["localhost:40342", "not a uri", "file:///etc/passwd"] {
            let err = parse_endpoint(bad, "IDENTITY_ENDPOINT", ManagedIdentitySource::AzureArc).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
            assert_eq!(err.error_code(), codes::INVALID_ENDPOINT);
            assert!(err.message().contains("IDENTITY_ENDPOINT"));
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_empty_token_or_expiry_never_succeeds(
            token in proptest::option::of("[a-zA-Z0-9]{0,8}"),
            expires in proptest::option::of("[0-9]{0,10}"),
            resource in proptest::option::of("[a-z]{1,8}"),
            token_type in proptest::option::of("[A-Za-z]{1,8}"),
        ) {
            let mut body = serde_json::Map::new();
            for (key, value) in [
                ("access_token", &token),
                ("expires_on", &expires),
                ("resource", &resource),
                ("token_type", &token_type),
            ] {
                if let Some(value) = value {
                    body.insert(key.to_string(), serde_json::Value::String(value.clone()));
                }
            }
            let body = serde_json::Value::Object(body).to_string();

            let result = get_successful_response(&body, ManagedIdentitySource::Imds);
            let complete = token.as_deref().is_some_and(|t| !t.is_empty())
                && expires.as_deref().is_some_and(|e| !e.is_empty());
            if complete {
                proptest::prop_assert!(result.is_ok());
            } else {
                proptest::prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidResponse);
            }
        }
    }
}
