//! Certificate-bound credential flow (IMDSv2)
//!
//! 1. `getplatformmetadata` returns the identity's client id, tenant id and
//!    compute unit id. Hosts whose IMDS build is too old, or that do not
//!    answer, simply do not offer the flow.
//! 2. A fresh RSA key signs a CSR for `CN=<client id>, DC=<tenant id>`;
//!    `issuecredential` exchanges it for a short-lived certificate.
//! 3. The certificate authenticates an OAuth2 client-credentials request
//!    over mTLS directly against the regional token endpoint.
//!
//! Issued certificates are kept in the [`BindingCache`](crate::binding::BindingCache)
//! per identity and token type, and reused until close to expiry.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::Method;
use managed_identity_csr::{Csr, CuidInfo, RsaPrivateKey};
use once_cell::sync::Lazy;
use pem::{EncodeConfig, LineEnding as PemLineEnding, Pem};
use regex::Regex;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binding::{CertificateBinding, TokenType};
use crate::client::{
    self, AcquireTokenParameters, IMDS_QUALIFIER_KEYS, RequestContext, message_from_error_response,
    user_assigned_query_param,
};
use crate::config::RequestKind;
use crate::error::{ErrorKind, ManagedIdentityError, Result, codes, messages};
use crate::http::{ClientIdentity, HttpResponse, TransportError};
use crate::probe::Availability;
use crate::request::{ManagedIdentityRequest, headers};
use crate::response::ManagedIdentityResponse;
use crate::source::ManagedIdentitySource;
use crate::sources::imds::imds_endpoint;
use crate::tls::certificate_thumbprint;

/// `cred-api-version` of the IMDS credential endpoints
pub const CRED_API_VERSION: &str = "2.0";
/// Platform metadata path
pub const CSR_METADATA_PATH: &str = "/metadata/identity/getplatformmetadata";
/// Certificate issuance path
pub const CERTIFICATE_REQUEST_PATH: &str = "/metadata/identity/issuecredential";
/// Appended to `{mtls endpoint}/{tenant}`
pub const TOKEN_PATH: &str = "/oauth2/v2.0/token";
/// IMDS builds up to and including this one lack the credential endpoint
pub const MIN_IMDS_BUILD: u32 = 1324;
/// `client_assertion_type` for the credential returned by IMDS
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

const SOURCE: ManagedIdentitySource = ManagedIdentitySource::Credential;

static SERVER_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^IMDS/\d+\.\d+\.\d+\.(\d+)$").unwrap());

/// True when the `Server` header names an IMDS build new enough for IMDSv2
pub fn imds_build_supported(server: &str) -> bool {
    SERVER_HEADER
        .captures(server.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|build| build.as_str().parse::<u32>().ok())
        .is_some_and(|build| build > MIN_IMDS_BUILD)
}

/// Platform metadata needed to build a CSR
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsrMetadata {
    /// Client id of the identity
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// Tenant of the identity
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Compute unit id
    #[serde(rename = "cuId")]
    pub cuid: CuidInfo,
    /// Attestation service for hardware-backed keys
    #[serde(rename = "attestationEndpoint")]
    pub attestation_endpoint: String,
}

#[derive(Deserialize)]
struct RawCsrMetadata {
    #[serde(rename = "clientId", default)]
    client_id: Option<String>,
    #[serde(rename = "tenantId", default)]
    tenant_id: Option<String>,
    #[serde(rename = "cuId", default)]
    cuid: Option<RawCuid>,
    #[serde(rename = "attestationEndpoint", default)]
    attestation_endpoint: Option<String>,
}

#[derive(Deserialize)]
struct RawCuid {
    #[serde(rename = "vmId", default)]
    vm_id: Option<String>,
    #[serde(rename = "vmssId", default)]
    vmss_id: Option<String>,
}

impl CsrMetadata {
    /// Parse a metadata body. Every field must be present and non-empty.
    pub fn from_json(body: &str) -> Option<Self> {
        let raw: RawCsrMetadata = serde_json::from_str(body).ok()?;
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let cuid = raw.cuid?;
        let mut cuid_info = CuidInfo::new(non_empty(cuid.vm_id)?);
        if let Some(vmss_id) = non_empty(cuid.vmss_id) {
            cuid_info = cuid_info.with_vmss_id(vmss_id);
        }

        Some(Self {
            client_id: non_empty(raw.client_id)?,
            tenant_id: non_empty(raw.tenant_id)?,
            cuid: cuid_info,
            attestation_endpoint: non_empty(raw.attestation_endpoint)?,
        })
    }
}

/// Normalize the attestation endpoint to an https URI.
///
/// IMDS currently returns a bare host. Plain http is refused.
pub fn normalize_attestation_endpoint(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    match Url::parse(raw) {
        Ok(url) if url.scheme() == "https" => Some(url),
        Ok(url) if url.scheme() == "http" => {
            warn!(
                endpoint = raw,
                "[Managed Identity] Attestation endpoint uses http. HTTPS is required."
            );
            None
        }
        _ => match Url::parse(&format!("https://{raw}")) {
            Ok(url) if url.host_str().is_some() => {
                info!(from = raw, to = %url, "[Managed Identity] Normalized attestation endpoint");
                Some(url)
            }
            _ => {
                warn!(endpoint = raw, "[Managed Identity] Failed to normalize attestation endpoint");
                None
            }
        },
    }
}

/// `issuecredential` request body
#[derive(Debug, Serialize)]
struct CertificateRequestBody<'a> {
    csr: &'a str,
    attestation_token: &'a str,
}

/// `issuecredential` response
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateRequestResponse {
    /// Client id the certificate was issued for
    #[serde(default)]
    pub client_id: String,
    /// Tenant of the identity
    #[serde(default)]
    pub tenant_id: String,
    /// Base64 DER certificate
    #[serde(default)]
    pub certificate: String,
    /// System or user assigned
    #[serde(default)]
    pub identity_type: Option<String>,
    /// Regional token endpoint accepting the certificate
    #[serde(default)]
    pub mtls_authentication_endpoint: String,
    /// Client assertion to send with the token request, when issued
    #[serde(default)]
    pub credential: Option<SecretString>,
}

impl CertificateRequestResponse {
    /// Check the fields the token request depends on.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidResponse`] naming the first empty field.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("client_id", &self.client_id),
            ("tenant_id", &self.tenant_id),
            ("certificate", &self.certificate),
            ("mtls_authentication_endpoint", &self.mtls_authentication_endpoint),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            let message = format!("[ImdsV2] The certificate request response is missing {field}.");
            error!("{message}");
            return Err(ManagedIdentityError::new(
                ErrorKind::InvalidResponse,
                codes::INVALID_RESPONSE,
                message,
                SOURCE,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EntraTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Fetch platform metadata.
///
/// In probe mode every failure is reported as [`Availability::Unavailable`]
/// except cancellation. Outside probe mode the same failures are errors.
///
/// # Errors
///
/// Cancellation always; request failures when `probe_mode` is false.
pub(crate) async fn fetch_csr_metadata(
    ctx: &RequestContext,
    cancel: &CancellationToken,
    probe_mode: bool,
) -> Result<Availability<CsrMetadata>> {
    let source = if probe_mode { ManagedIdentitySource::ImdsV2 } else { SOURCE };
    let unavailable = |reason: String, status: Option<u16>| -> Result<Availability<CsrMetadata>> {
        if probe_mode {
            info!(reason = %reason, "[Managed Identity] IMDSv2 managed identity is not available");
            Ok(Availability::Unavailable(reason))
        } else {
            let message = format!("[ImdsV2] Fetching CSR metadata failed. {reason}");
            error!("{message}");
            Err(ManagedIdentityError::request_failed(message, source, status))
        }
    };

    if cancel.is_cancelled() {
        return Err(ManagedIdentityError::cancelled(source));
    }

    let mut request = ManagedIdentityRequest::new(Method::GET, imds_endpoint(&ctx.env, CSR_METADATA_PATH)?)
        .with_kind(RequestKind::CsrMetadataProbe);
    request
        .header(headers::METADATA, "true")
        .header(headers::CLIENT_REQUEST_ID, ctx.correlation_id.to_string())
        .query("cred-api-version", CRED_API_VERSION);
    if let Some((key, value)) = user_assigned_query_param(ctx.identity(), IMDS_QUALIFIER_KEYS) {
        request.query(key, value);
    }

    let timeout = if probe_mode { ctx.config.probe_timeout } else { ctx.config.request_timeout };
    let response = match ctx.http.send(request.into_http_request(Some(timeout)), cancel).await {
        Ok(response) => response,
        Err(TransportError::Cancelled) => {
            error!("{}", messages::TIMEOUT);
            return Err(ManagedIdentityError::cancelled(source));
        }
        Err(err) => return unavailable(format!("Request to the CSR metadata endpoint failed: {err}"), None),
    };

    if response.status != 200 {
        return unavailable(
            format!("Status code: {} Body: {}", response.status, response.body),
            Some(response.status),
        );
    }

    let Some(server) = response.header("server") else {
        return unavailable("The 'server' header is missing from the CSR metadata response.".into(), Some(200));
    };
    if !imds_build_supported(server) {
        return unavailable(
            format!("The 'server' header '{server}' does not name a supported IMDS build."),
            Some(200),
        );
    }

    match CsrMetadata::from_json(&response.body) {
        Some(metadata) => {
            info!("[Managed Identity] IMDSv2 managed identity is available");
            Ok(Availability::Available(metadata))
        }
        None => unavailable(format!("The CSR metadata response is invalid. Body: {}", response.body), Some(200)),
    }
}

/// Credential flow client
#[derive(Debug, Clone)]
pub struct CredentialSource {
    certificate_endpoint: Url,
}

impl CredentialSource {
    pub(crate) fn new(ctx: &RequestContext) -> Result<Self> {
        let certificate_endpoint = imds_endpoint(&ctx.env, CERTIFICATE_REQUEST_PATH)?;
        info!("[Managed Identity] Creating credential managed identity source");
        Ok(Self { certificate_endpoint })
    }

    pub(crate) async fn authenticate(
        &self,
        ctx: &RequestContext,
        params: &AcquireTokenParameters,
        cancel: &CancellationToken,
    ) -> Result<ManagedIdentityResponse> {
        if cancel.is_cancelled() {
            error!("{}", messages::TIMEOUT);
            return Err(ManagedIdentityError::cancelled(SOURCE));
        }

        let token_type = if params.mtls_pop { TokenType::MtlsPop } else { TokenType::Bearer };
        let binding = self.get_or_mint_binding(ctx, token_type, cancel).await?;

        let request = token_request(ctx, params, &binding, token_type)?;
        let response = client::send(ctx, request, SOURCE, cancel).await?;
        handle_token_response(&response, params, &binding)
    }

    async fn get_or_mint_binding(
        &self,
        ctx: &RequestContext,
        token_type: TokenType,
        cancel: &CancellationToken,
    ) -> Result<CertificateBinding> {
        let identity_key = ctx.identity().cache_key();
        let bindings = ctx.state.bindings();

        if let Some(binding) = bindings.get_fresh(&identity_key, token_type, chrono::Utc::now().timestamp()) {
            debug!(
                identity = %identity_key,
                thumbprint = %binding.thumbprint,
                "[Managed Identity] Reusing cached certificate binding"
            );
            return Ok(binding);
        }

        let gate = bindings.mint_gate(&identity_key, token_type);
        let _gate = gate.lock().await;
        if let Some(binding) = bindings.get_fresh(&identity_key, token_type, chrono::Utc::now().timestamp()) {
            debug!(
                identity = %identity_key,
                thumbprint = %binding.thumbprint,
                "[Managed Identity] Certificate binding minted by a concurrent request"
            );
            return Ok(binding);
        }

        let metadata = match fetch_csr_metadata(ctx, cancel, false).await? {
            Availability::Available(metadata) => metadata,
            Availability::Unavailable(reason) => {
                return Err(ManagedIdentityError::request_failed(reason, SOURCE, None));
            }
        };
        if let Some(endpoint) = normalize_attestation_endpoint(&metadata.attestation_endpoint) {
            debug!(endpoint = %endpoint, "[Managed Identity] Attestation endpoint");
        }

        let key = generate_key().await?;
        let csr = Csr::generate_with_key(&key, &metadata.client_id, &metadata.tenant_id, &metadata.cuid)?;
        let response = self.request_certificate(ctx, csr.pem(), cancel).await?;
        let binding = bind(response, &key)?;

        let subject = format!("CN={}, DC={}", metadata.client_id, metadata.tenant_id);
        bindings.record(&identity_key, token_type, &subject, binding.clone());
        if token_type == TokenType::MtlsPop {
            warn!(
                thumbprint = %binding.thumbprint,
                "[Managed Identity] mTLS PoP certificate is bound to a software key without hardware protection"
            );
        }
        info!(
            thumbprint = %binding.thumbprint,
            token_type = token_type.as_str(),
            "[Managed Identity] Minted certificate binding"
        );
        Ok(binding)
    }

    async fn request_certificate(
        &self,
        ctx: &RequestContext,
        csr_pem: &str,
        cancel: &CancellationToken,
    ) -> Result<CertificateRequestResponse> {
        let body = CertificateRequestBody {
            csr: csr_pem,
            attestation_token: "",
        };

        let mut request =
            ManagedIdentityRequest::new(Method::POST, self.certificate_endpoint.clone()).with_kind(RequestKind::Imds);
        request
            .header(headers::METADATA, "true")
            .header(headers::CLIENT_REQUEST_ID, ctx.correlation_id.to_string())
            .query("cred-api-version", CRED_API_VERSION);
        if let Some((key, value)) = user_assigned_query_param(ctx.identity(), IMDS_QUALIFIER_KEYS) {
            request.query(key, value);
        }
        request.content = Some(serde_json::to_string(&body).map_err(|e| {
            ManagedIdentityError::new(ErrorKind::RequestFailed, codes::CSR_GENERATION_FAILED, e.to_string(), SOURCE)
                .with_inner(e)
        })?);

        let response = client::send(ctx, request, SOURCE, cancel).await?;
        if response.status != 200 {
            let message = format!(
                "[ImdsV2] The certificate request failed. Status code: {} {}",
                response.status,
                message_from_error_response(&response.body)
            );
            error!("{message}");
            return Err(ManagedIdentityError::request_failed(message, SOURCE, Some(response.status)));
        }

        let parsed: CertificateRequestResponse = serde_json::from_str(&response.body).map_err(|e| {
            error!(error = %e, "{}", messages::PARSE_FAILURE);
            ManagedIdentityError::new(
                ErrorKind::ResponseParse,
                codes::RESPONSE_PARSE_FAILURE,
                messages::PARSE_FAILURE,
                SOURCE,
            )
            .with_status(200)
            .with_inner(e)
        })?;
        parsed.validate()?;
        Ok(parsed)
    }
}

/// RSA key generation is CPU bound; keep it off the async workers
async fn generate_key() -> Result<RsaPrivateKey> {
    tokio::task::spawn_blocking(managed_identity_csr::generate_key)
        .await
        .map_err(|e| {
            ManagedIdentityError::new(
                ErrorKind::RequestFailed,
                codes::CSR_GENERATION_FAILED,
                format!("[ImdsV2] Key generation task failed: {e}"),
                SOURCE,
            )
        })?
        .map_err(ManagedIdentityError::from)
}

/// Pair the issued certificate with its key
pub(crate) fn bind(response: CertificateRequestResponse, key: &RsaPrivateKey) -> Result<CertificateBinding> {
    let invalid = |message: String| {
        error!("{message}");
        ManagedIdentityError::new(ErrorKind::InvalidResponse, codes::INVALID_RESPONSE, message, SOURCE)
    };

    let der = STANDARD
        .decode(response.certificate.trim())
        .map_err(|e| invalid(format!("[ImdsV2] The issued certificate is not valid base64: {e}")))?;
    let (_, certificate) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| invalid(format!("[ImdsV2] The issued certificate could not be parsed: {e}")))?;
    let not_after = certificate.validity().not_after.timestamp();

    let thumbprint = certificate_thumbprint(&der);
    let key_pem = key.to_pkcs8_pem(LineEnding::LF).map_err(|e| {
        ManagedIdentityError::new(
            ErrorKind::RequestFailed,
            codes::CSR_GENERATION_FAILED,
            format!("[ImdsV2] Failed to encode the private key: {e}"),
            SOURCE,
        )
    })?;
    let identity = ClientIdentity::new(
        pem_encode("CERTIFICATE", &der),
        SecretString::new(key_pem.as_str().to_owned()),
        thumbprint.clone(),
    );

    Ok(CertificateBinding {
        response,
        thumbprint,
        identity,
        not_after,
    })
}

fn pem_encode(label: &str, der: &[u8]) -> String {
    pem::encode_config(&Pem::new(label, der), EncodeConfig::new().set_line_ending(PemLineEnding::LF))
}

/// Client-credentials request against the regional token endpoint
pub(crate) fn token_request(
    ctx: &RequestContext,
    params: &AcquireTokenParameters,
    binding: &CertificateBinding,
    token_type: TokenType,
) -> Result<ManagedIdentityRequest> {
    let response = &binding.response;
    let raw = format!(
        "{}/{}{}",
        response.mtls_authentication_endpoint.trim_end_matches('/'),
        response.tenant_id,
        TOKEN_PATH
    );
    let endpoint = Url::parse(&raw).map_err(|e| {
        let message = format!("[ImdsV2] The mTLS authentication endpoint {raw} is not a valid URI.");
        error!("{message}");
        ManagedIdentityError::new(ErrorKind::InvalidResponse, codes::INVALID_ENDPOINT, message, SOURCE).with_inner(e)
    })?;

    let mut request = ManagedIdentityRequest::new(Method::POST, endpoint).with_kind(RequestKind::Sts);
    request
        .header(headers::CLIENT_REQUEST_ID, ctx.correlation_id.to_string())
        .header(headers::RETURN_CLIENT_REQUEST_ID, "true")
        .body_parameter("client_id", response.client_id.as_str())
        .body_parameter("grant_type", "client_credentials")
        .body_parameter("scope", format!("{}/.default", params.resource.trim_end_matches('/')))
        .body_parameter("token_type", token_type.as_str());
    if let Some(credential) = &response.credential {
        request
            .body_parameter("client_assertion", credential.expose_secret().as_str())
            .body_parameter("client_assertion_type", CLIENT_ASSERTION_TYPE);
    }
    request.binding_certificate = Some(binding.identity.clone());
    Ok(request)
}

fn handle_token_response(
    response: &HttpResponse,
    params: &AcquireTokenParameters,
    binding: &CertificateBinding,
) -> Result<ManagedIdentityResponse> {
    if response.status != 200 {
        let message = message_from_error_response(&response.body);
        error!(status = response.status, "[Managed Identity] Token request failed: {message}");
        return Err(ManagedIdentityError::request_failed(message, SOURCE, Some(response.status)));
    }

    let parsed: EntraTokenResponse = serde_json::from_str(&response.body).map_err(|e| {
        error!(error = %e, "{}", messages::PARSE_FAILURE);
        ManagedIdentityError::new(
            ErrorKind::ResponseParse,
            codes::RESPONSE_PARSE_FAILURE,
            messages::PARSE_FAILURE,
            SOURCE,
        )
        .with_status(200)
        .with_inner(e)
    })?;

    let Some(expires_in) = parsed.expires_in.filter(|_| !parsed.access_token.is_empty()) else {
        error!("{}", messages::INVALID_RESPONSE);
        return Err(ManagedIdentityError::new(
            ErrorKind::InvalidResponse,
            codes::INVALID_RESPONSE,
            messages::INVALID_RESPONSE,
            SOURCE,
        )
        .with_status(200));
    };

    let Some(expires_on) = chrono::Utc::now().timestamp().checked_add(expires_in) else {
        error!(expires_in, "{}", messages::INVALID_RESPONSE);
        return Err(ManagedIdentityError::new(
            ErrorKind::InvalidResponse,
            codes::INVALID_RESPONSE,
            messages::INVALID_RESPONSE,
            SOURCE,
        )
        .with_status(200));
    };

    Ok(ManagedIdentityResponse {
        access_token: parsed.access_token,
        expires_on: expires_on.to_string(),
        resource: Some(params.resource.clone()),
        token_type: parsed.token_type,
        client_id: Some(binding.response.client_id.clone()),
        refresh_in: None,
    })
}
