//! Error model shared by every managed identity source
//!
//! All failures leave this crate as a [`ManagedIdentityError`]. The
//! [`ErrorKind`] carries the semantic classification callers branch on;
//! the error code is a stable string suitable for telemetry.

use std::error::Error as StdError;

use thiserror::Error;

use crate::http::TransportError;
use crate::source::ManagedIdentitySource;

/// Boxed inner error
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ManagedIdentityError>;

/// Stable error codes
pub mod codes {
    /// Non-success response from a managed identity endpoint
    pub const REQUEST_FAILED: &str = "managed_identity_request_failed";
    /// The endpoint could not be reached at all
    pub const UNREACHABLE_NETWORK: &str = "managed_identity_unreachable_network";
    /// 200 OK with a body that is not the expected JSON
    pub const RESPONSE_PARSE_FAILURE: &str = "managed_identity_response_parse_failure";
    /// Parsed body without an access token or expiry
    pub const INVALID_RESPONSE: &str = "invalid_managed_identity_response";
    /// An endpoint environment variable is not an absolute http(s) URI
    pub const INVALID_ENDPOINT: &str = "invalid_managed_identity_endpoint";
    /// A required environment variable is missing
    pub const MISSING_ENVIRONMENT: &str = "managed_identity_missing_environment";
    /// No managed identity source is available
    pub const SOURCE_UNAVAILABLE: &str = "managed_identity_source_unavailable";
    /// The source only supports system-assigned identities
    pub const USER_ASSIGNED_NOT_SUPPORTED: &str = "user_assigned_managed_identity_not_supported";
    /// Azure Arc answered 401 without a `WWW-Authenticate` header
    pub const NO_CHALLENGE: &str = "managed_identity_no_challenge_error";
    /// The Azure Arc challenge header is not of the form `key=path`
    pub const INVALID_CHALLENGE: &str = "managed_identity_invalid_challenge";
    /// The Azure Arc challenge points outside the token directory or at a missing file
    pub const INVALID_FILE_PATH: &str = "managed_identity_invalid_file_path";
    /// The Azure Arc key file exceeds the size bound
    pub const FILE_TOO_LARGE: &str = "managed_identity_file_too_large";
    /// Azure Arc is not supported on this platform
    pub const PLATFORM_NOT_SUPPORTED: &str = "managed_identity_platform_not_supported";
    /// The operation was cancelled or timed out
    pub const CANCELLED: &str = "managed_identity_cancelled";
    /// mTLS proof-of-possession requested from a source that cannot bind tokens
    pub const MTLS_POP_NOT_SUPPORTED: &str = "mtls_pop_not_supported";
    /// Invalid caller input (empty resource, empty capability)
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// CSR or key generation failed
    pub const CSR_GENERATION_FAILED: &str = "managed_identity_csr_generation_failed";
}

/// Fixed diagnostic messages
pub mod messages {
    /// Prefix on every message emitted by this crate
    pub const PREFIX: &str = "[Managed Identity]";

    /// Empty error body
    pub const NO_RESPONSE_RECEIVED: &str =
        "[Managed Identity] Authentication unavailable. No response received from the managed identity endpoint.";

    /// Parsed success body without token or expiry
    pub const INVALID_RESPONSE: &str = "[Managed Identity] Invalid response, the authentication response received did not contain the expected fields.";

    /// Success status with an unparseable body
    pub const PARSE_FAILURE: &str =
        "[Managed Identity] MSI returned 200 OK, but the response could not be parsed.";

    /// Error body matched none of the known envelopes
    pub const UNEXPECTED_ERROR_RESPONSE: &str =
        "[Managed Identity] The error response was either empty or could not be parsed.";

    /// Logged whenever a request is cancelled or times out
    pub const TIMEOUT: &str =
        "[Managed Identity] Authentication unavailable. The request to the managed identity endpoint timed out.";

    /// IMDS 400
    pub const IDENTITY_UNAVAILABLE: &str = "[Managed Identity] Authentication unavailable. Either the requested identity has not been assigned to this resource, or other errors could be present. Ensure the identity is correctly assigned and check the inner exception for more details. For more information, visit https://aka.ms/msal-managed-identity.";

    /// IMDS 502 / 504
    pub const GATEWAY_ERROR: &str =
        "[Managed Identity] Authentication unavailable. The request failed due to a gateway error.";
}

/// Semantic classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing configuration, or a feature the source does not support
    Configuration,
    /// The transport could not reach the endpoint (DNS, connection refused)
    UnreachableNetwork,
    /// Cancelled by the caller or timed out
    Cancelled,
    /// Azure Arc challenge missing, malformed or pointing at a disallowed file
    Challenge,
    /// 200 OK, but the body was not the expected JSON
    ResponseParse,
    /// Body parsed but lacked an access token or expiry
    InvalidResponse,
    /// IMDS reports that the identity is not assigned to this resource
    IdentityUnavailable,
    /// IMDS answered 502 or 504
    Gateway,
    /// Any other non-success response or unexpected failure
    RequestFailed,
}

/// The single error type surfaced by this crate
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ManagedIdentityError {
    kind: ErrorKind,
    error_code: &'static str,
    message: String,
    source_kind: ManagedIdentitySource,
    status_code: Option<u16>,
    #[source]
    inner: Option<BoxError>,
}

impl ManagedIdentityError {
    /// Create an error of `kind` with a stable `error_code`
    pub fn new(
        kind: ErrorKind,
        error_code: &'static str,
        message: impl Into<String>,
        source: ManagedIdentitySource,
    ) -> Self {
        Self {
            kind,
            error_code,
            message: message.into(),
            source_kind: source,
            status_code: None,
            inner: None,
        }
    }

    /// Configuration error
    pub fn configuration(
        error_code: &'static str,
        message: impl Into<String>,
        source: ManagedIdentitySource,
    ) -> Self {
        Self::new(ErrorKind::Configuration, error_code, message, source)
    }

    /// Service error for a non-success status
    pub fn request_failed(
        message: impl Into<String>,
        source: ManagedIdentitySource,
        status_code: Option<u16>,
    ) -> Self {
        let mut err = Self::new(ErrorKind::RequestFailed, codes::REQUEST_FAILED, message, source);
        err.status_code = status_code;
        err
    }

    /// Azure Arc challenge error
    pub fn challenge(
        error_code: &'static str,
        message: impl Into<String>,
        source: ManagedIdentitySource,
    ) -> Self {
        Self::new(ErrorKind::Challenge, error_code, message, source)
    }

    /// Cancellation or timeout
    pub fn cancelled(source: ManagedIdentitySource) -> Self {
        Self::new(ErrorKind::Cancelled, codes::CANCELLED, messages::TIMEOUT, source)
    }

    /// Attach the HTTP status code
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Attach the underlying error
    pub fn with_inner(mut self, inner: impl Into<BoxError>) -> Self {
        self.inner = Some(inner.into());
        self
    }

    /// Semantic classification
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Stable error code, see [`codes`]
    pub fn error_code(&self) -> &'static str {
        self.error_code
    }

    /// Human readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Managed identity source the failure came from
    pub fn managed_identity_source(&self) -> ManagedIdentitySource {
        self.source_kind
    }

    /// HTTP status of the failing response, if there was one
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// True when managed identity is simply not usable from this host,
    /// which callers typically treat as "try the next credential"
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::UnreachableNetwork | ErrorKind::IdentityUnavailable
        )
    }

    /// True for failures a caller may reasonably retry
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Gateway)
            || self.status_code.is_some_and(|status| status >= 500 || status == 429)
    }

    /// Classify a transport failure.
    ///
    /// Every error that crosses from the HTTP collaborator into this crate
    /// goes through here, so the mapping lives in exactly one place.
    pub(crate) fn from_transport(err: TransportError, source: ManagedIdentitySource) -> Self {
        match err {
            TransportError::Unreachable { ref message, .. } => Self::new(
                ErrorKind::UnreachableNetwork,
                codes::UNREACHABLE_NETWORK,
                format!("{} {}", messages::PREFIX, message),
                source,
            )
            .with_inner(err),
            TransportError::Timeout(_) | TransportError::Cancelled => {
                Self::cancelled(source).with_inner(err)
            }
            TransportError::InvalidRequest(ref message) => Self::configuration(
                codes::INVALID_ENDPOINT,
                format!("{} Invalid request: {}", messages::PREFIX, message),
                source,
            )
            .with_inner(err),
            TransportError::Tls(_) | TransportError::Other { .. } => {
                let message = format!("{} Request failed: {}", messages::PREFIX, err);
                Self::request_failed(message, source, None).with_inner(err)
            }
        }
    }

    pub(crate) fn with_source_if_unset(mut self, source: ManagedIdentitySource) -> Self {
        if self.source_kind == ManagedIdentitySource::None {
            self.source_kind = source;
        }
        self
    }
}

impl From<managed_identity_csr::CsrError> for ManagedIdentityError {
    fn from(err: managed_identity_csr::CsrError) -> Self {
        Self::new(
            ErrorKind::RequestFailed,
            codes::CSR_GENERATION_FAILED,
            format!("{} Failed to generate the certificate signing request: {}", messages::PREFIX, err),
            ManagedIdentitySource::Credential,
        )
        .with_inner(err)
    }
}
