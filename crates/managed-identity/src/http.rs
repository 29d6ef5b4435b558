//! HTTP collaborator
//!
//! [`HttpManager`] is the only way this crate touches the network. Any HTTP
//! status, success or not, comes back as an [`HttpResponse`]; only transport
//! failures (connect, timeout, TLS, cancellation) are errors. Sources then
//! classify both outcomes in one place.
//!
//! [`ReqwestHttpManager`] is the default implementation:
//! - NO redirects (a token endpoint never legitimately redirects)
//! - rustls for TLS, with per-thumbprint pinned clients for Service Fabric
//! - per-certificate mTLS clients for the IMDSv2 token endpoint
//! - status-based retries following [`RetryPolicy`]

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use http::Method;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::{RequestKind, RetryPolicy};
use crate::error::BoxError;
use crate::tls;

/// Client certificate presented during the TLS handshake
#[derive(Clone)]
pub struct ClientIdentity {
    certificate_pem: String,
    private_key_pem: SecretString,
    thumbprint: String,
}

impl ClientIdentity {
    /// Identity from a PEM certificate, its PKCS#8 PEM key and the
    /// certificate's thumbprint
    pub fn new(certificate_pem: String, private_key_pem: SecretString, thumbprint: String) -> Self {
        Self {
            certificate_pem,
            private_key_pem,
            thumbprint,
        }
    }

    /// PEM certificate
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Thumbprint of the certificate
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    fn to_reqwest(&self) -> Result<reqwest::Identity, TransportError> {
        let mut pem = Vec::with_capacity(self.certificate_pem.len() + 2048);
        pem.extend_from_slice(self.private_key_pem.expose_secret().as_bytes());
        pem.push(b'\n');
        pem.extend_from_slice(self.certificate_pem.as_bytes());
        reqwest::Identity::from_pem(&pem).map_err(|e| TransportError::Tls(e.to_string()))
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("thumbprint", &self.thumbprint)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Request body with its content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpBody {
    /// Serialized body
    pub content: String,
    /// `Content-Type` header value
    pub content_type: &'static str,
}

impl HttpBody {
    /// `application/x-www-form-urlencoded`
    pub fn form(content: String) -> Self {
        Self {
            content,
            content_type: "application/x-www-form-urlencoded",
        }
    }

    /// `application/json`
    pub fn json(content: String) -> Self {
        Self {
            content,
            content_type: "application/json",
        }
    }
}

/// A fully materialized request
#[derive(Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Final URI, query included
    pub uri: Url,
    /// Headers in insertion order
    pub headers: Vec<(String, String)>,
    /// Optional body
    pub body: Option<HttpBody>,
    /// Client certificate for mTLS
    pub client_identity: Option<ClientIdentity>,
    /// Accept a server certificate with this SHA-1 thumbprint when chain validation fails
    pub server_certificate_thumbprint: Option<String>,
    /// Retry class
    pub kind: RequestKind,
    /// Overrides the manager's default timeout
    pub timeout: Option<Duration>,
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("uri", &self.uri.as_str())
            .field("headers", &header_names)
            .field("has_body", &self.body.is_some())
            .field("client_identity", &self.client_identity)
            .field("server_certificate_thumbprint", &self.server_certificate_thumbprint)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Response of any status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Headers keyed by lowercase name
    pub headers: HashMap<String, String>,
    /// Body as text
    pub body: String,
}

impl HttpResponse {
    /// Response with `status` and `body` and no headers
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Transport failures, as opposed to non-success statuses
#[derive(Debug, Error)]
pub enum TransportError {
    /// DNS failure or connection refused
    #[error("endpoint unreachable: {message}")]
    Unreachable {
        /// Transport message
        message: String,
        /// Underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// The request did not complete in time
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The cancellation token fired
    #[error("request cancelled")]
    Cancelled,

    /// The request could not be built (bad URI, bad header)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// TLS configuration or client identity problem
    #[error("TLS error: {0}")]
    Tls(String),

    /// Anything else
    #[error("{message}")]
    Other {
        /// Transport message
        message: String,
        /// Underlying error
        #[source]
        source: Option<BoxError>,
    },
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Unreachable {
                message: err.to_string(),
                source: Some(Box::new(err)),
            }
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Other {
                message: err.to_string(),
                source: Some(Box::new(err)),
            }
        }
    }
}

/// Sends requests on behalf of the managed identity sources
#[async_trait]
pub trait HttpManager: Send + Sync + fmt::Debug {
    /// Send `request`, racing it against `cancel`.
    ///
    /// Returns `Ok` for every HTTP status.
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError>;
}

/// [`HttpManager`] backed by reqwest
pub struct ReqwestHttpManager {
    default_client: reqwest::Client,
    mtls_clients: DashMap<String, reqwest::Client>,
    pinned_clients: DashMap<String, reqwest::Client>,
    timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ReqwestHttpManager {
    /// Create a manager with the given default timeout and retry policy
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration, retry_policy: RetryPolicy) -> Result<Self, TransportError> {
        let default_client = Self::builder(timeout)
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            default_client,
            mtls_clients: DashMap::new(),
            pinned_clients: DashMap::new(),
            timeout,
            retry_policy,
        })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
    }

    fn client_for(&self, request: &HttpRequest) -> Result<reqwest::Client, TransportError> {
        if let Some(identity) = &request.client_identity {
            if let Some(client) = self.mtls_clients.get(identity.thumbprint()) {
                return Ok(client.clone());
            }
            let client = Self::builder(self.timeout)
                .use_rustls_tls()
                .identity(identity.to_reqwest()?)
                .build()
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            debug!(thumbprint = identity.thumbprint(), "[Managed Identity] Created mTLS client");
            self.mtls_clients
                .insert(identity.thumbprint().to_string(), client.clone());
            return Ok(client);
        }

        if let Some(thumbprint) = &request.server_certificate_thumbprint {
            if let Some(client) = self.pinned_clients.get(thumbprint) {
                return Ok(client.clone());
            }
            let client = Self::builder(self.timeout)
                .use_preconfigured_tls(tls::pinned_client_config(thumbprint)?)
                .build()
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            self.pinned_clients.insert(thumbprint.clone(), client.clone());
            return Ok(client);
        }

        Ok(self.default_client.clone())
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        request: &HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        let mut builder = client.request(request.method.clone(), request.uri.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, body.content_type)
                .body(body.content.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(HttpResponse { status, headers, body })
    }
}

impl fmt::Debug for ReqwestHttpManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestHttpManager")
            .field("default_client", &"<reqwest::Client>")
            .field("mtls_clients", &self.mtls_clients.len())
            .field("pinned_clients", &self.pinned_clients.len())
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

#[async_trait]
impl HttpManager for ReqwestHttpManager {
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let client = self.client_for(&request)?;
        let max_retries = self.retry_policy.max_retries_for(request.kind);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = self.execute(&client, &request) => result?,
            };

            if attempt >= max_retries || !self.retry_policy.should_retry(request.kind, response.status) {
                return Ok(response);
            }

            let delay = self.retry_policy.delay(attempt);
            attempt += 1;
            warn!(
                status = response.status,
                attempt,
                delay_ms = delay.as_millis() as u64,
                uri = %request.uri.path(),
                "[Managed Identity] Retrying request"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn get(uri: &str) -> HttpRequest {
        HttpRequest {
            method: Method::GET,
            uri: Url::parse(uri).unwrap(),
            headers: vec![("Metadata".to_string(), "true".to_string())],
            body: None,
            client_identity: None,
            server_certificate_thumbprint: None,
            kind: RequestKind::Default,
            timeout: None,
        }
    }

    fn manager(retries: u32) -> ReqwestHttpManager {
        let policy = RetryPolicy {
            max_retries: retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        ReqwestHttpManager::new(Duration::from_secs(5), policy).unwrap()
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("Metadata", "true"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header("X-Custom", "v")
                    .set_body_string("bad"),
            )
            .mount(&server)
            .await;

        let response = manager(0)
            .send(get(&format!("{}/token", server.uri())), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, 400);
        assert_eq!(response.body, "bad");
        assert_eq!(response.header("x-custom"), Some("v"));
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_returns_last_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let response = manager(2)
            .send(get(&server.uri()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager(0).send(get("http://127.0.0.1:9/"), &cancel).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        // Port 9 (discard) is closed on test hosts
        let result = manager(0)
            .send(get("http://127.0.0.1:9/"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }

    #[test]
    fn test_debug_hides_header_values() {
        let mut request = get("http://localhost/");
        request.headers.push(("secret".into(), "do-not-log".into()));
        assert!(!format!("{request:?}").contains("do-not-log"));
    }
}
