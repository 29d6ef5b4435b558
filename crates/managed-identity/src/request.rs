//! Request model
//!
//! A [`ManagedIdentityRequest`] is assembled fresh by a source for each
//! authentication attempt. Query parameters are merged into the URI only
//! when the request is materialized; the body comes from `content` when
//! set, otherwise from the form-encoded `body_parameters`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use http::Method;
use url::Url;

use crate::config::RequestKind;
use crate::http::{ClientIdentity, HttpBody, HttpRequest};

/// Header names shared by several sources
pub mod headers {
    /// IMDS, Cloud Shell and Azure Arc
    pub const METADATA: &str = "Metadata";
    /// Azure Arc second leg
    pub const AUTHORIZATION: &str = "Authorization";
    /// Correlation id sent to IMDSv2 and the token endpoint
    pub const CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";
    /// Ask the token endpoint to echo the correlation id
    pub const RETURN_CLIENT_REQUEST_ID: &str = "return-client-request-id";
}

/// An HTTP request under construction
#[derive(Clone)]
pub struct ManagedIdentityRequest {
    /// HTTP method
    pub method: Method,
    /// URI without the query parameters below
    pub endpoint: Url,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Merged into the URI at send time
    pub query_parameters: BTreeMap<String, String>,
    /// Form-encoded body, ignored when `content` is set
    pub body_parameters: BTreeMap<String, String>,
    /// Raw JSON body
    pub content: Option<String>,
    /// Client certificate for mTLS-bound requests
    pub binding_certificate: Option<ClientIdentity>,
    /// Pinned server certificate thumbprint (Service Fabric)
    pub server_certificate_thumbprint: Option<String>,
    /// Retry class
    pub kind: RequestKind,
}

impl ManagedIdentityRequest {
    /// Empty request for `method` on `endpoint`
    pub fn new(method: Method, endpoint: Url) -> Self {
        Self {
            method,
            endpoint,
            headers: BTreeMap::new(),
            query_parameters: BTreeMap::new(),
            body_parameters: BTreeMap::new(),
            content: None,
            binding_certificate: None,
            server_certificate_thumbprint: None,
            kind: RequestKind::Default,
        }
    }

    /// Set the retry class
    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add a header
    pub fn header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// Add a query parameter
    pub fn query(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.query_parameters.insert(name.to_string(), value.into());
        self
    }

    /// Add a form body parameter
    pub fn body_parameter(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.body_parameters.insert(name.to_string(), value.into());
        self
    }

    /// Endpoint with every query parameter appended
    pub fn compute_uri(&self) -> Url {
        let mut uri = self.endpoint.clone();
        if !self.query_parameters.is_empty() {
            uri.query_pairs_mut().extend_pairs(&self.query_parameters);
        }
        uri
    }

    /// Body to send, if any
    pub fn body(&self) -> Option<HttpBody> {
        if let Some(content) = &self.content {
            return Some(HttpBody::json(content.clone()));
        }
        if self.body_parameters.is_empty() {
            return None;
        }
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.body_parameters)
            .finish();
        Some(HttpBody::form(encoded))
    }

    /// Materialize for the HTTP collaborator
    pub fn into_http_request(self, timeout: Option<Duration>) -> HttpRequest {
        let uri = self.compute_uri();
        let body = self.body();
        HttpRequest {
            method: self.method,
            uri,
            headers: self.headers.into_iter().collect(),
            body,
            client_identity: self.binding_certificate,
            server_certificate_thumbprint: self.server_certificate_thumbprint,
            kind: self.kind,
            timeout,
        }
    }
}

impl fmt::Debug for ManagedIdentityRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header values and body parameters can carry secrets
        f.debug_struct("ManagedIdentityRequest")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint.as_str())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("query_parameters", &self.query_parameters)
            .field("body_parameters", &self.body_parameters.keys().collect::<Vec<_>>())
            .field("has_content", &self.content.is_some())
            .field("binding_certificate", &self.binding_certificate)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> ManagedIdentityRequest {
        ManagedIdentityRequest::new(
            Method::GET,
            Url::parse("http://169.254.169.254/metadata/identity/oauth2/token").unwrap(),
        )
    }

    #[test]
    fn test_query_parameters_merged_at_send_time() {
        let mut req = request();
        req.query("api-version", "2018-02-01")
            .query("resource", "https://management.azure.com/");

        // The endpoint itself is untouched
        assert_eq!(req.endpoint.query(), None);
        assert_eq!(
            req.compute_uri().as_str(),
            "http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01&resource=https%3A%2F%2Fmanagement.azure.com%2F"
        );
    }

    #[test]
    fn test_existing_endpoint_query_is_kept() {
        let mut req = ManagedIdentityRequest::new(Method::GET, Url::parse("http://localhost/token?x=1").unwrap());
        req.query("resource", "r");
        assert_eq!(req.compute_uri().as_str(), "http://localhost/token?x=1&resource=r");
    }

    #[test]
    fn test_no_body_without_parameters() {
        assert_eq!(request().body(), None);
    }

    #[test]
    fn test_form_body() {
        let mut req = request();
        req.body_parameter("resource", "https://vault.azure.net");
        let body = req.body().unwrap();
        assert_eq!(body.content, "resource=https%3A%2F%2Fvault.azure.net");
        assert_eq!(body.content_type, "application/x-www-form-urlencoded");
    }

    #[test]
    fn test_raw_content_takes_precedence() {
        let mut req = request();
        req.body_parameter("ignored", "x");
        req.content = Some(r#"{"csr":"pem"}"#.to_string());
        let body = req.body().unwrap();
        assert_eq!(body.content, r#"{"csr":"pem"}"#);
        assert_eq!(body.content_type, "application/json");
    }

    #[test]
    fn test_into_http_request_copies_everything() {
        let mut req = request().with_kind(RequestKind::Imds);
        req.header(headers::METADATA, "true").query("resource", "r");
        req.server_certificate_thumbprint = Some("AB".into());

        let http = req.into_http_request(Some(Duration::from_secs(1)));
        assert_eq!(http.method, Method::GET);
        assert_eq!(http.uri.query(), Some("resource=r"));
        assert_eq!(http.headers, vec![("Metadata".to_string(), "true".to_string())]);
        assert_eq!(http.kind, RequestKind::Imds);
        assert_eq!(http.server_certificate_thumbprint.as_deref(), Some("AB"));
        assert_eq!(http.timeout, Some(Duration::from_secs(1)));
    }
}
