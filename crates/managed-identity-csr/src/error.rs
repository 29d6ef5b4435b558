//! Error types for CSR generation

use thiserror::Error;

/// Errors raised while building a certificate signing request
#[derive(Debug, Error)]
pub enum CsrError {
    /// A required input was empty
    #[error("CSR input '{0}' must not be empty")]
    MissingField(&'static str),

    /// RSA key generation failed
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(#[source] rsa::Error),

    /// Signing the CertificationRequestInfo failed
    #[error("CSR signing failed: {0}")]
    Signing(String),

    /// The CUID could not be serialized to JSON
    #[error("CUID serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An object identifier could not be encoded
    #[error("invalid object identifier: {0}")]
    InvalidObjectIdentifier(String),
}
