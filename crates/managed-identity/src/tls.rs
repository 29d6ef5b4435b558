//! Server certificate validation for Service Fabric
//!
//! Service Fabric clusters commonly present self-signed or cluster-internal
//! certificates. The verifier accepts either a chain that validates against
//! the platform roots or an end-entity certificate whose SHA-1 thumbprint
//! equals `IDENTITY_SERVER_THUMBPRINT`.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::http::TransportError;

/// Uppercase hex SHA-1 of a DER certificate, the Windows "thumbprint" format
pub fn certificate_thumbprint(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

/// Chain validation with a thumbprint pin as fallback
#[derive(Debug)]
pub struct ThumbprintServerVerifier {
    chain: Option<Arc<WebPkiServerVerifier>>,
    thumbprint: String,
    provider: Arc<CryptoProvider>,
}

impl ThumbprintServerVerifier {
    /// Build a verifier pinned to `thumbprint`, using the native root store
    /// for chain validation.
    pub fn new(thumbprint: &str) -> Self {
        let provider = Arc::new(ring::default_provider());

        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            debug!(error = %err, "[Managed Identity] Skipping unreadable native root certificate");
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!(added, ignored, "[Managed Identity] Loaded native root certificates");

        // An empty store cannot build a webpki verifier; the pin alone then decides
        let chain = if roots.is_empty() {
            None
        } else {
            match WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone()).build() {
                Ok(verifier) => Some(verifier),
                Err(err) => {
                    warn!(error = %err, "[Managed Identity] Chain validation unavailable, relying on thumbprint only");
                    None
                }
            }
        };

        Self::with_chain(chain, thumbprint, provider)
    }

    fn with_chain(
        chain: Option<Arc<WebPkiServerVerifier>>,
        thumbprint: &str,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            chain,
            thumbprint: thumbprint.trim().to_string(),
            provider,
        }
    }

    fn thumbprint_matches(&self, end_entity: &CertificateDer<'_>) -> bool {
        certificate_thumbprint(end_entity.as_ref()).eq_ignore_ascii_case(&self.thumbprint)
    }
}

impl ServerCertVerifier for ThumbprintServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain_result = match &self.chain {
            Some(chain) => chain.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now),
            None => Err(rustls::Error::General("no trusted roots available".into())),
        };

        match chain_result {
            Ok(verified) => Ok(verified),
            Err(_) if self.thumbprint_matches(end_entity) => {
                debug!("[Managed Identity] Server certificate accepted by thumbprint");
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => {
                warn!(error = %err, "[Managed Identity] Server certificate failed chain validation and thumbprint check");
                Err(err)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// rustls client configuration that trusts the chain or the pinned thumbprint
///
/// # Errors
///
/// Returns [`TransportError::Tls`] if the protocol versions cannot be configured.
pub fn pinned_client_config(thumbprint: &str) -> Result<rustls::ClientConfig, TransportError> {
    let verifier = ThumbprintServerVerifier::new(thumbprint);
    let provider = verifier.provider.clone();

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}
