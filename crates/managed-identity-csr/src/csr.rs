//! PKCS#10 certificate signing request
//!
//! Layout produced by [`Csr::generate_with_key`]:
//!
//! ```text
//! CertificationRequest ::= SEQUENCE {
//!     certificationRequestInfo  SEQUENCE {
//!         version        INTEGER 0,
//!         subject        Name (CN=<client id>, DC=<tenant id>),
//!         subjectPKInfo  SEQUENCE { AlgorithmIdentifier(rsaEncryption, NULL), BIT STRING(RSAPublicKey) },
//!         attributes     [0] { SEQUENCE { OID 1.2.840.113549.1.9.7, SET { PrintableString(<cuid json>) } } }
//!     },
//!     signatureAlgorithm  AlgorithmIdentifier(sha256WithRSAEncryption, NULL),
//!     signature           BIT STRING
//! }
//! ```

use pem::{EncodeConfig, LineEnding, Pem};
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::der;
use crate::error::CsrError;

/// RSA modulus size used for every generated key
pub const KEY_BITS: usize = 2048;

/// PEM header line
pub const PEM_HEADER: &str = "-----BEGIN CERTIFICATE REQUEST-----";
/// PEM footer line
pub const PEM_FOOTER: &str = "-----END CERTIFICATE REQUEST-----";

const PEM_TAG: &str = "CERTIFICATE REQUEST";

/// Object identifiers used by the request
pub mod oid {
    /// id-at-commonName
    pub const COMMON_NAME: &[u64] = &[2, 5, 4, 3];
    /// domainComponent (RFC 4519)
    pub const DOMAIN_COMPONENT: &[u64] = &[0, 9, 2342, 19200300, 100, 1, 25];
    /// rsaEncryption
    pub const RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
    /// sha256WithRSAEncryption
    pub const SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
    /// PKCS#9 challengePassword, which carries the compute unit identifier
    pub const CUID_ATTRIBUTE: &[u64] = &[1, 2, 840, 113549, 1, 9, 7];
}

/// Compute unit identity of the VM or scale set requesting a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuidInfo {
    /// Virtual machine id
    #[serde(rename = "vmId")]
    pub vm_id: String,

    /// Scale set id, when the VM belongs to one
    #[serde(rename = "vmssId", default, skip_serializing_if = "Option::is_none")]
    pub vmss_id: Option<String>,
}

impl CuidInfo {
    /// Create a CUID for a standalone VM
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            vmss_id: None,
        }
    }

    /// Attach a scale set id
    pub fn with_vmss_id(mut self, vmss_id: impl Into<String>) -> Self {
        self.vmss_id = Some(vmss_id.into());
        self
    }
}

/// A PEM-encoded PKCS#10 certificate signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csr {
    pem: String,
}

impl Csr {
    /// Generate a CSR with a fresh RSA-2048 key.
    ///
    /// The private key exists only for the duration of this call; use
    /// [`Csr::generate_with_key`] when the key must outlive the request
    /// (for example to present the issued certificate over mTLS).
    ///
    /// # Errors
    ///
    /// Fails on empty inputs, key generation failure or signing failure.
    pub fn generate(client_id: &str, tenant_id: &str, cuid: &CuidInfo) -> Result<Self, CsrError> {
        let key = generate_key()?;
        Self::generate_with_key(&key, client_id, tenant_id, cuid)
    }

    /// Generate a CSR signed by `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CsrError::MissingField`] when `client_id`, `tenant_id` or
    /// the CUID's `vm_id` is empty, and [`CsrError::Signing`] if the RSA
    /// signature cannot be produced.
    pub fn generate_with_key(
        key: &RsaPrivateKey,
        client_id: &str,
        tenant_id: &str,
        cuid: &CuidInfo,
    ) -> Result<Self, CsrError> {
        if client_id.is_empty() {
            return Err(CsrError::MissingField("client_id"));
        }
        if tenant_id.is_empty() {
            return Err(CsrError::MissingField("tenant_id"));
        }
        if cuid.vm_id.is_empty() {
            return Err(CsrError::MissingField("cuid.vmId"));
        }

        let info = certification_request_info(key, client_id, tenant_id, cuid)?;

        let signing_key = SigningKey::<Sha256>::new(key.clone());
        let signature = signing_key
            .try_sign(&info)
            .map_err(|e| CsrError::Signing(e.to_string()))?
            .to_vec();

        let algorithm = der::sequence(&[&der::object_identifier(oid::SHA256_WITH_RSA)?, &der::null()]);
        let request = der::sequence(&[&info, &algorithm, &der::bit_string(&signature)]);

        debug!(
            der_len = request.len(),
            "[Managed Identity] Generated certificate signing request"
        );

        Ok(Self { pem: to_pem(&request) })
    }

    /// The PEM text, header and footer included
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Consume the CSR and return its PEM text
    pub fn into_pem(self) -> String {
        self.pem
    }

    /// Decode the PEM body back into DER.
    ///
    /// # Errors
    ///
    /// Fails only if the PEM text is malformed, which cannot happen for a
    /// CSR produced by this crate.
    pub fn to_der(&self) -> Result<Vec<u8>, pem::PemError> {
        pem::parse(&self.pem).map(Pem::into_contents)
    }
}

impl std::fmt::Display for Csr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pem)
    }
}

/// Generate an RSA key of [`KEY_BITS`] bits from the OS RNG.
///
/// # Errors
///
/// Returns [`CsrError::KeyGeneration`] if the key cannot be generated.
pub fn generate_key() -> Result<RsaPrivateKey, CsrError> {
    RsaPrivateKey::new(&mut OsRng, KEY_BITS).map_err(CsrError::KeyGeneration)
}

fn certification_request_info(
    key: &RsaPrivateKey,
    client_id: &str,
    tenant_id: &str,
    cuid: &CuidInfo,
) -> Result<Vec<u8>, CsrError> {
    let version = der::integer(&[0]);

    let common_name = der::set(&[&der::sequence(&[
        &der::object_identifier(oid::COMMON_NAME)?,
        &der::utf8_string(client_id),
    ])]);
    let domain_component = der::set(&[&der::sequence(&[
        &der::object_identifier(oid::DOMAIN_COMPONENT)?,
        &der::utf8_string(tenant_id),
    ])]);
    let subject = der::sequence(&[&common_name, &domain_component]);

    let public_key = key.to_public_key();
    let rsa_public_key = der::sequence(&[
        &der::integer(&public_key.n().to_bytes_be()),
        &der::integer(&public_key.e().to_bytes_be()),
    ]);
    let spki = der::sequence(&[
        &der::sequence(&[&der::object_identifier(oid::RSA_ENCRYPTION)?, &der::null()]),
        &der::bit_string(&rsa_public_key),
    ]);

    let cuid_json = serde_json::to_string(cuid)?;
    let cuid_attribute = der::sequence(&[
        &der::object_identifier(oid::CUID_ATTRIBUTE)?,
        &der::set(&[&der::printable_string(&cuid_json)]),
    ]);
    let attributes = der::context_specific_constructed(&[&cuid_attribute]);

    Ok(der::sequence(&[&version, &subject, &spki, &attributes]))
}

fn to_pem(der_bytes: &[u8]) -> String {
    pem::encode_config(
        &Pem::new(PEM_TAG, der_bytes),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}
