//! # Managed Identity CSR
//!
//! Byte-exact DER encoder for the PKCS#10 certificate signing requests that
//! certificate-bound managed identities exchange for a short-lived client
//! certificate.
//!
//! ## Architecture
//!
//! - `der` - ASN.1 DER primitives (SEQUENCE, SET, INTEGER, BIT STRING, strings, OID)
//! - `csr` - CertificationRequestInfo layout, SHA-256/RSA signing, PEM wrapping
//! - `error` - [`CsrError`]
//!
//! ## Example
//!
//! ```no_run
//! use managed_identity_csr::{Csr, CuidInfo};
//!
//! # fn main() -> Result<(), managed_identity_csr::CsrError> {
//! let csr = Csr::generate("client-id", "tenant-id", &CuidInfo::new("vm-id"))?;
//! assert!(csr.pem().starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod csr;
pub mod der;
pub mod error;

pub use csr::{Csr, CuidInfo, KEY_BITS, PEM_FOOTER, PEM_HEADER, generate_key};
pub use error::CsrError;

/// Re-exported so callers can hold on to the key behind a generated CSR
pub use rsa::RsaPrivateKey;
