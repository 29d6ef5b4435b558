//! Certificate binding cache for the IMDSv2 credential flow
//!
//! One entry per managed identity. Bearer and mTLS PoP tokens each keep
//! their own certificate so a rotation in one never changes the key the
//! other is bound to. The subject is recorded once and kept. Minting for
//! one identity and token type is serialized through an async gate so
//! concurrent cold requests issue a single certificate.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

use crate::http::ClientIdentity;
use crate::sources::credential::CertificateRequestResponse;

/// Bindings within this many seconds of `notAfter` are re-minted
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Token type requested from the regional token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    /// Plain bearer token
    Bearer,
    /// mTLS proof-of-possession token bound to the certificate
    MtlsPop,
}

impl TokenType {
    /// Value of the `token_type` form field
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::MtlsPop => "mtls_pop",
        }
    }
}

/// An issued certificate together with the key it was requested for
#[derive(Debug, Clone)]
pub struct CertificateBinding {
    /// IMDS certificate response
    pub response: CertificateRequestResponse,
    /// Uppercase SHA-1 of the certificate DER
    pub thumbprint: String,
    /// Certificate and private key for the mTLS handshake
    pub identity: ClientIdentity,
    /// Certificate `notAfter`, unix seconds
    pub not_after: i64,
}

impl CertificateBinding {
    /// Usable for at least [`REFRESH_MARGIN_SECS`] more seconds after `now`
    pub fn is_fresh(&self, now: i64) -> bool {
        self.not_after - now > REFRESH_MARGIN_SECS
    }
}

/// Per-identity binding state
#[derive(Debug, Clone, Default)]
pub struct ImdsV2BindingMetadata {
    /// Subject of the first certificate issued for this identity
    pub subject: Option<String>,
    /// Binding used for bearer tokens
    pub bearer: Option<CertificateBinding>,
    /// Binding used for PoP tokens
    pub pop: Option<CertificateBinding>,
}

impl ImdsV2BindingMetadata {
    fn slot(&self, token_type: TokenType) -> &Option<CertificateBinding> {
        match token_type {
            TokenType::Bearer => &self.bearer,
            TokenType::MtlsPop => &self.pop,
        }
    }

    fn slot_mut(&mut self, token_type: TokenType) -> &mut Option<CertificateBinding> {
        match token_type {
            TokenType::Bearer => &mut self.bearer,
            TokenType::MtlsPop => &mut self.pop,
        }
    }
}

/// Process-wide binding cache keyed by identity
#[derive(Debug, Default)]
pub struct BindingCache {
    entries: RwLock<HashMap<String, ImdsV2BindingMetadata>>,
    gates: DashMap<(String, TokenType), Arc<Mutex<()>>>,
}

impl BindingCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `binding` for `identity_key` and `token_type`. The subject is
    /// only taken if none is recorded yet.
    pub fn record(&self, identity_key: &str, token_type: TokenType, subject: &str, binding: CertificateBinding) {
        let mut entries = self.entries.write();
        let meta = entries.entry(identity_key.to_string()).or_default();
        if meta.subject.is_none() && !subject.is_empty() {
            meta.subject = Some(subject.to_string());
        }
        debug!(
            identity = identity_key,
            token_type = token_type.as_str(),
            thumbprint = %binding.thumbprint,
            "[Managed Identity] Recorded certificate binding"
        );
        *meta.slot_mut(token_type) = Some(binding);
    }

    /// Current binding for `identity_key` and `token_type`, fresh or not
    pub fn get(&self, identity_key: &str, token_type: TokenType) -> Option<CertificateBinding> {
        self.entries
            .read()
            .get(identity_key)
            .and_then(|meta| meta.slot(token_type).clone())
    }

    /// Fresh binding for `identity_key` and `token_type` at `now`
    pub fn get_fresh(&self, identity_key: &str, token_type: TokenType, now: i64) -> Option<CertificateBinding> {
        self.get(identity_key, token_type).filter(|binding| binding.is_fresh(now))
    }

    /// Gate held while minting a binding for `identity_key` and `token_type`
    pub fn mint_gate(&self, identity_key: &str, token_type: TokenType) -> Arc<Mutex<()>> {
        self.gates
            .entry((identity_key.to_string(), token_type))
            .or_default()
            .clone()
    }

    /// Recorded subject for `identity_key`
    pub fn subject(&self, identity_key: &str) -> Option<String> {
        self.entries
            .read()
            .get(identity_key)
            .and_then(|meta| meta.subject.clone())
    }

    /// Any identity's PoP binding, with the identity key it belongs to
    pub fn any_pop_binding(&self) -> Option<(String, CertificateBinding)> {
        self.entries
            .read()
            .iter()
            .find_map(|(key, meta)| meta.pop.clone().map(|binding| (key.clone(), binding)))
    }
}
