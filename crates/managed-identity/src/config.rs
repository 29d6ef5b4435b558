//! Configuration
//!
//! [`ManagedIdentityConfig`] is read-only once a manager is built. It can
//! be assembled with the `with_*` methods or deserialized from any serde
//! format; every field has a default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ManagedIdentityError, Result, codes};
use crate::source::ManagedIdentitySource;

/// Which identity on the host to authenticate as.
///
/// The three user-assigned qualifiers are variants of one enum, so at most
/// one of them can ever reach a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ManagedIdentityId {
    /// The identity assigned to the host itself
    #[default]
    SystemAssigned,
    /// User-assigned identity by client (application) id
    ClientId(String),
    /// User-assigned identity by ARM resource id
    ResourceId(String),
    /// User-assigned identity by object (principal) id
    ObjectId(String),
}

/// Discriminant of [`ManagedIdentityId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedIdentityIdType {
    /// System-assigned
    SystemAssigned,
    /// Client id
    ClientId,
    /// Resource id
    ResourceId,
    /// Object id
    ObjectId,
}

impl ManagedIdentityId {
    /// Discriminant
    pub fn id_type(&self) -> ManagedIdentityIdType {
        match self {
            Self::SystemAssigned => ManagedIdentityIdType::SystemAssigned,
            Self::ClientId(_) => ManagedIdentityIdType::ClientId,
            Self::ResourceId(_) => ManagedIdentityIdType::ResourceId,
            Self::ObjectId(_) => ManagedIdentityIdType::ObjectId,
        }
    }

    /// The user-assigned id, `None` for system-assigned
    pub fn user_assigned_id(&self) -> Option<&str> {
        match self {
            Self::SystemAssigned => None,
            Self::ClientId(id) | Self::ResourceId(id) | Self::ObjectId(id) => Some(id),
        }
    }

    /// True for any user-assigned variant
    pub fn is_user_assigned(&self) -> bool {
        !matches!(self, Self::SystemAssigned)
    }

    /// Key used for per-identity process caches
    pub(crate) fn cache_key(&self) -> String {
        match self {
            Self::SystemAssigned => "system_assigned".to_string(),
            Self::ClientId(id) => format!("client_id:{id}"),
            Self::ResourceId(id) => format!("resource_id:{id}"),
            Self::ObjectId(id) => format!("object_id:{id}"),
        }
    }
}

/// Request classes the HTTP collaborator applies different retry rules to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// IMDS token and credential requests
    Imds,
    /// IMDSv2 platform metadata probe, never retried
    CsrMetadataProbe,
    /// Regional token endpoint behind mTLS
    Sts,
    /// Every other managed identity endpoint
    Default,
}

/// Exponential backoff retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Retry budget for a request class
    pub fn max_retries_for(&self, kind: RequestKind) -> u32 {
        match kind {
            RequestKind::CsrMetadataProbe => 0,
            _ => self.max_retries,
        }
    }

    /// Whether `status` is worth another attempt for `kind`
    pub fn should_retry(&self, kind: RequestKind, status: u16) -> bool {
        match kind {
            RequestKind::CsrMetadataProbe => false,
            RequestKind::Imds => matches!(status, 404 | 408 | 410 | 429) || (500..600).contains(&status),
            RequestKind::Sts | RequestKind::Default => status == 429 || (500..600).contains(&status),
        }
    }

    /// Delay before retry number `attempt` (zero based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Managed identity configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedIdentityConfig {
    /// Identity to authenticate as
    pub managed_identity_id: ManagedIdentityId,

    /// Client capabilities advertised as `xms_cc` when claims are sent
    pub client_capabilities: Vec<String>,

    /// Retry rules applied by the HTTP collaborator
    pub retry_policy: RetryPolicy,

    /// Per-request timeout for token requests
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Timeout of the IMDSv2 availability probe
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,

    /// Probe the IMDS credential endpoint and prefer the certificate-bound
    /// flow when the host supports it
    pub enable_imds_v2: bool,

    /// Directory the Azure Arc agent writes challenge keys to.
    /// Defaults to the platform location.
    pub azure_arc_token_directory: Option<PathBuf>,
}

impl Default for ManagedIdentityConfig {
    fn default() -> Self {
        Self {
            managed_identity_id: ManagedIdentityId::SystemAssigned,
            client_capabilities: Vec::new(),
            retry_policy: RetryPolicy::default(),
            request_timeout: Duration::from_secs(100),
            probe_timeout: Duration::from_secs(1),
            enable_imds_v2: false,
            azure_arc_token_directory: None,
        }
    }
}

impl ManagedIdentityConfig {
    /// Configuration for `id` with every other field defaulted
    pub fn new(managed_identity_id: ManagedIdentityId) -> Self {
        Self {
            managed_identity_id,
            ..Self::default()
        }
    }

    /// Set the client capabilities
    pub fn with_client_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the IMDSv2 probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Enable IMDSv2 probing
    pub fn with_imds_v2(mut self, enabled: bool) -> Self {
        self.enable_imds_v2 = enabled;
        self
    }

    /// Override the Azure Arc token directory
    pub fn with_azure_arc_token_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.azure_arc_token_directory = Some(dir.into());
        self
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a user-assigned id or a client
    /// capability is empty.
    pub fn validate(&self) -> Result<()> {
        if self.managed_identity_id.user_assigned_id().is_some_and(str::is_empty) {
            return Err(ManagedIdentityError::configuration(
                codes::INVALID_REQUEST,
                "[Managed Identity] A user-assigned managed identity id must not be empty.",
                ManagedIdentitySource::None,
            ));
        }
        if self.client_capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(ManagedIdentityError::configuration(
                codes::INVALID_REQUEST,
                "[Managed Identity] Client capabilities must not contain empty values.",
                ManagedIdentitySource::None,
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
