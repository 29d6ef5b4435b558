//! Managed identity source variants

use serde::{Deserialize, Serialize};

/// The hosting environment a token is obtained from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagedIdentitySource {
    /// No source, used before detection and for errors raised outside any source
    None,
    /// Azure Instance Metadata Service
    Imds,
    /// App Service and Azure Functions
    AppService,
    /// Azure Arc enabled servers
    AzureArc,
    /// Azure Cloud Shell
    CloudShell,
    /// Service Fabric
    ServiceFabric,
    /// Service Fabric federated managed identity credential
    ServiceFabricFederated,
    /// Azure Machine Learning compute
    MachineLearning,
    /// Certificate-bound credential flow on IMDS
    Credential,
    /// IMDS reported the credential endpoint as available
    ImdsV2,
    /// No environment matched and IMDS has not been confirmed by a probe
    DefaultToImds,
}

impl ManagedIdentitySource {
    /// IMDS in any of its unconfirmed or v1 forms
    pub fn is_imds(self) -> bool {
        matches!(self, Self::Imds | Self::DefaultToImds)
    }

    /// Certificate-bound flow
    pub fn is_credential(self) -> bool {
        matches!(self, Self::Credential | Self::ImdsV2)
    }

    /// Name used in log lines and error messages
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Imds => "IMDS",
            Self::AppService => "AppService",
            Self::AzureArc => "AzureArc",
            Self::CloudShell => "CloudShell",
            Self::ServiceFabric => "ServiceFabric",
            Self::ServiceFabricFederated => "ServiceFabricFederated",
            Self::MachineLearning => "MachineLearning",
            Self::Credential => "Credential",
            Self::ImdsV2 => "ImdsV2",
            Self::DefaultToImds => "DefaultToImds",
        }
    }
}

impl std::fmt::Display for ManagedIdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
