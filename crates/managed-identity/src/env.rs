//! Snapshot of the environment variables managed identity detection reads
//!
//! Detection works on an immutable [`EnvironmentVariables`] value rather than
//! on `std::env` directly, so tests can describe a hosting environment
//! without mutating the process.

use std::collections::HashMap;

use secrecy::SecretString;

/// Environment variable names
pub mod names {
    /// App Service / Service Fabric / Azure Arc identity endpoint
    pub const IDENTITY_ENDPOINT: &str = "IDENTITY_ENDPOINT";
    /// App Service / Service Fabric secret header value
    pub const IDENTITY_HEADER: &str = "IDENTITY_HEADER";
    /// Service Fabric server certificate thumbprint
    pub const IDENTITY_SERVER_THUMBPRINT: &str = "IDENTITY_SERVER_THUMBPRINT";
    /// Service Fabric federated credential endpoint
    pub const APP_IDENTITY_ENDPOINT: &str = "APP_IDENTITY_ENDPOINT";
    /// API version override for the federated Service Fabric endpoint
    pub const IDENTITY_API_VERSION: &str = "IDENTITY_API_VERSION";
    /// Cloud Shell / Machine Learning endpoint
    pub const MSI_ENDPOINT: &str = "MSI_ENDPOINT";
    /// Machine Learning secret
    pub const MSI_SECRET: &str = "MSI_SECRET";
    /// Azure Arc IMDS endpoint
    pub const IMDS_ENDPOINT: &str = "IMDS_ENDPOINT";
    /// AAD pod identity override for the IMDS base URI
    pub const POD_IDENTITY_AUTHORITY_HOST: &str = "AZURE_POD_IDENTITY_AUTHORITY_HOST";
    /// Machine Learning system-assigned client id
    pub const DEFAULT_IDENTITY_CLIENT_ID: &str = "DEFAULT_IDENTITY_CLIENT_ID";
    /// Windows `%ProgramData%`, root of the Azure Arc token directory
    pub const PROGRAM_DATA: &str = "ProgramData";
}

/// Values of every variable in [`names`], captured once
#[derive(Debug, Clone, Default)]
pub struct EnvironmentVariables {
    /// `IDENTITY_ENDPOINT`
    pub identity_endpoint: Option<String>,
    /// `IDENTITY_HEADER`
    pub identity_header: Option<SecretString>,
    /// `IDENTITY_SERVER_THUMBPRINT`
    pub identity_server_thumbprint: Option<String>,
    /// `APP_IDENTITY_ENDPOINT`
    pub app_identity_endpoint: Option<String>,
    /// `IDENTITY_API_VERSION`
    pub identity_api_version: Option<String>,
    /// `MSI_ENDPOINT`
    pub msi_endpoint: Option<String>,
    /// `MSI_SECRET`
    pub msi_secret: Option<SecretString>,
    /// `IMDS_ENDPOINT`
    pub imds_endpoint: Option<String>,
    /// `AZURE_POD_IDENTITY_AUTHORITY_HOST`
    pub pod_identity_endpoint: Option<String>,
    /// `DEFAULT_IDENTITY_CLIENT_ID`
    pub default_identity_client_id: Option<String>,
    /// `ProgramData`
    pub program_data: Option<String>,
}

impl EnvironmentVariables {
    /// Read the current process environment
    pub fn from_process() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from key/value pairs, e.g. `[("MSI_ENDPOINT", "http://localhost")]`
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_lookup(|name| map.get(name).cloned())
    }

    /// Build from an arbitrary lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let secret = |name: &str| get(name).map(SecretString::new);

        Self {
            identity_endpoint: get(names::IDENTITY_ENDPOINT),
            identity_header: secret(names::IDENTITY_HEADER),
            identity_server_thumbprint: get(names::IDENTITY_SERVER_THUMBPRINT),
            app_identity_endpoint: get(names::APP_IDENTITY_ENDPOINT),
            identity_api_version: get(names::IDENTITY_API_VERSION),
            msi_endpoint: get(names::MSI_ENDPOINT),
            msi_secret: secret(names::MSI_SECRET),
            imds_endpoint: get(names::IMDS_ENDPOINT),
            pod_identity_endpoint: get(names::POD_IDENTITY_AUTHORITY_HOST),
            default_identity_client_id: get(names::DEFAULT_IDENTITY_CLIENT_ID),
            program_data: get(names::PROGRAM_DATA),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_empty_values_are_unset() {
        let env = EnvironmentVariables::from_pairs([
            (names::MSI_ENDPOINT, ""),
            (names::IDENTITY_ENDPOINT, "http://localhost:4000"),
        ]);
        assert!(env.msi_endpoint.is_none());
        assert_eq!(env.identity_endpoint.as_deref(), Some("http://localhost:4000"));
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let env = EnvironmentVariables::from_pairs([(names::IDENTITY_HEADER, "super-secret")]);
        assert_eq!(
            env.identity_header.as_ref().map(|s| s.expose_secret().as_str()),
            Some("super-secret")
        );
        assert!(!format!("{env:?}").contains("super-secret"));
    }
}
