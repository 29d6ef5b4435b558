//! Azure Arc enabled servers
//!
//! Arc answers the first request with `401` and a `WWW-Authenticate:
//! Basic realm=<path>` challenge. The agent has just written a secret to
//! `<path>`; reading it proves the caller runs with enough privilege on the
//! machine. The second request carries the secret as `Authorization: Basic`.
//!
//! The path comes from the network, so it is only honored when it names a
//! `.key` file directly inside the agent's token directory and the file is
//! no larger than [`MAX_KEY_FILE_SIZE`]. Both checks run before any read.

use std::path::{Path, PathBuf};

use http::Method;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::client::{
    self, AcquireTokenParameters, RequestContext, handle_default_response, missing_environment, parse_endpoint,
    user_assigned_not_supported,
};
use crate::env::{EnvironmentVariables, names};
use crate::error::{ManagedIdentityError, Result, codes};
use crate::http::HttpResponse;
use crate::request::{ManagedIdentityRequest, headers};
use crate::response::ManagedIdentityResponse;
use crate::source::ManagedIdentitySource;

/// Token API version
pub const API_VERSION: &str = "2019-11-01";
/// Upper bound on the challenge key file
pub const MAX_KEY_FILE_SIZE: u64 = 4096;
/// Token directory of the Linux agent
pub const LINUX_TOKEN_DIRECTORY: &str = "/var/opt/azcmagent/tokens/";

const SOURCE: ManagedIdentitySource = ManagedIdentitySource::AzureArc;

/// Directory the agent writes challenge keys to on this platform
///
/// # Errors
///
/// Configuration error when `ProgramData` is missing on Windows, or when
/// the platform has no Arc agent.
pub fn platform_token_directory(env: &EnvironmentVariables) -> Result<PathBuf> {
    if cfg!(windows) {
        let program_data = env
            .program_data
            .as_deref()
            .ok_or_else(|| missing_environment(names::PROGRAM_DATA, SOURCE))?;
        Ok(Path::new(program_data)
            .join("AzureConnectedMachineAgent")
            .join("Tokens"))
    } else if cfg!(target_os = "linux") {
        Ok(PathBuf::from(LINUX_TOKEN_DIRECTORY))
    } else {
        let message = format!(
            "[Managed Identity] Azure Arc is not supported on {}.",
            std::env::consts::OS
        );
        error!("{message}");
        Err(ManagedIdentityError::configuration(codes::PLATFORM_NOT_SUPPORTED, message, SOURCE))
    }
}

/// Azure Arc token endpoint
#[derive(Debug, Clone)]
pub struct AzureArcSource {
    endpoint: Url,
    token_directory: Option<PathBuf>,
}

impl AzureArcSource {
    pub(crate) fn new(ctx: &RequestContext) -> Result<Self> {
        if ctx.identity().is_user_assigned() {
            return Err(user_assigned_not_supported(SOURCE));
        }

        let endpoint = ctx
            .env
            .identity_endpoint
            .as_deref()
            .ok_or_else(|| missing_environment(names::IDENTITY_ENDPOINT, SOURCE))?;
        let endpoint = parse_endpoint(endpoint, names::IDENTITY_ENDPOINT, SOURCE)?;

        info!(endpoint = %endpoint, "[Managed Identity] Creating Azure Arc managed identity source");
        Ok(Self {
            endpoint,
            token_directory: ctx.config.azure_arc_token_directory.clone(),
        })
    }

    pub(crate) fn create_request(&self, params: &AcquireTokenParameters) -> ManagedIdentityRequest {
        let mut request = ManagedIdentityRequest::new(Method::GET, self.endpoint.clone());
        request
            .header(headers::METADATA, "true")
            .query("api-version", API_VERSION)
            .query("resource", params.resource.as_str());
        request
    }

    /// Anything but 401 goes to the default handler. A 401 runs the
    /// challenge and sends the second request.
    pub(crate) async fn handle_response(
        &self,
        ctx: &RequestContext,
        response: HttpResponse,
        params: &AcquireTokenParameters,
        cancel: &CancellationToken,
    ) -> Result<ManagedIdentityResponse> {
        if response.status != 401 {
            return handle_default_response(&response, SOURCE);
        }

        let Some(challenge) = response.header("www-authenticate") else {
            let message = "[Managed Identity] Did not receive expected WWW-Authenticate header in the response from Azure Arc Managed Identity Endpoint.";
            error!("{message}");
            return Err(ManagedIdentityError::challenge(codes::NO_CHALLENGE, message, SOURCE).with_status(401));
        };

        let directory = match &self.token_directory {
            Some(dir) => dir.clone(),
            None => platform_token_directory(&ctx.env)?,
        };
        let key_path = validate_challenge(challenge, &directory)?;
        let secret = read_key_file(&key_path)?;

        info!("[Managed Identity] Adding authorization header to the Azure Arc request");
        let mut request = self.create_request(params);
        request.header(
            headers::AUTHORIZATION,
            format!("Basic {}", secret.expose_secret()),
        );

        let response = client::send(ctx, request, SOURCE, cancel).await?;
        handle_default_response(&response, SOURCE)
    }
}

/// Extract the key file path from a `key=path` challenge and check that it
/// is `<directory>/<stem>.key`.
///
/// # Errors
///
/// [`codes::INVALID_CHALLENGE`] if the header does not split into exactly
/// two parts on `=`, [`codes::INVALID_FILE_PATH`] if the path is anywhere
/// else.
pub fn validate_challenge(challenge: &str, directory: &Path) -> Result<PathBuf> {
    let parts: Vec<&str> = challenge.split('=').collect();
    let [_, path] = parts.as_slice() else {
        let message = "[Managed Identity] The WWW-Authenticate header for Azure Arc managed identity is not an expected format.";
        error!(parts = parts.len(), "{message}");
        return Err(ManagedIdentityError::challenge(codes::INVALID_CHALLENGE, message, SOURCE).with_status(401));
    };

    let path = Path::new(path.trim());
    let invalid_path = || {
        let message = format!(
            "[Managed Identity] The file on the file path in the WWW-Authenticate header is not secure. File path: {}",
            path.display()
        );
        error!("{message}");
        ManagedIdentityError::challenge(codes::INVALID_FILE_PATH, message, SOURCE).with_status(401)
    };

    let stem = path.file_stem().ok_or_else(invalid_path)?;
    let mut file_name = stem.to_os_string();
    file_name.push(".key");
    let expected = directory.join(file_name);

    if !same_path(&expected, path) {
        warn!(
            expected = %expected.display(),
            "[Managed Identity] Challenge path is outside the Azure Arc token directory"
        );
        return Err(invalid_path());
    }
    Ok(expected)
}

fn same_path(expected: &Path, actual: &Path) -> bool {
    if cfg!(windows) {
        expected
            .to_string_lossy()
            .eq_ignore_ascii_case(&actual.to_string_lossy())
    } else {
        expected == actual
    }
}

/// Read the challenge secret after checking existence and size.
///
/// # Errors
///
/// [`codes::INVALID_FILE_PATH`] when the file is missing or unreadable,
/// [`codes::FILE_TOO_LARGE`] above [`MAX_KEY_FILE_SIZE`] bytes.
pub fn read_key_file(path: &Path) -> Result<SecretString> {
    let unreadable = |err: std::io::Error| {
        let message = format!(
            "[Managed Identity] Unable to read the Azure Arc key file {}: {err}",
            path.display()
        );
        error!("{message}");
        ManagedIdentityError::challenge(codes::INVALID_FILE_PATH, message, SOURCE).with_inner(err)
    };

    let metadata = std::fs::metadata(path).map_err(unreadable)?;
    if !metadata.is_file() {
        return Err(unreadable(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    if metadata.len() > MAX_KEY_FILE_SIZE {
        let message = format!(
            "[Managed Identity] The file {} is {} bytes, larger than the {MAX_KEY_FILE_SIZE} byte limit.",
            path.display(),
            metadata.len()
        );
        error!("{message}");
        return Err(ManagedIdentityError::challenge(codes::FILE_TOO_LARGE, message, SOURCE));
    }

    std::fs::read_to_string(path)
        .map(SecretString::new)
        .map_err(unreadable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagedIdentityConfig, ManagedIdentityId};
    use crate::error::ErrorKind;
    use crate::sources::tests::context;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_has_no_qualifier() {
        let ctx = context(
            ManagedIdentityConfig::default(),
            &[
                (names::IDENTITY_ENDPOINT, "http://localhost:40342/metadata/identity/oauth2/token"),
                (names::IMDS_ENDPOINT, "http://localhost:40342"),
            ],
        );
        let request = AzureArcSource::new(&ctx).unwrap().create_request(&AcquireTokenParameters::new("r"));
        let keys: Vec<&str> = request.query_parameters.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["api-version", "resource"]);
        assert_eq!(request.headers.get("Metadata").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_user_assigned_rejected() {
        let ctx = context(
            ManagedIdentityConfig::new(ManagedIdentityId::ObjectId("oid".into())),
            &[(names::IDENTITY_ENDPOINT, "http://localhost:40342/metadata/identity/oauth2/token")],
        );
        let err = AzureArcSource::new(&ctx).unwrap_err();
        assert_eq!(err.error_code(), codes::USER_ASSIGNED_NOT_SUPPORTED);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_directory() {
        assert_eq!(
            platform_token_directory(&EnvironmentVariables::default()).unwrap(),
            PathBuf::from("/var/opt/azcmagent/tokens/")
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_challenge_inside_directory() {
        let dir = Path::new(LINUX_TOKEN_DIRECTORY);
        let path = validate_challenge("Basic realm=/var/opt/azcmagent/tokens/abc.key", dir).unwrap();
        assert_eq!(path, PathBuf::from("/var/opt/azcmagent/tokens/abc.key"));
    }

    #[test]
    fn test_challenge_rejections() {
        let dir = Path::new("/var/opt/azcmagent/tokens");

        let err = validate_challenge("Basic realm", dir).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Challenge);
        assert_eq!(err.error_code(), codes::INVALID_CHALLENGE);

        let err = validate_challenge("Basic realm=/a=b", dir).unwrap_err();
        assert_eq!(err.error_code(), codes::INVALID_CHALLENGE);

        for path in [
            "/etc/passwd",
            "/var/opt/azcmagent/tokens/abc.txt",
            "/var/opt/azcmagent/tokens/../../../etc/shadow.key",
            "/var/opt/azcmagent/tokens/nested/abc.key",
            "/tmp/abc.key",
        ] {
            let err = validate_challenge(&format!("Basic realm={path}"), dir).unwrap_err();
            assert_eq!(err.error_code(), codes::INVALID_FILE_PATH, "path: {path}");
            assert_eq!(err.kind(), ErrorKind::Challenge);
        }
    }

    #[test]
    fn test_key_file_size_boundary() {
        let dir = tempfile::tempdir().unwrap();

        let at_limit = dir.path().join("limit.key");
        std::fs::write(&at_limit, "a".repeat(4096)).unwrap();
        assert_eq!(read_key_file(&at_limit).unwrap().expose_secret().len(), 4096);

        let over = dir.path().join("over.key");
        std::fs::write(&over, "a".repeat(4097)).unwrap();
        let err = read_key_file(&over).unwrap_err();
        assert_eq!(err.error_code(), codes::FILE_TOO_LARGE);
        assert_eq!(err.kind(), ErrorKind::Challenge);

        let err = read_key_file(&dir.path().join("missing.key")).unwrap_err();
        assert_eq!(err.error_code(), codes::INVALID_FILE_PATH);
    }
}
