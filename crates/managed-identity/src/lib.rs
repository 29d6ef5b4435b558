//! # Managed Identity
//!
//! Token acquisition for Azure managed identities: detect which hosting
//! environment the process runs in, speak that environment's token
//! protocol, and normalize every failure into one error type.
//!
//! ## Architecture
//!
//! - `detect` - environment-driven source detection, memoized per process
//! - `manager` - [`ManagedIdentityManager`], the entry point
//! - `client` - the shared request/response lifecycle
//! - `sources` - one client per protocol: IMDS, App Service, Machine
//!   Learning, Cloud Shell, Azure Arc (challenge flow), Service Fabric and
//!   the certificate-bound credential flow (IMDSv2)
//! - `http` - the [`HttpManager`] seam and its reqwest implementation
//! - `tls` - certificate thumbprints and pinned server verification
//! - `probe`, `binding`, `state` - process-wide caches
//! - `error` - [`ManagedIdentityError`] with stable codes
//!
//! ## Example
//!
//! ```no_run
//! use managed_identity::{AcquireTokenParameters, ManagedIdentityConfig, ManagedIdentityManager};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> managed_identity::Result<()> {
//! let manager = ManagedIdentityManager::new(ManagedIdentityConfig::default())?;
//! let params = AcquireTokenParameters::new("https://management.azure.com");
//! let token = manager.acquire_token(&params, &CancellationToken::new()).await?;
//! println!("expires on {}", token.expires_on);
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

pub mod binding;
pub mod client;
pub mod config;
pub mod detect;
pub mod env;
pub mod error;
pub mod http;
pub mod manager;
pub mod probe;
pub mod request;
pub mod response;
pub mod source;
pub mod sources;
pub mod state;
pub mod tls;

pub use binding::{BindingCache, CertificateBinding, TokenType};
pub use client::{AcquireTokenParameters, RequestContext, get_successful_response, message_from_error_response};
pub use config::{ManagedIdentityConfig, ManagedIdentityId, ManagedIdentityIdType, RequestKind, RetryPolicy};
pub use detect::{SourceDetector, detect};
pub use env::EnvironmentVariables;
pub use error::{ErrorKind, ManagedIdentityError, Result, codes, messages};
pub use self::http::{ClientIdentity, HttpBody, HttpManager, HttpRequest, HttpResponse, ReqwestHttpManager, TransportError};
pub use manager::ManagedIdentityManager;
pub use probe::Availability;
pub use request::ManagedIdentityRequest;
pub use response::ManagedIdentityResponse;
pub use source::ManagedIdentitySource;
pub use sources::SourceClient;
pub use state::SharedState;
