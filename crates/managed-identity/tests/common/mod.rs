//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use managed_identity::{
    EnvironmentVariables, HttpManager, HttpRequest, HttpResponse, ManagedIdentityConfig,
    ManagedIdentityManager, ReqwestHttpManager, RetryPolicy, SharedState, TransportError,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub const RESOURCE: &str = "https://management.azure.com";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("managed_identity=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration that never retries and gives up quickly
pub fn test_config() -> ManagedIdentityConfig {
    ManagedIdentityConfig::default()
        .with_retry_policy(RetryPolicy::never())
        .with_request_timeout(Duration::from_secs(5))
        .with_probe_timeout(Duration::from_millis(500))
}

/// Manager over a real reqwest client with an isolated shared state
pub fn reqwest_manager(config: ManagedIdentityConfig, env: &[(&str, &str)]) -> ManagedIdentityManager {
    init_tracing();
    let http = ReqwestHttpManager::new(config.request_timeout, config.retry_policy.clone()).unwrap();
    ManagedIdentityManager::with_parts(
        config,
        Arc::new(http),
        EnvironmentVariables::from_pairs(env.iter().copied()),
        SharedState::new(),
    )
    .unwrap()
}

/// Manager over a scripted transport
pub fn scripted_manager(
    config: ManagedIdentityConfig,
    env: &[(&str, &str)],
    http: Arc<ScriptedHttp>,
) -> ManagedIdentityManager {
    init_tracing();
    ManagedIdentityManager::with_parts(
        config,
        http,
        EnvironmentVariables::from_pairs(env.iter().copied()),
        SharedState::new(),
    )
    .unwrap()
}

pub type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Transport that answers from a queue of responders and records every
/// request it sees. An empty queue answers 404.
#[derive(Default)]
pub struct ScriptedHttp {
    responders: Mutex<VecDeque<Responder>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl std::fmt::Debug for ScriptedHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedHttp")
            .field("pending", &self.responders.lock().len())
            .field("requests", &self.requests.lock().len())
            .finish()
    }
}

impl ScriptedHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push<F>(&self, responder: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        self.responders.lock().push_back(Box::new(responder));
    }

    pub fn push_response(&self, response: HttpResponse) {
        self.push(move |_| Ok(response.clone()));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpManager for ScriptedHttp {
    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.requests.lock().push(request.clone());
        let responder = self.responders.lock().pop_front();
        match responder {
            Some(respond) => respond(&request),
            None => Ok(HttpResponse::new(404, "")),
        }
    }
}

pub fn query(request: &HttpRequest, key: &str) -> Option<String> {
    request
        .uri
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

pub fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn form(request: &HttpRequest, key: &str) -> Option<String> {
    let body = request.body.as_ref()?;
    url::form_urlencoded::parse(body.content.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
