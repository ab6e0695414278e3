//! Protocol adapters for third-party OAuth2/OIDC providers.
//!
//! Providers diverge from the OAuth2 standard in provider-specific ways; each
//! adapter isolates those quirks behind the one [`Provider`] contract so the
//! flow engine only ever sees [`Claims`]. Adapters share no base
//! implementation: they compose over the same trait shape and nothing else.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

use crate::error::UpstreamError;

pub mod generic;
pub mod wechat;

pub use generic::GenericOidcProvider;
pub use wechat::WeChatProvider;

const HTTP_TIMEOUT_SECONDS: u64 = 10;

/// Static configuration shared by every adapter.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Registry key, e.g. `wechat`.
    pub id: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Vec<String>,
    pub redirect_uri: String,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(id: impl Into<String>, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: Vec::new(),
            redirect_uri: String::new(),
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }
}

/// Result of a code exchange. `extra` carries provider-specific fields the
/// adapter needs again at claims time (e.g. platform-scoped user ids returned
/// only by the token endpoint); the engine never reads it.
#[derive(Clone, Debug)]
pub struct ProviderToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub extra: Map<String, Value>,
}

impl ProviderToken {
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str).filter(|v| !v.is_empty())
    }
}

/// Normalized identity attributes from an external provider.
///
/// `subject` is the provider-scoped linkage key, chosen by each adapter's
/// documented precedence rules. `raw_claims` is preserved uninterpreted for
/// downstream trait mapping.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Claims {
    pub issuer: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub raw_claims: Map<String, Value>,
}

/// Uniform adapter contract. All network calls are bounded by a timeout; on
/// any failure the surrounding flow keeps its prior state.
#[async_trait]
pub trait Provider: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    /// Build the authorization redirect for this provider.
    fn auth_request(&self, state: &str) -> Result<Url, UpstreamError>;

    /// Exchange the callback code for a token.
    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, UpstreamError>;

    /// Fetch and normalize the user's claims.
    async fn claims(&self, token: &ProviderToken) -> Result<Claims, UpstreamError>;
}

/// Shared HTTP client: bounded timeout, crate user agent.
pub(crate) fn http_client() -> Result<reqwest::Client, UpstreamError> {
    reqwest::Client::builder()
        .user_agent(crate::APP_USER_AGENT)
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
        .build()
        .map_err(|err| UpstreamError::fatal("failed to build http client").with_source(err))
}

/// Map a transport failure onto the retryable/fatal split: timeouts and
/// connection errors may be retried, everything else is reported.
pub(crate) fn transport_error(err: reqwest::Error, what: &str) -> UpstreamError {
    let retryable = err.is_timeout() || err.is_connect();
    let reason = format!("{what} failed");
    if retryable {
        UpstreamError::retryable(reason).with_source(err)
    } else {
        UpstreamError::fatal(reason).with_source(err)
    }
}
