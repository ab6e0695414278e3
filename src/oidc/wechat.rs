//! WeChat (微信) Open Platform website-application login adapter.
//!
//! WeChat diverges from standard OAuth2 in several ways this adapter absorbs:
//!
//! 1. The authorization request uses `appid` instead of `client_id` and the
//!    URL must end in a `#wechat_redirect` fragment.
//! 2. Token exchange is an HTTP GET with credentials in the query string, not
//!    a POST with a form body.
//! 3. Application-level failures come back on HTTP 200 as an embedded
//!    `errcode`/`errmsg` pair, which must be inspected explicitly.
//! 4. The token response carries two user identifiers: `openid` (scoped to
//!    this application) and, when the app is bound to the Open Platform,
//!    `unionid` (stable across applications). The userinfo fetch needs the
//!    `openid`, so both ride along in the token extras.
//!
//! Subject precedence: `unionid` when present and non-empty, else `openid`.
//! This is deliberate and load-bearing: it determines account linkage across
//! flows for users who authorized more than one application.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map};
use tracing::debug;
use url::Url;

use crate::error::UpstreamError;
use crate::oidc::{http_client, transport_error, Claims, Provider, ProviderConfig, ProviderToken};

const AUTH_URL: &str = "https://open.weixin.qq.com/connect/qrconnect";
const API_BASE: &str = "https://api.weixin.qq.com";
const ISSUER: &str = "https://api.weixin.qq.com";
const DEFAULT_SCOPE: &str = "snsapi_login";

pub struct WeChatProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    api_base: Url,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    openid: String,
    #[serde(default)]
    unionid: String,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    openid: String,
    #[serde(default)]
    nickname: String,
    /// 1 = male, 2 = female, 0 = unknown.
    #[serde(default)]
    sex: i64,
    #[serde(default)]
    province: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    headimgurl: String,
    #[serde(default)]
    privilege: Vec<String>,
    #[serde(default)]
    unionid: String,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

impl WeChatProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, UpstreamError> {
        let api_base = Url::parse(API_BASE)
            .map_err(|err| UpstreamError::fatal("invalid api base url").with_source(err))?;
        Ok(Self {
            config,
            client: http_client()?,
            api_base,
        })
    }

    /// Point the adapter at a different API host. Test seam.
    #[must_use]
    pub fn with_api_base(mut self, api_base: Url) -> Self {
        self.api_base = api_base;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        self.api_base
            .join(path)
            .map_err(|err| UpstreamError::fatal("invalid endpoint path").with_source(err))
    }
}

#[async_trait]
impl Provider for WeChatProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn auth_request(&self, state: &str) -> Result<Url, UpstreamError> {
        let mut url = Url::parse(AUTH_URL)
            .map_err(|err| UpstreamError::fatal("invalid auth url").with_source(err))?;
        let scope = if self.config.scope.is_empty() {
            DEFAULT_SCOPE.to_string()
        } else {
            self.config.scope.join(",")
        };
        url.query_pairs_mut()
            .append_pair("appid", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scope)
            .append_pair("state", state);
        url.set_fragment(Some("wechat_redirect"));
        Ok(url)
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, UpstreamError> {
        // Non-standard: GET with credentials as query parameters.
        let mut url = self.endpoint("/sns/oauth2/access_token")?;
        url.query_pairs_mut()
            .append_pair("appid", &self.config.client_id)
            .append_pair("secret", &self.config.client_secret)
            .append_pair("code", code)
            .append_pair("grant_type", "authorization_code");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| transport_error(err, "wechat token exchange"))?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| {
                UpstreamError::fatal("failed to decode wechat token response").with_source(err)
            })?;

        // WeChat signals failure inside an HTTP 200 body.
        if token.errcode != 0 {
            return Err(UpstreamError::fatal(format!(
                "wechat token error: code={}, msg={}",
                token.errcode, token.errmsg
            )));
        }
        if token.access_token.is_empty() || token.openid.is_empty() {
            return Err(UpstreamError::fatal(
                "wechat returned incomplete data: empty access_token or openid",
            ));
        }

        debug!(provider = %self.config.id, "wechat token exchange succeeded");

        let mut extra = Map::new();
        extra.insert("openid".to_string(), json!(token.openid));
        extra.insert("unionid".to_string(), json!(token.unionid));

        Ok(ProviderToken {
            access_token: token.access_token,
            refresh_token: if token.refresh_token.is_empty() {
                None
            } else {
                Some(token.refresh_token)
            },
            token_type: "Bearer".to_string(),
            extra,
        })
    }

    async fn claims(&self, token: &ProviderToken) -> Result<Claims, UpstreamError> {
        // The openid rides along from the exchange; without it the userinfo
        // endpoint is unreachable.
        let openid = token
            .extra_str("openid")
            .ok_or_else(|| UpstreamError::fatal("wechat openid not found in token"))?;

        let mut url = self.endpoint("/sns/userinfo")?;
        url.query_pairs_mut()
            .append_pair("access_token", &token.access_token)
            .append_pair("openid", openid)
            .append_pair("lang", "zh_CN");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| transport_error(err, "wechat userinfo fetch"))?;

        let user: UserInfoResponse = response
            .json()
            .await
            .map_err(|err| {
                UpstreamError::fatal("failed to decode wechat userinfo response").with_source(err)
            })?;

        if user.errcode != 0 {
            return Err(UpstreamError::fatal(format!(
                "wechat userinfo error: code={}, msg={}",
                user.errcode, user.errmsg
            )));
        }

        // Prefer the unionid from userinfo, then the one from the exchange.
        let unionid = if user.unionid.is_empty() {
            token.extra_str("unionid").unwrap_or_default().to_string()
        } else {
            user.unionid.clone()
        };

        // Cross-application id wins over the per-application one.
        let subject = if unionid.is_empty() {
            user.openid.clone()
        } else {
            unionid.clone()
        };
        if subject.is_empty() {
            return Err(UpstreamError::fatal(
                "wechat returned incomplete data: no usable subject",
            ));
        }

        let gender = match user.sex {
            1 => Some("male".to_string()),
            2 => Some("female".to_string()),
            _ => None,
        };

        let mut raw_claims = Map::new();
        raw_claims.insert("openid".to_string(), json!(user.openid));
        raw_claims.insert("unionid".to_string(), json!(unionid));
        raw_claims.insert("nickname".to_string(), json!(user.nickname));
        raw_claims.insert("sex".to_string(), json!(user.sex));
        raw_claims.insert("province".to_string(), json!(user.province));
        raw_claims.insert("city".to_string(), json!(user.city));
        raw_claims.insert("country".to_string(), json!(user.country));
        raw_claims.insert("headimgurl".to_string(), json!(user.headimgurl));
        raw_claims.insert("privilege".to_string(), json!(user.privilege));

        Ok(Claims {
            issuer: ISSUER.to_string(),
            subject,
            nickname: Some(user.nickname.clone()).filter(|n| !n.is_empty()),
            name: Some(user.nickname).filter(|n| !n.is_empty()),
            picture: Some(user.headimgurl).filter(|p| !p.is_empty()),
            gender,
            locale: Some(user.country).filter(|c| !c.is_empty()),
            raw_claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::WeChatProvider;
    use crate::error::UpstreamKind;
    use crate::oidc::{Provider, ProviderConfig, ProviderToken};
    use anyhow::Result;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(api_base: &str) -> Result<WeChatProvider> {
        let config = ProviderConfig::new("wechat", "test-app-id", "test-app-secret")
            .with_scope(vec!["snsapi_login".to_string()])
            .with_redirect_uri("https://example.com/callback");
        let provider = WeChatProvider::new(config)
            .map_err(|err| anyhow::anyhow!("{err}"))?
            .with_api_base(Url::parse(api_base)?);
        Ok(provider)
    }

    fn bearer_token(openid: &str, unionid: &str) -> ProviderToken {
        let mut extra = serde_json::Map::new();
        extra.insert("openid".to_string(), json!(openid));
        extra.insert("unionid".to_string(), json!(unionid));
        ProviderToken {
            access_token: "access-token".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            extra,
        }
    }

    #[test]
    fn auth_request_uses_appid_and_wechat_redirect() -> Result<()> {
        let provider = provider("https://api.weixin.qq.com")?;
        let url = provider
            .auth_request("state-123")
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        assert!(url.as_str().starts_with("https://open.weixin.qq.com/connect/qrconnect"));
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(query.contains(&("appid".to_string(), "test-app-id".to_string())));
        assert!(query.contains(&("scope".to_string(), "snsapi_login".to_string())));
        assert!(query.contains(&("state".to_string(), "state-123".to_string())));
        assert!(!url.as_str().contains("client_id="));
        assert_eq!(url.fragment(), Some("wechat_redirect"));
        Ok(())
    }

    #[tokio::test]
    async fn exchange_code_uses_get_with_query_credentials() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sns/oauth2/access_token"))
            .and(query_param("appid", "test-app-id"))
            .and(query_param("secret", "test-app-secret"))
            .and(query_param("code", "auth-code"))
            .and(query_param("grant_type", "authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-token",
                "expires_in": 7200,
                "refresh_token": "refresh-token",
                "openid": "open-abc",
                "scope": "snsapi_login",
                "unionid": "union-xyz"
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri())?;
        let token = provider
            .exchange_code("auth-code")
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        assert_eq!(token.access_token, "access-token");
        assert_eq!(token.refresh_token.as_deref(), Some("refresh-token"));
        assert_eq!(token.extra_str("openid"), Some("open-abc"));
        assert_eq!(token.extra_str("unionid"), Some("union-xyz"));
        Ok(())
    }

    #[tokio::test]
    async fn exchange_code_surfaces_errcode_on_http_200() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sns/oauth2/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 40029,
                "errmsg": "invalid code"
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri())?;
        let err = provider
            .exchange_code("bad-code")
            .await
            .expect_err("errcode must fail the exchange");
        assert_eq!(err.kind, UpstreamKind::Fatal);
        assert!(err.reason.contains("40029"));
        Ok(())
    }

    #[tokio::test]
    async fn exchange_code_rejects_incomplete_data() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sns/oauth2/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-token",
                "openid": ""
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri())?;
        let err = provider
            .exchange_code("auth-code")
            .await
            .expect_err("missing openid must fail");
        assert_eq!(err.kind, UpstreamKind::Fatal);
        assert!(err.reason.contains("incomplete data"));
        Ok(())
    }

    #[tokio::test]
    async fn claims_prefer_unionid_over_openid() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sns/userinfo"))
            .and(query_param("access_token", "access-token"))
            .and(query_param("openid", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "openid": "abc",
                "nickname": "测试用户",
                "sex": 2,
                "country": "CN",
                "headimgurl": "https://example.com/avatar.png",
                "unionid": "xyz"
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri())?;
        let claims = provider
            .claims(&bearer_token("abc", ""))
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        assert_eq!(claims.subject, "xyz");
        assert_eq!(claims.nickname.as_deref(), Some("测试用户"));
        assert_eq!(claims.gender.as_deref(), Some("female"));
        assert_eq!(claims.locale.as_deref(), Some("CN"));
        assert_eq!(
            claims.raw_claims.get("openid").and_then(|v| v.as_str()),
            Some("abc")
        );
        Ok(())
    }

    #[tokio::test]
    async fn claims_fall_back_to_openid_without_unionid() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sns/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "openid": "abc",
                "nickname": "solo",
                "sex": 1
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri())?;
        let claims = provider
            .claims(&bearer_token("abc", ""))
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        assert_eq!(claims.subject, "abc");
        assert_eq!(claims.gender.as_deref(), Some("male"));
        Ok(())
    }

    #[tokio::test]
    async fn claims_use_token_unionid_when_userinfo_omits_it() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sns/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "openid": "abc",
                "nickname": "from-token"
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri())?;
        let claims = provider
            .claims(&bearer_token("abc", "union-from-token"))
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        assert_eq!(claims.subject, "union-from-token");
        Ok(())
    }

    #[tokio::test]
    async fn claims_without_openid_in_token_fail() -> Result<()> {
        let provider = provider("https://api.weixin.qq.com")?;
        let token = ProviderToken {
            access_token: "access-token".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            extra: serde_json::Map::new(),
        };
        let err = provider
            .claims(&token)
            .await
            .expect_err("missing openid must fail before any request");
        assert!(err.reason.contains("openid"));
        Ok(())
    }

    #[tokio::test]
    async fn connection_failure_is_retryable() -> Result<()> {
        // Bind-then-drop leaves a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let provider = provider(&format!("http://127.0.0.1:{port}"))?;
        let err = provider
            .exchange_code("auth-code")
            .await
            .expect_err("connection must fail");
        assert!(err.is_retryable());
        Ok(())
    }
}
