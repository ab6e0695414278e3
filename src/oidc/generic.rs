//! Standards-following OAuth2/OIDC adapter: POST form token exchange plus a
//! bearer-authenticated userinfo fetch, `sub` as the subject.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::error::UpstreamError;
use crate::oidc::{http_client, transport_error, Claims, Provider, ProviderConfig, ProviderToken};

pub struct GenericOidcProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    issuer: String,
    auth_url: Url,
    token_url: Url,
    userinfo_url: Url,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    token_type: String,
}

impl GenericOidcProvider {
    pub fn new(
        config: ProviderConfig,
        issuer: impl Into<String>,
        auth_url: Url,
        token_url: Url,
        userinfo_url: Url,
    ) -> Result<Self, UpstreamError> {
        Ok(Self {
            config,
            client: http_client()?,
            issuer: issuer.into(),
            auth_url,
            token_url,
            userinfo_url,
        })
    }
}

#[async_trait]
impl Provider for GenericOidcProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn auth_request(&self, state: &str) -> Result<Url, UpstreamError> {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scope.join(" "))
            .append_pair("state", state);
        Ok(url)
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, UpstreamError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];

        let response = self
            .client
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|err| transport_error(err, "token exchange"))?;

        if !response.status().is_success() {
            return Err(UpstreamError::fatal(format!(
                "token endpoint returned status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|err| {
            UpstreamError::fatal("failed to decode token response").with_source(err)
        })?;
        if token.access_token.is_empty() {
            return Err(UpstreamError::fatal(
                "token endpoint returned incomplete data: empty access_token",
            ));
        }

        Ok(ProviderToken {
            access_token: token.access_token,
            refresh_token: Some(token.refresh_token).filter(|t| !t.is_empty()),
            token_type: if token.token_type.is_empty() {
                "Bearer".to_string()
            } else {
                token.token_type
            },
            extra: Map::new(),
        })
    }

    async fn claims(&self, token: &ProviderToken) -> Result<Claims, UpstreamError> {
        let response = self
            .client
            .get(self.userinfo_url.clone())
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|err| transport_error(err, "userinfo fetch"))?;

        if !response.status().is_success() {
            return Err(UpstreamError::fatal(format!(
                "userinfo endpoint returned status {}",
                response.status()
            )));
        }

        let raw_claims: Map<String, Value> = response.json().await.map_err(|err| {
            UpstreamError::fatal("failed to decode userinfo response").with_source(err)
        })?;

        let subject = raw_claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                UpstreamError::fatal("userinfo returned incomplete data: missing sub")
            })?
            .to_string();

        let get = |key: &str| {
            raw_claims
                .get(key)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };

        Ok(Claims {
            issuer: self.issuer.clone(),
            subject,
            nickname: get("nickname"),
            name: get("name"),
            picture: get("picture"),
            gender: get("gender"),
            locale: get("locale"),
            raw_claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::GenericOidcProvider;
    use crate::oidc::{Provider, ProviderConfig};
    use anyhow::Result;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base: &str) -> Result<GenericOidcProvider> {
        let config = ProviderConfig::new("acme", "client-id", "client-secret")
            .with_scope(vec!["openid".to_string(), "profile".to_string()])
            .with_redirect_uri("https://example.com/callback");
        GenericOidcProvider::new(
            config,
            base,
            Url::parse(&format!("{base}/authorize"))?,
            Url::parse(&format!("{base}/token"))?,
            Url::parse(&format!("{base}/userinfo"))?,
        )
        .map_err(|err| anyhow::anyhow!("{err}"))
    }

    #[test]
    fn auth_request_uses_standard_client_id() -> Result<()> {
        let provider = provider("https://idp.example")?;
        let url = provider
            .auth_request("state-1")
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        assert!(url.as_str().contains("client_id=client-id"));
        assert!(url.as_str().contains("scope=openid+profile"));
        Ok(())
    }

    #[tokio::test]
    async fn exchange_and_claims_round_trip() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("client_secret=client-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-token",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sub": "user-1",
                "name": "Alice Example",
                "locale": "en"
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri())?;
        let token = provider
            .exchange_code("auth-code")
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        let claims = provider
            .claims(&token)
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        assert_eq!(claims.subject, "user-1");
        assert_eq!(claims.name.as_deref(), Some("Alice Example"));
        assert_eq!(claims.raw_claims.get("sub"), Some(&json!("user-1")));
        Ok(())
    }

    #[tokio::test]
    async fn userinfo_without_sub_is_incomplete() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-token"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "No Subject"
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri())?;
        let token = provider
            .exchange_code("auth-code")
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        let err = provider
            .claims(&token)
            .await
            .expect_err("missing sub must fail");
        assert!(err.reason.contains("incomplete data"));
        Ok(())
    }
}
