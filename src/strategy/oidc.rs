//! Social sign-in through registered [`Provider`] adapters.
//!
//! The strategy stays protocol-agnostic: adapters hand back normalized
//! [`Claims`] and the linkage key is always `provider:subject`. A login with
//! an unknown subject auto-registers; a collision with an existing identifier
//! is surfaced as linking hints and never merged automatically.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowState, FlowType, SubmissionPayload, UiNode};
use crate::identity::store::{IdentityMutation, IdentityStore};
use crate::identity::{Credential, CredentialType, Identity, LinkingHints};
use crate::oidc::{Claims, Provider};
use crate::strategy::{Strategy, StrategyOutcome};

const CONTEXT_PROVIDER: &str = "oidc.provider";

pub struct OidcStrategy {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl OidcStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers
            .insert(provider.config().id.clone(), provider);
        self
    }

    fn provider(&self, id: &str) -> Result<&Arc<dyn Provider>> {
        self.providers
            .get(id)
            .ok_or_else(|| FlowError::validation("provider", "unknown provider"))
    }

    /// Phase one: build the authorization redirect. The flow id doubles as
    /// the `state` parameter and is checked again on callback.
    fn start(&self, flow: &Flow, provider: &Arc<dyn Provider>) -> Result<StrategyOutcome> {
        let url = provider.auth_request(&flow.id.to_string())?;
        debug!(provider = %provider.config().id, "built authorization redirect");
        Ok(StrategyOutcome::transition(flow.state)
            .with_active(self.name())
            .with_context(CONTEXT_PROVIDER, provider.config().id.clone())
            .with_node(UiNode::input("oidc", "redirect_to").with_value(json!(url.to_string()))))
    }

    /// Phase two: exchange the callback code, fetch claims, then log in,
    /// register, or link depending on the flow type.
    async fn finish(
        &self,
        flow: &Flow,
        store: &dyn IdentityStore,
        provider: &Arc<dyn Provider>,
        code: &str,
    ) -> Result<StrategyOutcome> {
        let token = provider.exchange_code(code).await?;
        let claims = provider.claims(&token).await?;
        let provider_id = provider.config().id.as_str();
        let identifier = format!("{provider_id}:{}", claims.subject);
        let existing = store
            .find_by_credential_identifier(CredentialType::Oidc, &identifier)
            .await?;

        match flow.flow_type {
            FlowType::Login => match existing {
                Some(identity) => {
                    info!(provider = provider_id, identity_id = %identity.id, "external login");
                    Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
                        .with_active(self.name())
                        .with_context("identity_id", identity.id.to_string()))
                }
                // First sight of this subject: provision an identity on the
                // spot rather than bouncing through a separate flow.
                None => self.register_identity(&identifier, provider_id, &claims),
            },
            FlowType::Registration => match existing {
                Some(identity) => Err(FlowError::DuplicateCredentials(LinkingHints::for_identity(
                    identifier, &identity,
                ))),
                None => self.register_identity(&identifier, provider_id, &claims),
            },
            FlowType::Settings => {
                let identity_id = flow
                    .context_str("identity_id")
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                    .ok_or_else(|| {
                        FlowError::validation("method", "linking requires an authenticated session")
                    })?;
                if let Some(other) = existing.filter(|identity| identity.id != identity_id) {
                    return Err(FlowError::DuplicateCredentials(LinkingHints::for_identity(
                        identifier, &other,
                    )));
                }
                Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
                    .with_active(self.name())
                    .with_mutation(IdentityMutation::LinkCredential {
                        identity_id,
                        credential: oidc_credential(&identifier, provider_id, &claims),
                    }))
            }
            FlowType::Recovery | FlowType::Verification => {
                Err(FlowError::validation("method", "method not allowed for this flow"))
            }
        }
    }

    fn register_identity(
        &self,
        identifier: &str,
        provider_id: &str,
        claims: &Claims,
    ) -> Result<StrategyOutcome> {
        let identity = Identity::new(traits_from_claims(claims))
            .with_credential(oidc_credential(identifier, provider_id, claims));
        info!(provider = provider_id, identity_id = %identity.id, "provisioned identity");
        Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
            .with_active(self.name())
            .with_context("identity_id", identity.id.to_string())
            .with_mutation(IdentityMutation::CreateIdentity(identity)))
    }
}

impl Default for OidcStrategy {
    fn default() -> Self {
        Self::new()
    }
}

fn oidc_credential(identifier: &str, provider_id: &str, claims: &Claims) -> Credential {
    Credential::new(
        CredentialType::Oidc,
        vec![identifier.to_string()],
        json!({
            "providers": [{
                "provider": provider_id,
                "subject": claims.subject,
                "issuer": claims.issuer,
            }]
        }),
    )
}

/// Seed identity traits from whatever the provider disclosed.
fn traits_from_claims(claims: &Claims) -> Value {
    let mut traits = serde_json::Map::new();
    for (key, value) in [
        ("name", &claims.name),
        ("nickname", &claims.nickname),
        ("picture", &claims.picture),
        ("gender", &claims.gender),
        ("locale", &claims.locale),
    ] {
        if let Some(value) = value {
            traits.insert(key.to_string(), json!(value));
        }
    }
    Value::Object(traits)
}

#[async_trait]
impl Strategy for OidcStrategy {
    fn name(&self) -> &'static str {
        "oidc"
    }

    fn supports(&self, flow_type: FlowType) -> bool {
        matches!(
            flow_type,
            FlowType::Login | FlowType::Registration | FlowType::Settings
        )
    }

    async fn execute(
        &self,
        flow: &Flow,
        store: &dyn IdentityStore,
        payload: &SubmissionPayload,
    ) -> Result<StrategyOutcome> {
        let provider_id = payload
            .field("provider")
            .or_else(|| flow.context_str(CONTEXT_PROVIDER))
            .ok_or_else(|| FlowError::validation("provider", "missing provider"))?
            .to_string();
        let provider = self.provider(&provider_id)?;

        match payload.field("code").filter(|code| !code.is_empty()) {
            Some(code) => {
                let code = code.to_string();
                self.finish(flow, store, provider, &code).await
            }
            None => self.start(flow, provider),
        }
    }
}
