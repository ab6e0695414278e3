//! TOTP strategy: authenticator-app codes as a second factor, plus enrollment
//! through the settings flow.

use async_trait::async_trait;
use serde_json::{json, Value};
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowState, FlowType, SubmissionPayload};
use crate::identity::store::{IdentityMutation, IdentityStore};
use crate::identity::{Credential, CredentialType};
use crate::strategy::{Strategy, StrategyOutcome};
use crate::text::Message;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;

/// Generate a fresh base32 secret for enrollment.
#[must_use]
pub fn generate_secret() -> String {
    Secret::generate_secret().to_encoded().to_string()
}

fn totp_for(secret_base32: &str, issuer: &str) -> Result<TOTP> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|_| FlowError::validation("totp_secret", "invalid base32 secret"))?;
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP,
        secret,
        Some(issuer.to_string()),
        "user".to_string(),
    )
    .map_err(|_| FlowError::validation("totp_secret", "secret too short"))
}

/// Check a code against a stored secret. Clock skew of one step is accepted.
pub fn check_code(secret_base32: &str, issuer: &str, code: &str) -> Result<bool> {
    let totp = totp_for(secret_base32, issuer)?;
    Ok(totp.check_current(code).unwrap_or(false))
}

pub struct TotpStrategy {
    issuer: String,
}

impl TotpStrategy {
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
        }
    }

    fn identity_from_context(flow: &Flow) -> Result<Uuid> {
        flow.context_str("identity_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                FlowError::validation("method", "totp requires a completed first factor")
            })
    }

    async fn login(
        &self,
        flow: &Flow,
        store: &dyn IdentityStore,
        payload: &SubmissionPayload,
    ) -> Result<StrategyOutcome> {
        let code = payload
            .field("totp_code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| FlowError::validation("totp_code", "missing code"))?;
        let identity_id = Self::identity_from_context(flow)?;
        let identity = store.get_identity(identity_id).await?;

        let Some(secret) = identity
            .credentials
            .get(&CredentialType::Totp)
            .and_then(|credential| credential.config.get("totp_secret"))
            .and_then(Value::as_str)
        else {
            return Err(FlowError::validation("method", "totp is not configured"));
        };

        if check_code(secret, &self.issuer, code)? {
            Ok(StrategyOutcome::transition(FlowState::PassedChallenge).with_active(self.name()))
        } else {
            Ok(StrategyOutcome::transition(flow.state)
                .with_active(self.name())
                .with_message(Message::new(
                    crate::text::MessageId::ErrorValidationTotpVerifierWrong,
                    crate::text::MessageKind::Error,
                )))
        }
    }

    /// Enrollment: the settings flow submits the provisioned secret plus one
    /// valid code to prove the authenticator holds it.
    async fn enroll(
        &self,
        flow: &Flow,
        payload: &SubmissionPayload,
    ) -> Result<StrategyOutcome> {
        let secret = payload
            .field("totp_secret")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FlowError::validation("totp_secret", "missing secret"))?;
        let code = payload
            .field("totp_code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| FlowError::validation("totp_code", "missing confirmation code"))?;
        let identity_id = Self::identity_from_context(flow)?;

        if !check_code(secret, &self.issuer, code)? {
            return Ok(StrategyOutcome::transition(flow.state)
                .with_active(self.name())
                .with_message(Message::new(
                    crate::text::MessageId::ErrorValidationTotpVerifierWrong,
                    crate::text::MessageKind::Error,
                )));
        }

        Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
            .with_active(self.name())
            .with_mutation(IdentityMutation::LinkCredential {
                identity_id,
                credential: Credential::new(
                    CredentialType::Totp,
                    Vec::new(),
                    json!({ "totp_secret": secret }),
                ),
            }))
    }
}

#[async_trait]
impl Strategy for TotpStrategy {
    fn name(&self) -> &'static str {
        "totp"
    }

    fn supports(&self, flow_type: FlowType) -> bool {
        matches!(flow_type, FlowType::Login | FlowType::Settings)
    }

    async fn execute(
        &self,
        flow: &Flow,
        store: &dyn IdentityStore,
        payload: &SubmissionPayload,
    ) -> Result<StrategyOutcome> {
        match flow.flow_type {
            FlowType::Login => self.login(flow, store, payload).await,
            FlowType::Settings => self.enroll(flow, payload).await,
            _ => Err(FlowError::NoStrategyFound(self.name().to_string())),
        }
    }
}
