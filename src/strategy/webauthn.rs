//! WebAuthn second factor and passkey first factor.
//!
//! Signature and attestation checking is delegated behind
//! [`AssertionVerifier`]; the strategies own only the flow mechanics: issue a
//! one-shot challenge, bind it to the flow, and turn a verified assertion
//! into a state transition.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowState, FlowType, SubmissionPayload, UiNode};
use crate::identity::store::{IdentityMutation, IdentityStore};
use crate::identity::{Credential, CredentialType};
use crate::strategy::{Strategy, StrategyOutcome};
use crate::text::{Message, MessageId, MessageKind};

const CONTEXT_CHALLENGE: &str = "webauthn.challenge";
const CHALLENGE_BYTES: usize = 32;

/// Verifies an authenticator assertion against a stored credential.
///
/// Implementations carry the cryptographic machinery; the strategies only
/// need the boolean outcome. The challenge passed in is the one the flow
/// issued, so replayed assertions fail on the binding.
pub trait AssertionVerifier: Send + Sync {
    fn verify(&self, credential: &Credential, challenge: &str, assertion: &str) -> Result<bool>;
}

fn generate_challenge() -> String {
    let mut raw = [0u8; CHALLENGE_BYTES];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

/// Challenge phase shared by both strategies: mint a challenge, pin it in the
/// flow context, and surface it as a UI node for the authenticator call.
fn challenge_outcome(flow: &Flow, group: &str) -> StrategyOutcome {
    let challenge = generate_challenge();
    StrategyOutcome::transition(flow.state)
        .with_active(group)
        .with_context(CONTEXT_CHALLENGE, challenge.clone())
        .with_node(UiNode::input(group, "challenge").with_value(json!(challenge)))
        .with_message(Message::new(
            MessageId::InfoSelfServiceLoginWebauthn,
            MessageKind::Info,
        ))
}

fn issued_challenge(flow: &Flow) -> Result<&str> {
    flow.context_str(CONTEXT_CHALLENGE)
        .ok_or_else(|| FlowError::validation("assertion", "no challenge was issued for this flow"))
}

fn failed_assertion(flow: &Flow, group: &str) -> StrategyOutcome {
    StrategyOutcome::transition(flow.state)
        .with_active(group)
        .with_message(Message::invalid_credentials())
}

/// Hardware-key second factor. Requires a completed first factor: the
/// identity is read from the flow context, never from the payload.
pub struct WebauthnStrategy {
    verifier: Arc<dyn AssertionVerifier>,
}

impl WebauthnStrategy {
    #[must_use]
    pub fn new(verifier: Arc<dyn AssertionVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Strategy for WebauthnStrategy {
    fn name(&self) -> &'static str {
        "webauthn"
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
        let identity_id = flow
            .context_str("identity_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                FlowError::validation("method", "webauthn requires a completed first factor")
            })?;

        if flow.flow_type == FlowType::Settings {
            // Enrollment: the relying-party layer already validated the
            // attestation; we persist its output opaquely.
            let registration = payload
                .field("webauthn_register")
                .filter(|raw| !raw.is_empty())
                .ok_or_else(|| FlowError::validation("webauthn_register", "missing registration"))?;
            let credential_id = payload
                .field("webauthn_credential_id")
                .filter(|raw| !raw.is_empty())
                .ok_or_else(|| {
                    FlowError::validation("webauthn_credential_id", "missing credential id")
                })?;
            return Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
                .with_active(self.name())
                .with_mutation(IdentityMutation::LinkCredential {
                    identity_id,
                    credential: Credential::new(
                        CredentialType::Webauthn,
                        vec![credential_id.to_string()],
                        json!({ "attestation": registration }),
                    ),
                }));
        }

        let Some(assertion) = payload.field("webauthn_assertion").filter(|raw| !raw.is_empty())
        else {
            return Ok(challenge_outcome(flow, self.name()));
        };
        let challenge = issued_challenge(flow)?;

        let identity = store.get_identity(identity_id).await?;
        let Some(credential) = identity.credentials.get(&CredentialType::Webauthn) else {
            return Err(FlowError::validation("method", "no webauthn credential configured"));
        };
        if self.verifier.verify(credential, challenge, assertion)? {
            Ok(StrategyOutcome::transition(FlowState::PassedChallenge).with_active(self.name()))
        } else {
            Ok(failed_assertion(flow, self.name()))
        }
    }
}

/// Discoverable-credential first factor: the assertion names its credential
/// id, and the identity is looked up from it.
pub struct PasskeyStrategy {
    verifier: Arc<dyn AssertionVerifier>,
}

impl PasskeyStrategy {
    #[must_use]
    pub fn new(verifier: Arc<dyn AssertionVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Strategy for PasskeyStrategy {
    fn name(&self) -> &'static str {
        "passkey"
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
        if flow.flow_type == FlowType::Settings {
            let identity_id = flow
                .context_str("identity_id")
                .and_then(|raw| Uuid::parse_str(raw).ok())
                .ok_or_else(|| {
                    FlowError::validation("method", "linking requires an authenticated session")
                })?;
            let registration = payload
                .field("passkey_register")
                .filter(|raw| !raw.is_empty())
                .ok_or_else(|| FlowError::validation("passkey_register", "missing registration"))?;
            let credential_id = payload
                .field("passkey_credential_id")
                .filter(|raw| !raw.is_empty())
                .ok_or_else(|| {
                    FlowError::validation("passkey_credential_id", "missing credential id")
                })?;
            return Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
                .with_active(self.name())
                .with_mutation(IdentityMutation::LinkCredential {
                    identity_id,
                    credential: Credential::new(
                        CredentialType::Passkey,
                        vec![credential_id.to_string()],
                        json!({ "attestation": registration }),
                    ),
                }));
        }

        let Some(assertion) = payload.field("passkey_assertion").filter(|raw| !raw.is_empty())
        else {
            return Ok(challenge_outcome(flow, self.name()));
        };
        let challenge = issued_challenge(flow)?;
        let Some(credential_id) = payload
            .field("passkey_credential_id")
            .filter(|raw| !raw.is_empty())
        else {
            return Ok(failed_assertion(flow, self.name()));
        };

        // Unknown credential ids read the same as a failed signature.
        let Some(identity) = store
            .find_by_credential_identifier(CredentialType::Passkey, credential_id)
            .await?
        else {
            return Ok(failed_assertion(flow, self.name()));
        };
        let Some(credential) = identity.credentials.get(&CredentialType::Passkey) else {
            return Ok(failed_assertion(flow, self.name()));
        };
        if self.verifier.verify(credential, challenge, assertion)? {
            Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
                .with_active(self.name())
                .with_context("identity_id", identity.id.to_string()))
        } else {
            Ok(failed_assertion(flow, self.name()))
        }
    }
}
