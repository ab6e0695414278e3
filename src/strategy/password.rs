//! Password strategy: Argon2id-hashed credentials for login and registration.

use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use async_trait::async_trait;
use rand::rngs::OsRng;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowState, FlowType, SubmissionPayload};
use crate::identity::store::{IdentityMutation, IdentityStore};
use crate::identity::{normalize_address, Credential, CredentialType, Identity, LinkingHints};
use crate::strategy::{Strategy, StrategyOutcome};
use crate::text::Message;

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| FlowError::Internal(anyhow::anyhow!("failed to hash password")))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash. Wrong passwords and malformed
/// hashes both come back `false`; neither is distinguishable to the caller.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Default)]
pub struct PasswordStrategy;

impl PasswordStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn login(
        &self,
        store: &dyn IdentityStore,
        payload: &SubmissionPayload,
    ) -> Result<StrategyOutcome> {
        let identifier = payload
            .field("identifier")
            .map(normalize_address)
            .ok_or_else(|| FlowError::validation("identifier", "missing identifier"))?;
        let password = payload
            .field("password")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| FlowError::validation("password", "missing password"))?;

        let identity = store
            .find_by_credential_identifier(CredentialType::Password, &identifier)
            .await?;

        // Unknown identifiers and wrong passwords produce the same message so
        // login cannot be used to probe for accounts.
        let failed = StrategyOutcome::transition(FlowState::ChooseMethod)
            .with_active(self.name())
            .with_message(Message::invalid_credentials());

        let Some(identity) = identity else {
            debug!("password login for unknown identifier");
            return Ok(failed);
        };
        let Some(stored_hash) = identity
            .credentials
            .get(&CredentialType::Password)
            .and_then(|credential| credential.config.get("hashed_password"))
            .and_then(Value::as_str)
        else {
            return Ok(failed);
        };

        if verify_password(password, stored_hash) {
            Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
                .with_active(self.name())
                .with_context("identity_id", json!(identity.id.to_string())))
        } else {
            Ok(failed)
        }
    }

    async fn register(
        &self,
        store: &dyn IdentityStore,
        payload: &SubmissionPayload,
    ) -> Result<StrategyOutcome> {
        let identifier = payload
            .field("identifier")
            .or_else(|| payload.field("email"))
            .map(normalize_address)
            .ok_or_else(|| FlowError::validation("identifier", "missing identifier"))?;
        let password = payload
            .field("password")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| FlowError::validation("password", "missing password"))?;

        // Identifier collisions surface linking data; accounts are never
        // merged silently.
        if let Some(existing) = store
            .find_by_credential_identifier(CredentialType::Password, &identifier)
            .await?
        {
            return Err(FlowError::DuplicateCredentials(LinkingHints::for_identity(
                identifier, &existing,
            )));
        }

        let traits = payload
            .fields
            .get("traits")
            .cloned()
            .unwrap_or_else(|| json!({ "email": identifier }));

        let identity = Identity::new(traits).with_credential(Credential::new(
            CredentialType::Password,
            vec![identifier],
            json!({ "hashed_password": hash_password(password)? }),
        ));
        let identity_id = identity.id;

        Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
            .with_active(self.name())
            .with_mutation(IdentityMutation::CreateIdentity(identity))
            .with_context("identity_id", json!(identity_id.to_string())))
    }
}

#[async_trait]
impl Strategy for PasswordStrategy {
    fn name(&self) -> &'static str {
        "password"
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
        match flow.flow_type {
            FlowType::Registration => self.register(store, payload).await,
            // Settings reuses the registration shape to set a new password.
            FlowType::Login | FlowType::Settings => self.login(store, payload).await,
            _ => Err(FlowError::NoStrategyFound(self.name().to_string())),
        }
    }
}
