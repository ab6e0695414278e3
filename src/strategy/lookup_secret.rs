//! Backup recovery codes ("lookup secrets") for account access when other
//! factors are unavailable. Codes are Argon2id-hashed with a server-side
//! pepper; each code is single use.

use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowState, FlowType, SubmissionPayload};
use crate::identity::store::{IdentityMutation, IdentityStore};
use crate::identity::{Credential, CredentialType};
use crate::strategy::{Strategy, StrategyOutcome};
use crate::text::{Message, MessageId, MessageKind};

const CODE_COUNT: usize = 10;
const CODE_LEN: usize = 12;
const CODE_GROUP_SIZE: usize = 4;
// No 0/O/1/I: codes are read aloud and retyped.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// One stored backup code: its hash and whether it was consumed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredCode {
    pub hash: String,
    #[serde(default)]
    pub used: bool,
}

/// A freshly generated batch: plaintext for one-time display plus the
/// credential config to persist.
#[derive(Debug)]
pub struct CodeBatch {
    pub codes: Vec<String>,
    pub stored: Vec<StoredCode>,
}

impl CodeBatch {
    pub fn generate(pepper: &[u8]) -> Result<Self> {
        let mut codes = Vec::with_capacity(CODE_COUNT);
        let mut stored = Vec::with_capacity(CODE_COUNT);
        for _ in 0..CODE_COUNT {
            let code = generate_code()?;
            let hash = hash_code(&code, pepper)?;
            codes.push(code);
            stored.push(StoredCode { hash, used: false });
        }
        Ok(Self { codes, stored })
    }
}

/// Normalize a submitted code: strip separators, uppercase, check alphabet.
pub fn normalize_code(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != CODE_LEN
        || !normalized.bytes().all(|ch| CODE_ALPHABET.contains(&ch))
    {
        return Err(FlowError::validation("lookup_secret", "malformed backup code"));
    }
    Ok(normalized)
}

/// Format a normalized code in display groups (`ABCD-EFGH-JKLM`).
pub fn format_code(normalized: &str) -> Result<String> {
    if normalized.len() != CODE_LEN {
        return Err(FlowError::validation("lookup_secret", "malformed backup code"));
    }
    let mut out = String::with_capacity(CODE_LEN + 2);
    for (idx, chunk) in normalized.as_bytes().chunks(CODE_GROUP_SIZE).enumerate() {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(std::str::from_utf8(chunk).map_err(|_| {
            FlowError::validation("lookup_secret", "malformed backup code")
        })?);
    }
    Ok(out)
}

fn generate_code() -> Result<String> {
    let mut raw = [0u8; CODE_LEN];
    OsRng.fill_bytes(&mut raw);
    let mut normalized = String::with_capacity(CODE_LEN);
    for byte in raw {
        let idx = usize::from(byte) % CODE_ALPHABET.len();
        if let Some(&char_byte) = CODE_ALPHABET.get(idx) {
            normalized.push(char_byte as char);
        }
    }
    format_code(&normalized)
}

fn argon2_with_pepper(pepper: &[u8]) -> Result<Argon2<'_>> {
    Argon2::new_with_secret(
        pepper,
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::default(),
    )
    .map_err(|_| FlowError::Internal(anyhow::anyhow!("failed to initialize Argon2id")))
}

fn hash_code(code: &str, pepper: &[u8]) -> Result<String> {
    let normalized = normalize_code(code)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2_with_pepper(pepper)?
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|_| FlowError::Internal(anyhow::anyhow!("failed to hash backup code")))?
        .to_string();
    Ok(hash)
}

fn verify_code(code: &str, stored_hash: &str, pepper: &[u8]) -> Result<bool> {
    let normalized = normalize_code(code)?;
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return Ok(false);
    };
    Ok(argon2_with_pepper(pepper)?
        .verify_password(normalized.as_bytes(), &parsed)
        .is_ok())
}

pub struct LookupSecretStrategy {
    pepper: Vec<u8>,
}

impl LookupSecretStrategy {
    #[must_use]
    pub fn new(pepper: Vec<u8>) -> Self {
        Self { pepper }
    }

    fn wrong_code(flow: &Flow) -> StrategyOutcome {
        StrategyOutcome::transition(flow.state).with_message(Message::new(
            MessageId::ErrorValidationLookupInvalid,
            MessageKind::Error,
        ))
    }
}

#[async_trait]
impl Strategy for LookupSecretStrategy {
    fn name(&self) -> &'static str {
        "lookup_secret"
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
        let submitted = payload
            .field("lookup_secret")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| FlowError::validation("lookup_secret", "missing backup code"))?;
        let identity_id = flow
            .context_str("identity_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                FlowError::validation("method", "backup codes require a completed first factor")
            })?;

        // Malformed input gets the same message as a wrong code.
        if normalize_code(submitted).is_err() {
            return Ok(Self::wrong_code(flow).with_active(self.name()));
        }

        let identity = store.get_identity(identity_id).await?;
        let Some(credential) = identity.credentials.get(&CredentialType::LookupSecret) else {
            return Err(FlowError::validation("method", "no backup codes configured"));
        };
        let mut codes: Vec<StoredCode> = credential
            .config
            .get("codes")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| FlowError::Internal(err.into()))?
            .unwrap_or_default();

        let mut matched = false;
        for stored in &mut codes {
            if stored.used {
                continue;
            }
            if verify_code(submitted, &stored.hash, &self.pepper)? {
                // Consumed with the flow transition: the mark-used mutation
                // and PassedChallenge commit together.
                stored.used = true;
                matched = true;
                break;
            }
        }

        if !matched {
            return Ok(Self::wrong_code(flow).with_active(self.name()));
        }

        Ok(StrategyOutcome::transition(FlowState::PassedChallenge)
            .with_active(self.name())
            .with_mutation(IdentityMutation::LinkCredential {
                identity_id,
                credential: Credential::new(
                    CredentialType::LookupSecret,
                    Vec::new(),
                    json!({ "codes": serde_json::to_value(codes)
                        .map_err(|err| FlowError::Internal(err.into()))? }),
                ),
            }))
    }
}
