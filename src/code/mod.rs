//! One-time code generation, dispatch, and verification.
//!
//! Codes are drawn uniformly from a random source, sized against the attempt
//! budget. Only the SHA-256 hash is persisted; the clear code is handed to the
//! courier and never logged. Verification runs as a single atomic
//! read-modify-write per address so concurrent guesses linearize.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::courier::CourierJob;
use crate::error::Result;
use crate::identity::store::{IdentityMutation, IdentityStore};
use crate::identity::{AddressStatus, VerifiableAddress, Via};

const CODE_LENGTH: u32 = 6;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_CODE_TTL_MINUTES: i64 = 15;

/// Outcome of a single verification attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeVerdict {
    Success,
    InvalidOrUsed,
    Expired,
    TooManyAttempts,
}

/// A freshly issued challenge: the storage mutation plus the courier job.
/// The clear code only exists inside the job body.
#[derive(Debug)]
pub struct IssuedChallenge {
    pub mutation: IdentityMutation,
    pub job: CourierJob,
}

/// Generate a one-time code and the hash to persist in its place.
pub fn generate_code() -> Result<(String, Vec<u8>)> {
    let bound = 10u32
        .checked_pow(CODE_LENGTH)
        .context("code length overflows u32")?;
    let value = OsRng.gen_range(0..bound);
    let code = format!("{value:0width$}", width = CODE_LENGTH as usize);
    let hash = hash_code(&code);
    Ok((code, hash))
}

/// Hash a code for storage; raw codes never touch the store.
#[must_use]
pub fn hash_code(code: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.finalize().to_vec()
}

#[derive(Clone, Debug)]
pub struct CodeEngine {
    code_ttl: Duration,
    max_attempts: u32,
}

impl Default for CodeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            code_ttl: Duration::minutes(DEFAULT_CODE_TTL_MINUTES),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.code_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Issue a fresh challenge for an address. The returned mutation sets
    /// status `Sent`, stores the new hash with a fresh expiry, and resets the
    /// attempt counter; any previous code is replaced (single active code per
    /// address). The caller commits the mutation and dispatches the job.
    pub fn issue(&self, identity_id: Uuid, address: &str, via: Via) -> Result<IssuedChallenge> {
        let (code, code_hash) = generate_code()?;
        let expires_at = Utc::now() + self.code_ttl;
        Ok(IssuedChallenge {
            mutation: IdentityMutation::IssueChallenge {
                identity_id,
                address: address.to_string(),
                code_hash,
                expires_at,
            },
            job: CourierJob::code(address, via, &code),
        })
    }

    /// Verify a supplied code against the address's stored hash.
    ///
    /// The whole decision runs under the store's per-address atomicity, so two
    /// concurrent correct guesses can never both succeed.
    pub async fn verify(
        &self,
        store: &dyn IdentityStore,
        identity_id: Uuid,
        address: &str,
        supplied: &str,
    ) -> Result<CodeVerdict> {
        let supplied_hash = hash_code(supplied.trim());
        let max_attempts = self.max_attempts;
        store
            .with_address(
                identity_id,
                address,
                Box::new(move |address| decide(address, &supplied_hash, max_attempts, Utc::now())),
            )
            .await
    }
}

/// The verification decision. Ordering matters: expiry consumes no attempt,
/// the ceiling is checked before incrementing, and a match irreversibly
/// consumes the code.
fn decide(
    address: &mut VerifiableAddress,
    supplied_hash: &[u8],
    max_attempts: u32,
    now: DateTime<Utc>,
) -> CodeVerdict {
    match address.code_expires_at {
        None => return CodeVerdict::InvalidOrUsed,
        Some(expires_at) if now > expires_at => return CodeVerdict::Expired,
        Some(_) => {}
    }

    if address.attempts_used >= max_attempts {
        return CodeVerdict::TooManyAttempts;
    }
    address.attempts_used += 1;

    let Some(stored) = address.code_hash.as_deref() else {
        return CodeVerdict::InvalidOrUsed;
    };
    if stored.len() != supplied_hash.len() || !bool::from(stored.ct_eq(supplied_hash)) {
        return CodeVerdict::InvalidOrUsed;
    }

    // Single use: clear the hash so a replayed code can never match again.
    address.code_hash = None;
    address.code_expires_at = None;
    address.status = AddressStatus::Completed;
    address.verified = true;
    address.verified_at = Some(now);
    CodeVerdict::Success
}

#[cfg(test)]
mod tests {
    use super::{decide, generate_code, hash_code, CodeEngine, CodeVerdict};
    use crate::identity::store::IdentityMutation;
    use crate::identity::{AddressStatus, VerifiableAddress, Via};
    use anyhow::Result;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn challenged_address(code: &str) -> VerifiableAddress {
        let mut address = VerifiableAddress::new("+1234567890", Via::Sms);
        address.status = AddressStatus::Sent;
        address.code_hash = Some(hash_code(code));
        address.code_expires_at = Some(Utc::now() + Duration::minutes(15));
        address
    }

    #[test]
    fn generate_code_is_six_digits() -> Result<()> {
        for _ in 0..32 {
            let (code, hash) = generate_code()?;
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
            assert_eq!(hash, hash_code(&code));
        }
        Ok(())
    }

    #[test]
    fn correct_code_succeeds_once() {
        let mut address = challenged_address("123456");
        let hash = hash_code("123456");

        assert_eq!(decide(&mut address, &hash, 5, Utc::now()), CodeVerdict::Success);
        assert!(address.verified);
        assert_eq!(address.status, AddressStatus::Completed);
        assert!(address.code_hash.is_none());

        // Replay of the consumed code can never succeed again.
        assert_eq!(
            decide(&mut address, &hash, 5, Utc::now()),
            CodeVerdict::InvalidOrUsed
        );
    }

    #[test]
    fn wrong_code_consumes_attempt() {
        let mut address = challenged_address("123456");
        let wrong = hash_code("000000");

        assert_eq!(decide(&mut address, &wrong, 5, Utc::now()), CodeVerdict::InvalidOrUsed);
        assert_eq!(address.attempts_used, 1);
        assert!(!address.verified);
    }

    #[test]
    fn expired_code_does_not_consume_attempt() {
        let mut address = challenged_address("123456");
        address.code_expires_at = Some(Utc::now() - Duration::minutes(1));
        let hash = hash_code("123456");

        assert_eq!(decide(&mut address, &hash, 5, Utc::now()), CodeVerdict::Expired);
        assert_eq!(address.attempts_used, 0);
        assert!(!address.verified);
    }

    #[test]
    fn attempt_ceiling_blocks_even_correct_codes() {
        let mut address = challenged_address("123456");
        let wrong = hash_code("000000");
        for _ in 0..5 {
            let _ = decide(&mut address, &wrong, 5, Utc::now());
        }
        assert_eq!(address.attempts_used, 5);

        let correct = hash_code("123456");
        assert_eq!(
            decide(&mut address, &correct, 5, Utc::now()),
            CodeVerdict::TooManyAttempts
        );
        assert!(!address.verified);
    }

    #[test]
    fn issue_round_trip_hash_matches_job_code() -> Result<()> {
        let engine = CodeEngine::new();
        let issued = engine.issue(Uuid::new_v4(), "+1234567890", Via::Sms)?;

        let code = issued.job.extract_code().expect("job carries a code");
        let IdentityMutation::IssueChallenge { code_hash, .. } = issued.mutation else {
            panic!("expected challenge mutation");
        };
        assert_eq!(code_hash, hash_code(&code));
        Ok(())
    }

    #[test]
    fn max_attempts_floor_is_one() {
        let engine = CodeEngine::new().with_max_attempts(0);
        assert_eq!(engine.max_attempts(), 1);
    }
}
