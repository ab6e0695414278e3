//! In-memory store: the reference implementation of the storage contracts.
//!
//! A single lock backs both maps, which makes the two required guarantees
//! trivial: `commit` is all-or-nothing because mutations are applied to a
//! scratch copy before anything is written back, and `with_address` is a
//! serialized read-modify-write because every caller goes through the same
//! lock. Production deployments swap this for a database-backed store with
//! equivalent transactional semantics.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::code::CodeVerdict;
use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::identity::store::{AddressRmw, FlowStore, IdentityMutation, IdentityStore};
use crate::identity::{AddressStatus, CredentialType, Identity};

#[derive(Debug, Default)]
struct Inner {
    identities: HashMap<Uuid, Identity>,
    flows: HashMap<Uuid, Flow>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| FlowError::Internal(anyhow!("memory store lock poisoned")))
    }
}

fn apply_mutation(identities: &mut HashMap<Uuid, Identity>, mutation: IdentityMutation) -> Result<()> {
    match mutation {
        IdentityMutation::CreateIdentity(identity) => {
            identities.insert(identity.id, identity);
        }
        IdentityMutation::LinkCredential {
            identity_id,
            credential,
        } => {
            let identity = identities
                .get_mut(&identity_id)
                .ok_or(FlowError::IdentityNotFound)?;
            let entry = identity
                .credentials
                .entry(credential.credential_type)
                .or_insert_with(|| crate::identity::Credential {
                    credential_type: credential.credential_type,
                    identifiers: Vec::new(),
                    config: serde_json::Value::Null,
                });
            for identifier in credential.identifiers {
                if !entry.identifiers.contains(&identifier) {
                    entry.identifiers.push(identifier);
                }
            }
            entry.config = credential.config;
        }
        IdentityMutation::IssueChallenge {
            identity_id,
            address,
            code_hash,
            expires_at,
        } => {
            let identity = identities
                .get_mut(&identity_id)
                .ok_or(FlowError::IdentityNotFound)?;
            let address = identity
                .address_mut(&address)
                .ok_or_else(|| FlowError::validation("address", "unknown address"))?;
            address.status = AddressStatus::Sent;
            address.code_hash = Some(code_hash);
            address.code_expires_at = Some(expires_at);
            address.attempts_used = 0;
        }
        IdentityMutation::MarkAddressVerified {
            identity_id,
            address,
        } => {
            let identity = identities
                .get_mut(&identity_id)
                .ok_or(FlowError::IdentityNotFound)?;
            let address = identity
                .address_mut(&address)
                .ok_or_else(|| FlowError::validation("address", "unknown address"))?;
            address.verified = true;
            address.verified_at = Some(Utc::now());
            address.status = AddressStatus::Completed;
        }
        IdentityMutation::SetAddressStatus {
            identity_id,
            address,
            status,
        } => {
            let identity = identities
                .get_mut(&identity_id)
                .ok_or(FlowError::IdentityNotFound)?;
            let address = identity
                .address_mut(&address)
                .ok_or_else(|| FlowError::validation("address", "unknown address"))?;
            address.status = status;
        }
    }
    Ok(())
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn get_identity(&self, id: Uuid) -> Result<Identity> {
        let inner = self.lock()?;
        inner
            .identities
            .get(&id)
            .cloned()
            .ok_or(FlowError::IdentityNotFound)
    }

    async fn create_identity(&self, identity: Identity) -> Result<()> {
        let mut inner = self.lock()?;
        inner.identities.insert(identity.id, identity);
        Ok(())
    }

    async fn find_by_credential_identifier(
        &self,
        credential_type: CredentialType,
        identifier: &str,
    ) -> Result<Option<Identity>> {
        let inner = self.lock()?;
        Ok(inner
            .identities
            .values()
            .find(|identity| {
                identity
                    .credentials
                    .get(&credential_type)
                    .is_some_and(|credential| {
                        credential.identifiers.iter().any(|i| i == identifier)
                    })
            })
            .cloned())
    }

    async fn find_by_address(&self, value: &str) -> Result<Option<Identity>> {
        let inner = self.lock()?;
        Ok(inner
            .identities
            .values()
            .find(|identity| identity.address(value).is_some())
            .cloned())
    }

    async fn mark_address_verified(&self, identity_id: Uuid, address: &str) -> Result<()> {
        let mut inner = self.lock()?;
        apply_mutation(
            &mut inner.identities,
            IdentityMutation::MarkAddressVerified {
                identity_id,
                address: address.to_string(),
            },
        )
    }

    async fn with_address(
        &self,
        identity_id: Uuid,
        address: &str,
        rmw: AddressRmw,
    ) -> Result<CodeVerdict> {
        // The single lock is what linearizes concurrent verify calls.
        let mut inner = self.lock()?;
        let identity = inner
            .identities
            .get_mut(&identity_id)
            .ok_or(FlowError::IdentityNotFound)?;
        let address = identity
            .address_mut(address)
            .ok_or_else(|| FlowError::validation("address", "unknown address"))?;
        Ok(rmw(address))
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn insert_flow(&self, flow: Flow) -> Result<()> {
        let mut inner = self.lock()?;
        inner.flows.insert(flow.id, flow);
        Ok(())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        let inner = self.lock()?;
        Ok(inner.flows.get(&id).cloned())
    }

    async fn commit(&self, flow: Flow, mutations: Vec<IdentityMutation>) -> Result<()> {
        let mut inner = self.lock()?;

        // Terminal states accept no further writes. The check runs under the
        // same lock as the write, so a submission that loaded the flow before
        // a concurrent one finished it cannot commit a stale transition.
        if inner
            .flows
            .get(&flow.id)
            .is_some_and(|stored| stored.state.is_terminal())
        {
            return Err(FlowError::FlowAlreadyTerminal);
        }

        // Apply to a scratch copy first; nothing is written back unless every
        // mutation succeeds.
        let mut identities = inner.identities.clone();
        for mutation in mutations {
            apply_mutation(&mut identities, mutation)
                .context("failed to apply identity mutation")?;
        }

        inner.identities = identities;
        inner.flows.insert(flow.id, flow);
        Ok(())
    }

    async fn garbage_collect(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.flows.len();
        inner.flows.retain(|_, flow| flow.expires_at >= older_than);
        Ok(before - inner.flows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::code::{CodeEngine, CodeVerdict};
    use crate::error::FlowError;
    use crate::flow::{Aal, Flow, FlowState, FlowType};
    use crate::identity::store::{FlowStore, IdentityMutation, IdentityStore};
    use crate::identity::{AddressStatus, Identity, VerifiableAddress, Via};
    use anyhow::Result;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn identity_with_phone() -> Identity {
        Identity::new(json!({"phone": "+1234567890"}))
            .with_address(VerifiableAddress::new("+1234567890", Via::Sms))
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() -> Result<()> {
        let store = MemoryStore::new();
        let identity = identity_with_phone();
        let identity_id = identity.id;
        store.create_identity(identity).await?;

        let flow = Flow::new(
            FlowType::Verification,
            Aal::Aal1,
            "csrf".to_string(),
            Duration::minutes(10),
        );
        let flow_id = flow.id;

        // Second mutation targets a missing identity, so the whole commit
        // must be rejected: no flow persisted, first mutation rolled back.
        let result = store
            .commit(
                flow,
                vec![
                    IdentityMutation::MarkAddressVerified {
                        identity_id,
                        address: "+1234567890".to_string(),
                    },
                    IdentityMutation::MarkAddressVerified {
                        identity_id: Uuid::new_v4(),
                        address: "+1234567890".to_string(),
                    },
                ],
            )
            .await;
        assert!(result.is_err());

        assert!(store.get_flow(flow_id).await?.is_none());
        let identity = store.get_identity(identity_id).await?;
        let address = identity.address("+1234567890").expect("address exists");
        assert!(!address.verified);
        Ok(())
    }

    #[tokio::test]
    async fn commit_rejects_writes_to_terminal_flows() -> Result<()> {
        let store = MemoryStore::new();
        let mut flow = Flow::new(
            FlowType::Verification,
            Aal::Aal1,
            "csrf".to_string(),
            Duration::minutes(10),
        );
        flow.state = FlowState::PassedChallenge;
        store.insert_flow(flow.clone()).await?;

        // A transition loaded before the flow completed must not land.
        let mut stale = flow.clone();
        stale.state = FlowState::Sent;
        let result = store.commit(stale, Vec::new()).await;
        assert!(matches!(result, Err(FlowError::FlowAlreadyTerminal)));

        let stored = store.get_flow(flow.id).await?.expect("flow persisted");
        assert_eq!(stored.state, FlowState::PassedChallenge);
        Ok(())
    }

    #[tokio::test]
    async fn issue_challenge_resets_attempts() -> Result<()> {
        let store = MemoryStore::new();
        let mut identity = identity_with_phone();
        identity.verifiable_addresses[0].attempts_used = 3;
        let identity_id = identity.id;
        store.create_identity(identity).await?;

        let engine = CodeEngine::new();
        let issued = engine.issue(identity_id, "+1234567890", Via::Sms)?;
        let flow = Flow::new(
            FlowType::Verification,
            Aal::Aal1,
            "csrf".to_string(),
            Duration::minutes(10),
        );
        store.commit(flow, vec![issued.mutation]).await?;

        let identity = store.get_identity(identity_id).await?;
        let address = identity.address("+1234567890").expect("address exists");
        assert_eq!(address.status, AddressStatus::Sent);
        assert_eq!(address.attempts_used, 0);
        assert!(address.code_hash.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_verifies_yield_exactly_one_success() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let identity = identity_with_phone();
        let identity_id = identity.id;
        store.create_identity(identity).await?;

        // High attempt budget so losers fail on consumption, not the ceiling.
        let engine = Arc::new(CodeEngine::new().with_max_attempts(64));
        let issued = engine.issue(identity_id, "+1234567890", Via::Sms)?;
        let code = issued.job.extract_code().expect("code in job");
        let flow = Flow::new(
            FlowType::Verification,
            Aal::Aal1,
            "csrf".to_string(),
            Duration::minutes(10),
        );
        store.commit(flow, vec![issued.mutation]).await?;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let engine = Arc::clone(&engine);
            let code = code.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .verify(store.as_ref(), identity_id, "+1234567890", &code)
                    .await
            }));
        }

        let mut successes = 0;
        let mut invalid = 0;
        for handle in handles {
            match handle.await.expect("task completed")? {
                CodeVerdict::Success => successes += 1,
                CodeVerdict::InvalidOrUsed => invalid += 1,
                other => panic!("unexpected verdict: {other:?}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(invalid, 15);
        Ok(())
    }

    #[tokio::test]
    async fn garbage_collect_removes_expired_flows() -> Result<()> {
        let store = MemoryStore::new();
        let dead = Flow::new(
            FlowType::Login,
            Aal::Aal1,
            "csrf".to_string(),
            Duration::seconds(1),
        );
        let alive = Flow::new(
            FlowType::Login,
            Aal::Aal1,
            "csrf".to_string(),
            Duration::hours(1),
        );
        let dead_id = dead.id;
        let alive_id = alive.id;
        store.insert_flow(dead).await?;
        store.insert_flow(alive).await?;

        let removed = store
            .garbage_collect(chrono::Utc::now() + Duration::minutes(5))
            .await?;
        assert_eq!(removed, 1);
        assert!(store.get_flow(dead_id).await?.is_none());
        assert!(store.get_flow(alive_id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn missing_identity_is_reported() {
        let store = MemoryStore::new();
        let result = store.get_identity(Uuid::new_v4()).await;
        assert!(matches!(result, Err(FlowError::IdentityNotFound)));
    }
}
