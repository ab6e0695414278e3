//! Storage contracts for identities and flows.
//!
//! Persistence internals live behind these traits. The engine requires two
//! atomicity guarantees from any implementation: [`FlowStore::commit`] applies
//! a flow transition together with its identity mutations all-or-nothing, and
//! [`IdentityStore::with_address`] runs a closure as a single read-modify-write
//! over one verifiable address (the code engine's linearization point).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::code::CodeVerdict;
use crate::error::Result;
use crate::flow::Flow;
use crate::identity::{AddressStatus, Credential, CredentialType, Identity, VerifiableAddress};

/// A mutation the state machine applies atomically with a flow transition.
/// Strategies return these instead of touching stores directly.
#[derive(Debug)]
pub enum IdentityMutation {
    CreateIdentity(Identity),
    LinkCredential {
        identity_id: Uuid,
        credential: Credential,
    },
    /// Store a fresh challenge on an address: status `Sent`, new code hash,
    /// new expiry, attempts reset. Replaces any previous active code.
    IssueChallenge {
        identity_id: Uuid,
        address: String,
        code_hash: Vec<u8>,
        expires_at: DateTime<Utc>,
    },
    MarkAddressVerified {
        identity_id: Uuid,
        address: String,
    },
    SetAddressStatus {
        identity_id: Uuid,
        address: String,
        status: AddressStatus,
    },
}

/// Atomic decision run against one address under the store's lock.
pub type AddressRmw = Box<dyn FnOnce(&mut VerifiableAddress) -> CodeVerdict + Send>;

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_identity(&self, id: Uuid) -> Result<Identity>;

    async fn create_identity(&self, identity: Identity) -> Result<()>;

    /// Find the identity owning `identifier` for the given credential type.
    async fn find_by_credential_identifier(
        &self,
        credential_type: CredentialType,
        identifier: &str,
    ) -> Result<Option<Identity>>;

    /// Find the identity owning a verifiable address with this value.
    async fn find_by_address(&self, value: &str) -> Result<Option<Identity>>;

    async fn mark_address_verified(&self, identity_id: Uuid, address: &str) -> Result<()>;

    /// Run `rmw` against the address as one atomic read-modify-write.
    ///
    /// Concurrent calls against the same address must be serialized so that
    /// attempt counting and code consumption linearize.
    async fn with_address(
        &self,
        identity_id: Uuid,
        address: &str,
        rmw: AddressRmw,
    ) -> Result<CodeVerdict>;
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn insert_flow(&self, flow: Flow) -> Result<()>;

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>>;

    /// Persist the flow transition and apply all identity mutations as one
    /// transaction. Partial application is disallowed: on error the flow and
    /// all identities keep their prior state.
    ///
    /// Terminal flow states are immutable at this boundary: when the persisted
    /// flow is already in a terminal state the write must be rejected with
    /// [`crate::error::FlowError::FlowAlreadyTerminal`], under the same isolation as the
    /// write itself, so a racing submission cannot reopen a finished flow.
    async fn commit(&self, flow: Flow, mutations: Vec<IdentityMutation>) -> Result<()>;

    /// Delete flows past their expiry retention window.
    async fn garbage_collect(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

/// Combined storage backend consumed by the state machine.
pub trait Store: IdentityStore + FlowStore {}

impl<T: IdentityStore + FlowStore> Store for T {}
