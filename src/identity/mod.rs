//! Identity model: principals, their credentials, and verifiable addresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod store;

pub use store::{FlowStore, IdentityStore, Store};

/// Credential types bound to an identity. `identifiers` of types with global
/// uniqueness (password, code, webauthn) may belong to at most one identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    Password,
    Oidc,
    Webauthn,
    Passkey,
    Code,
    Totp,
    LookupSecret,
}

impl CredentialType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Oidc => "oidc",
            Self::Webauthn => "webauthn",
            Self::Passkey => "passkey",
            Self::Code => "code",
            Self::Totp => "totp",
            Self::LookupSecret => "lookup_secret",
        }
    }

    /// Types whose identifiers must be unique across all identities.
    #[must_use]
    pub fn requires_unique_identifiers(self) -> bool {
        matches!(self, Self::Password | Self::Oidc | Self::Code | Self::Webauthn | Self::Passkey)
    }
}

/// One credential: its identifiers plus an opaque configuration blob the
/// engine stores but does not interpret (hashes, COSE keys, encrypted seeds).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    pub identifiers: Vec<String>,
    pub config: Value,
}

impl Credential {
    #[must_use]
    pub fn new(credential_type: CredentialType, identifiers: Vec<String>, config: Value) -> Self {
        Self {
            credential_type,
            identifiers,
            config,
        }
    }
}

/// Delivery channel for a verifiable address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Via {
    Email,
    Sms,
}

/// Verification lifecycle of an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressStatus {
    Pending,
    Sent,
    Completed,
}

/// A contactable address with an independent verification lifecycle.
///
/// Only the code hash is ever stored; the clear code goes to the courier.
/// `verified == true` implies `status == Completed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifiableAddress {
    pub value: String,
    pub via: Via,
    pub status: AddressStatus,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub code_hash: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_expires_at: Option<DateTime<Utc>>,
    pub attempts_used: u32,
}

impl VerifiableAddress {
    #[must_use]
    pub fn new(value: impl Into<String>, via: Via) -> Self {
        Self {
            value: value.into(),
            via,
            status: AddressStatus::Pending,
            verified: false,
            verified_at: None,
            code_hash: None,
            code_expires_at: None,
            attempts_used: 0,
        }
    }
}

/// A persisted principal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    /// Schema-validated structured data (email, phone, display name).
    pub traits: Value,
    pub credentials: BTreeMap<CredentialType, Credential>,
    pub verifiable_addresses: Vec<VerifiableAddress>,
}

impl Identity {
    #[must_use]
    pub fn new(traits: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            traits,
            credentials: BTreeMap::new(),
            verifiable_addresses: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: VerifiableAddress) -> Self {
        self.verifiable_addresses.push(address);
        self
    }

    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credentials.insert(credential.credential_type, credential);
        self
    }

    #[must_use]
    pub fn address(&self, value: &str) -> Option<&VerifiableAddress> {
        self.verifiable_addresses
            .iter()
            .find(|address| address.value == value)
    }

    pub fn address_mut(&mut self, value: &str) -> Option<&mut VerifiableAddress> {
        self.verifiable_addresses
            .iter_mut()
            .find(|address| address.value == value)
    }

    /// Which methods the identity can still authenticate with. Used to build
    /// [`LinkingHints`] when an identifier collides with this identity.
    #[must_use]
    pub fn available_methods(&self) -> Vec<String> {
        self.credentials
            .values()
            .map(|credential| credential.credential_type.as_str().to_string())
            .collect()
    }

    /// OIDC providers already bound to this identity, read from the oidc
    /// credential's identifiers (`provider:subject`).
    #[must_use]
    pub fn linked_oidc_providers(&self) -> Vec<String> {
        self.credentials
            .get(&CredentialType::Oidc)
            .map(|credential| {
                credential
                    .identifiers
                    .iter()
                    .filter_map(|identifier| identifier.split_once(':'))
                    .map(|(provider, _)| provider.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Data surfaced on an identifier collision so the caller can prompt a
/// link-then-merge flow. Accounts are never merged automatically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkingHints {
    pub identifier: String,
    pub available_credential_types: Vec<String>,
    pub available_oidc_providers: Vec<String>,
}

impl LinkingHints {
    #[must_use]
    pub fn for_identity(identifier: impl Into<String>, identity: &Identity) -> Self {
        Self {
            identifier: identifier.into(),
            available_credential_types: identity.available_methods(),
            available_oidc_providers: identity.linked_oidc_providers(),
        }
    }
}

/// Normalize an address for lookup/uniqueness checks.
#[must_use]
pub fn normalize_address(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
#[must_use]
pub fn valid_email(value: &str) -> bool {
    use once_cell::sync::Lazy;
    static EMAIL: Lazy<regex::Regex> =
        Lazy::new(|| regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap_or_else(|_| unreachable!()));
    EMAIL.is_match(value)
}

/// Loose E.164-ish phone check: leading `+` plus 7..=15 digits.
#[must_use]
pub fn valid_phone(value: &str) -> bool {
    let Some(rest) = value.strip_prefix('+') else {
        return false;
    };
    (7..=15).contains(&rest.len()) && rest.bytes().all(|b| b.is_ascii_digit())
}

/// Infer the delivery channel from the shape of the address.
#[must_use]
pub fn infer_via(value: &str) -> Option<Via> {
    if valid_email(value) {
        Some(Via::Email)
    } else if valid_phone(value) {
        Some(Via::Sms)
    } else {
        None
    }
}
