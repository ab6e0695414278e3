//! # Fluo (Self-Service Flow Engine)
//!
//! `fluo` is the flow core of a self-service identity system: login,
//! registration, recovery, verification, and settings modeled as one explicit
//! state machine (`ChooseMethod → Sent → PassedChallenge | Failed`) driven by
//! pluggable credential **strategies**.
//!
//! ## Architecture
//!
//! - [`flow::FlowMachine`] owns the lifecycle: CSRF checking, lazy expiry,
//!   terminal-state handling, and the atomic commit of a flow transition
//!   together with its identity mutations.
//! - [`strategy`] holds one module per credential method (password, one-time
//!   code, OIDC, TOTP, WebAuthn/passkey, backup codes). Strategies are pure
//!   with respect to the flow: they return a [`strategy::StrategyOutcome`]
//!   and never write flow state themselves.
//! - [`code::CodeEngine`] issues and verifies hashed one-time codes with
//!   single-use consumption and an attempt ceiling, linearized through the
//!   store's per-address read-modify-write.
//! - [`oidc`] isolates provider protocol quirks (WeChat's GET token exchange
//!   and `errcode`-on-200 included) behind one [`oidc::Provider`] contract.
//! - [`identity::store`] defines the persistence seams; [`store::MemoryStore`]
//!   is the reference implementation used throughout the tests.
//!
//! ## Trust properties
//!
//! Codes are stored only as SHA-256 hashes and compared in constant time; a
//! matched code is irreversibly consumed. Lookups that would reveal whether
//! an address or identifier exists answer uniformly. Upstream provider
//! failures are logged in full server-side and surface to callers as one
//! generic message.

pub mod code;
pub mod courier;
pub mod error;
pub mod flow;
pub mod identity;
pub mod oidc;
pub mod store;
pub mod strategy;
pub mod text;

pub use error::{FlowError, Result, UpstreamError};
pub use flow::{Flow, FlowConfig, FlowMachine, FlowState, FlowType, SubmissionPayload};
pub use identity::{Identity, LinkingHints};
pub use strategy::{Strategy, StrategyOutcome, StrategyRegistry};

/// User agent for outbound provider calls.
pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
