//! Credential strategies and the dispatch registry.
//!
//! Each strategy implements one authentication method over a subset of the
//! flow types. Strategies are pure with respect to the flow object: they
//! return a [`StrategyOutcome`] describing the proposed transition and its
//! side effects, and the state machine applies everything under one commit.
//! The single exception is the code engine's verify step, which consumes
//! attempts and codes through the store's atomic per-address read-modify-write
//! (a matched code must stay consumed even if the surrounding flow fails).

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::courier::CourierJob;
use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowState, FlowType, SubmissionPayload, UiNode};
use crate::identity::store::{IdentityMutation, IdentityStore};
use crate::identity::infer_via;
use crate::text::Message;

pub mod code;
pub mod lookup_secret;
pub mod oidc;
pub mod password;
pub mod totp;
pub mod webauthn;

pub use code::CodeStrategy;
pub use lookup_secret::LookupSecretStrategy;
pub use oidc::OidcStrategy;
pub use password::PasswordStrategy;
pub use totp::TotpStrategy;
pub use webauthn::{AssertionVerifier, PasskeyStrategy, WebauthnStrategy};

/// A strategy's proposed transition plus the side effects to apply with it.
#[derive(Debug)]
pub struct StrategyOutcome {
    pub next_state: FlowState,
    /// Strategy group to record as the flow's active method.
    pub active: Option<String>,
    pub mutations: Vec<IdentityMutation>,
    pub courier_jobs: Vec<CourierJob>,
    pub messages: Vec<Message>,
    pub ui_nodes: Vec<UiNode>,
    /// Entries merged into the flow's strategy-private context.
    pub context: Map<String, Value>,
}

impl StrategyOutcome {
    #[must_use]
    pub fn transition(next_state: FlowState) -> Self {
        Self {
            next_state,
            active: None,
            mutations: Vec::new(),
            courier_jobs: Vec::new(),
            messages: Vec::new(),
            ui_nodes: Vec::new(),
            context: Map::new(),
        }
    }

    #[must_use]
    pub fn with_active(mut self, active: &str) -> Self {
        self.active = Some(active.to_string());
        self
    }

    #[must_use]
    pub fn with_mutation(mut self, mutation: IdentityMutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    #[must_use]
    pub fn with_job(mut self, job: CourierJob) -> Self {
        self.courier_jobs.push(job);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    #[must_use]
    pub fn with_node(mut self, node: UiNode) -> Self {
        self.ui_nodes.push(node);
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

/// One pluggable credential strategy.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Registry name matched against the payload's `method` field.
    fn name(&self) -> &'static str;

    /// Which flow types this strategy can answer.
    fn supports(&self, flow_type: FlowType) -> bool;

    async fn execute(
        &self,
        flow: &Flow,
        store: &dyn IdentityStore,
        payload: &SubmissionPayload,
    ) -> Result<StrategyOutcome>;
}

/// Explicit name-to-implementation mapping, built once at startup.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    by_name: HashMap<&'static str, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.by_name.insert(strategy.name(), strategy);
        self
    }

    /// Select the strategy for a submission.
    ///
    /// The payload's `method` field wins; for recovery and verification flows
    /// a submission that carries an address instead of a method falls through
    /// to the code strategy (the address shape fixes the channel).
    pub fn resolve(
        &self,
        flow: &Flow,
        payload: &SubmissionPayload,
    ) -> Result<Arc<dyn Strategy>> {
        let method = match payload.method.as_deref() {
            Some(method) => method.to_string(),
            None => self
                .infer_method(flow, payload)
                .ok_or_else(|| FlowError::NoStrategyFound("<none>".to_string()))?,
        };

        let strategy = self
            .by_name
            .get(method.as_str())
            .ok_or_else(|| FlowError::NoStrategyFound(method.clone()))?;
        if !strategy.supports(flow.flow_type) {
            return Err(FlowError::NoStrategyFound(method));
        }
        Ok(Arc::clone(strategy))
    }

    fn infer_method(&self, flow: &Flow, payload: &SubmissionPayload) -> Option<String> {
        if !matches!(flow.flow_type, FlowType::Recovery | FlowType::Verification) {
            return None;
        }
        let address = payload
            .field("email")
            .or_else(|| payload.field("phone"))
            .or_else(|| payload.field("address"))?;
        infer_via(address.trim()).map(|_| "code".to_string())
    }
}
