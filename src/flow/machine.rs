//! The flow state machine: create, fetch, and drive flows to completion.
//!
//! `submit` is the single entry point for user input. Its order is fixed:
//! constant-time CSRF check, lazy expiry check, terminal-state handling,
//! strategy dispatch, then one atomic commit of the flow transition plus the
//! strategy's identity mutations. Courier jobs leave only after the commit
//! point. Validation-class strategy failures never surface as errors; they
//! become queued flow messages on an unpersisted snapshot.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::courier::Courier;
use crate::error::{FlowError, Result};
use crate::flow::{Aal, Flow, FlowState, FlowType, SubmissionPayload};
use crate::identity::store::Store;
use crate::strategy::{StrategyOutcome, StrategyRegistry};
use crate::text::Message;

const CSRF_TOKEN_BYTES: usize = 32;
const DEFAULT_FLOW_TTL_MINUTES: i64 = 60;

/// Mint a CSRF token bound to one flow for its lifetime.
#[must_use]
pub fn generate_csrf_token() -> String {
    let mut raw = [0u8; CSRF_TOKEN_BYTES];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

#[derive(Clone, Copy, Debug)]
pub struct FlowConfig {
    pub flow_ttl: Duration,
}

impl FlowConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flow_ttl: Duration::minutes(DEFAULT_FLOW_TTL_MINUTES),
        }
    }

    #[must_use]
    pub fn with_flow_ttl(mut self, ttl: Duration) -> Self {
        self.flow_ttl = ttl;
        self
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FlowMachine {
    store: Arc<dyn Store>,
    registry: StrategyRegistry,
    courier: Arc<dyn Courier>,
    config: FlowConfig,
}

impl FlowMachine {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, registry: StrategyRegistry, courier: Arc<dyn Courier>) -> Self {
        Self {
            store,
            registry,
            courier,
            config: FlowConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }

    /// Allocate and persist a new flow.
    pub async fn create(&self, flow_type: FlowType, requested_aal: Aal) -> Result<Flow> {
        let flow = Flow::new(
            flow_type,
            requested_aal,
            generate_csrf_token(),
            self.config.flow_ttl,
        );
        self.store.insert_flow(flow.clone()).await?;
        info!(flow_id = %flow.id, flow_type = ?flow_type, "created flow");
        Ok(flow)
    }

    /// Fetch a flow. Expiry is checked on access; expired flows are reported
    /// but kept until garbage collection.
    pub async fn get(&self, id: Uuid) -> Result<Flow> {
        let flow = self.store.get_flow(id).await?.ok_or(FlowError::FlowNotFound)?;
        if flow.is_expired(Utc::now()) {
            return Err(FlowError::FlowExpired);
        }
        Ok(flow)
    }

    /// Apply one submission to a flow.
    pub async fn submit(&self, id: Uuid, payload: &SubmissionPayload) -> Result<Flow> {
        let mut flow = self.store.get_flow(id).await?.ok_or(FlowError::FlowNotFound)?;

        // CSRF before anything else, and never a state change on mismatch.
        if !flow.csrf_matches(&payload.csrf_token) {
            return Err(FlowError::CsrfMismatch);
        }
        if flow.is_expired(Utc::now()) {
            return Err(FlowError::FlowExpired);
        }
        match flow.state {
            // A completed flow stays completed; retrying is rejected, not
            // replayed.
            FlowState::PassedChallenge => return Err(FlowError::RetrySuccessAlreadyCompleted),
            // A failed flow is terminal too, but reads back as data.
            FlowState::Failed => {
                flow.set_messages(vec![Message::state_failure()]);
                return Ok(flow);
            }
            FlowState::ChooseMethod | FlowState::Sent => {}
        }

        let strategy = self.registry.resolve(&flow, payload)?;
        debug!(flow_id = %flow.id, method = strategy.name(), "dispatching submission");

        match strategy.execute(&flow, self.store.as_ref(), payload).await {
            Ok(outcome) => self.apply(flow, outcome).await,
            Err(err) if err.is_recoverable() => {
                // Folded into the flow's message queue; the flow itself keeps
                // its persisted state.
                flow.set_messages(vec![recovered_message(&err)]);
                Ok(flow)
            }
            Err(FlowError::UpstreamProvider(upstream)) => {
                // Full detail stays server-side; the caller gets a generic
                // failure and the flow keeps its prior state.
                error!(
                    flow_id = %flow.id,
                    retryable = upstream.is_retryable(),
                    error = %upstream,
                    "upstream provider failure"
                );
                flow.set_messages(vec![Message::system_generic()]);
                Ok(flow)
            }
            Err(err) => Err(err),
        }
    }

    /// Commit a strategy outcome and dispatch its courier jobs.
    async fn apply(&self, mut flow: Flow, outcome: StrategyOutcome) -> Result<Flow> {
        flow.state = outcome.next_state;
        if let Some(active) = outcome.active {
            flow.active = Some(active);
        }
        for (key, value) in outcome.context {
            flow.internal_context.insert(key, value);
        }
        if !outcome.ui_nodes.is_empty() {
            flow.ui_nodes = outcome.ui_nodes;
        }
        flow.set_messages(outcome.messages);

        match self.store.commit(flow.clone(), outcome.mutations).await {
            Ok(()) => {}
            // A concurrent submission finished the flow between our read and
            // this write. Answer exactly as a sequential replay would.
            Err(FlowError::FlowAlreadyTerminal) => {
                let mut persisted = self
                    .store
                    .get_flow(flow.id)
                    .await?
                    .ok_or(FlowError::FlowNotFound)?;
                return match persisted.state {
                    FlowState::Failed => {
                        persisted.set_messages(vec![Message::state_failure()]);
                        Ok(persisted)
                    }
                    _ => Err(FlowError::RetrySuccessAlreadyCompleted),
                };
            }
            Err(err) => return Err(err),
        }

        // Delivery happens strictly after the commit point and never blocks
        // or fails the submission.
        for job in outcome.courier_jobs {
            let courier = Arc::clone(&self.courier);
            let flow_id = flow.id;
            tokio::spawn(async move {
                if let Err(err) = courier.send(job).await {
                    error!(flow_id = %flow_id, error = %err, "courier dispatch failed");
                }
            });
        }

        Ok(flow)
    }

    /// Drop flows whose expiry is older than the retention window.
    pub async fn garbage_collect(&self, retention: Duration) -> Result<usize> {
        self.store.garbage_collect(Utc::now() - retention).await
    }
}

/// Render a recoverable strategy failure as a flow message.
fn recovered_message(err: &FlowError) -> Message {
    match err {
        FlowError::CodeInvalidOrUsed => Message::code_invalid_or_already_used(),
        FlowError::CodeExpired => Message::code_expired(),
        FlowError::TooManyAttempts => Message::too_many_attempts(),
        FlowError::DuplicateCredentials(hints) => {
            Message::duplicate_credentials(hints.available_credential_types.clone())
                .with_context("identifier", json!(hints.identifier))
                .with_context(
                    "available_oidc_providers",
                    json!(hints.available_oidc_providers),
                )
        }
        FlowError::TraitsMismatch => Message::state_failure(),
        FlowError::CaptchaFailed => Message::new(
            crate::text::MessageId::ErrorValidationCaptcha,
            crate::text::MessageKind::Error,
        ),
        FlowError::Validation { field, message } => Message::new(
            crate::text::MessageId::ErrorValidationGeneric,
            crate::text::MessageKind::Error,
        )
        .with_context("field", json!(field))
        .with_context("reason", json!(message)),
        _ => Message::system_generic(),
    }
}
