//! One-time-code strategy (OTP via email/SMS) for verification, recovery,
//! registration, and MFA login flows.
//!
//! Two submission shapes reach this strategy: an address (start or restart a
//! challenge) and a code (answer the active challenge). Challenge issuance is
//! returned as a mutation and committed with the flow transition; code
//! consumption happens inside the code engine's atomic verify so a matched
//! code stays consumed no matter what the flow does afterwards.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::code::{CodeEngine, CodeVerdict};
use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowState, FlowType, SubmissionPayload, UiNode};
use crate::identity::store::{IdentityMutation, IdentityStore};
use crate::identity::{infer_via, normalize_address, AddressStatus};
use crate::strategy::{Strategy, StrategyOutcome};
use crate::text::{mask_address, Message};

const CONTEXT_IDENTITY: &str = "code.identity_id";
const CONTEXT_ADDRESS: &str = "code.address";

pub struct CodeStrategy {
    engine: CodeEngine,
}

impl CodeStrategy {
    #[must_use]
    pub fn new(engine: CodeEngine) -> Self {
        Self { engine }
    }

    fn sent_message(flow_type: FlowType, address: &str) -> Message {
        match flow_type {
            FlowType::Recovery => Message::recovery_code_sent(&mask_address(address)),
            _ => Message::verification_code_sent(),
        }
    }

    fn success_message(flow_type: FlowType) -> Message {
        match flow_type {
            FlowType::Recovery => Message::recovery_successful(),
            _ => Message::verification_successful(),
        }
    }

    async fn start_challenge(
        &self,
        flow: &Flow,
        store: &dyn IdentityStore,
        address: &str,
    ) -> Result<StrategyOutcome> {
        let address = normalize_address(address);
        let via = infer_via(&address)
            .ok_or_else(|| FlowError::validation("address", "not a valid email or phone number"))?;

        let outcome = StrategyOutcome::transition(FlowState::Sent)
            .with_active(self.name())
            .with_message(Self::sent_message(flow.flow_type, &address))
            .with_node(UiNode::input("code", "code"));

        let Some(identity) = store.find_by_address(&address).await? else {
            // Unknown addresses get the same response as known ones so the
            // flow cannot be used to probe for accounts. No challenge exists,
            // so any submitted code will fail as invalid.
            debug!(flow = %flow.id, "challenge requested for unknown address");
            return Ok(outcome.with_context(CONTEXT_ADDRESS, json!(address)));
        };

        let issued = self.engine.issue(identity.id, &address, via)?;
        Ok(outcome
            .with_mutation(issued.mutation)
            .with_job(issued.job)
            .with_context(CONTEXT_IDENTITY, json!(identity.id.to_string()))
            .with_context(CONTEXT_ADDRESS, json!(address)))
    }

    async fn answer_challenge(
        &self,
        flow: &Flow,
        store: &dyn IdentityStore,
        code: &str,
    ) -> Result<StrategyOutcome> {
        let Some(address) = flow.context_str(CONTEXT_ADDRESS) else {
            return Err(FlowError::validation("code", "no challenge was issued"));
        };
        let identity_id = flow
            .context_str(CONTEXT_IDENTITY)
            .and_then(|raw| Uuid::parse_str(raw).ok());

        // The anti-enumeration path issued no challenge; fail the same way a
        // wrong code does.
        let Some(identity_id) = identity_id else {
            return Ok(StrategyOutcome::transition(flow.state)
                .with_active(self.name())
                .with_message(Message::code_invalid_or_already_used())
                .with_node(UiNode::input("code", "code")));
        };

        let verdict = self.engine.verify(store, identity_id, address, code).await?;
        let outcome = match verdict {
            CodeVerdict::Success => StrategyOutcome::transition(FlowState::PassedChallenge)
                .with_message(Self::success_message(flow.flow_type)),
            CodeVerdict::InvalidOrUsed => StrategyOutcome::transition(flow.state)
                .with_message(Message::code_invalid_or_already_used())
                .with_node(UiNode::input("code", "code")),
            CodeVerdict::Expired => StrategyOutcome::transition(flow.state)
                .with_message(Message::code_expired())
                .with_node(UiNode::input("code", "code")),
            // Terminal: the whole flow fails and the abandoned challenge
            // returns the address to its pre-challenge lifecycle state.
            CodeVerdict::TooManyAttempts => StrategyOutcome::transition(FlowState::Failed)
                .with_message(Message::too_many_attempts())
                .with_mutation(IdentityMutation::SetAddressStatus {
                    identity_id,
                    address: address.to_string(),
                    status: AddressStatus::Pending,
                }),
        };
        Ok(outcome.with_active(self.name()))
    }
}

#[async_trait]
impl Strategy for CodeStrategy {
    fn name(&self) -> &'static str {
        "code"
    }

    fn supports(&self, flow_type: FlowType) -> bool {
        matches!(
            flow_type,
            FlowType::Verification | FlowType::Recovery | FlowType::Login | FlowType::Registration
        )
    }

    async fn execute(
        &self,
        flow: &Flow,
        store: &dyn IdentityStore,
        payload: &SubmissionPayload,
    ) -> Result<StrategyOutcome> {
        if let Some(code) = payload.field("code") {
            return self.answer_challenge(flow, store, code).await;
        }
        if let Some(address) = payload
            .field("email")
            .or_else(|| payload.field("phone"))
            .or_else(|| payload.field("address"))
        {
            return self.start_challenge(flow, store, address).await;
        }
        Err(FlowError::validation(
            "method",
            "submission carries neither an address nor a code",
        ))
    }
}
