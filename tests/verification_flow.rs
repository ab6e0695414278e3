//! End-to-end flow scenarios through the public API: machine, registry,
//! code strategy, store, and courier wired together the way a service would.

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use serde_json::json;

use fluo::code::CodeEngine;
use fluo::courier::RecordingCourier;
use fluo::flow::{Aal, FlowConfig, FlowMachine, FlowState, FlowType, SubmissionPayload};
use fluo::identity::store::{FlowStore, IdentityStore};
use fluo::identity::{AddressStatus, Identity, VerifiableAddress, Via};
use fluo::store::MemoryStore;
use fluo::strategy::{CodeStrategy, StrategyRegistry};
use fluo::text::MessageId;
use fluo::FlowError;

const PHONE: &str = "+1234567890";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

struct Harness {
    machine: FlowMachine,
    store: Arc<MemoryStore>,
    courier: Arc<RecordingCourier>,
    identity: Identity,
}

async fn harness_with_engine(engine: CodeEngine) -> Result<Harness> {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let courier = Arc::new(RecordingCourier::new());

    let identity = Identity::new(json!({ "phone": PHONE }))
        .with_address(VerifiableAddress::new(PHONE, Via::Sms));
    store.create_identity(identity.clone()).await?;

    let registry = StrategyRegistry::new().register(Arc::new(CodeStrategy::new(engine)));
    let machine = FlowMachine::new(store.clone(), registry, courier.clone());
    Ok(Harness {
        machine,
        store,
        courier,
        identity,
    })
}

async fn harness() -> Result<Harness> {
    harness_with_engine(CodeEngine::new()).await
}

/// The courier dispatch is spawned; yield until it lands.
async fn delivered_code(courier: &RecordingCourier, address: &str) -> Option<String> {
    for _ in 0..100 {
        if let Some(job) = courier.last_for(address) {
            return job.extract_code();
        }
        tokio::task::yield_now().await;
    }
    None
}

#[tokio::test]
async fn phone_verification_end_to_end() -> Result<()> {
    let h = harness().await?;
    let flow = h.machine.create(FlowType::Verification, Aal::Aal1).await?;
    assert_eq!(flow.state, FlowState::ChooseMethod);

    // Ask for a challenge; the method is inferred from the address shape.
    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token).with_field("phone", PHONE);
    let flow_snapshot = h.machine.submit(flow.id, &payload).await?;
    assert_eq!(flow_snapshot.state, FlowState::Sent);
    assert_eq!(flow_snapshot.active.as_deref(), Some("code"));
    assert_eq!(
        flow_snapshot.messages.first().map(|m| m.id),
        Some(MessageId::InfoSelfServiceVerificationCodeSent)
    );

    let code = delivered_code(&h.courier, PHONE)
        .await
        .expect("courier delivered the challenge");
    assert_eq!(code.len(), 6);
    assert!(code.bytes().all(|b| b.is_ascii_digit()));

    // A wrong guess keeps the challenge open.
    let wrong = if code == "000000" { "000001" } else { "000000" };
    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token)
        .with_method("code")
        .with_field("code", wrong);
    let flow_snapshot = h.machine.submit(flow.id, &payload).await?;
    assert_eq!(flow_snapshot.state, FlowState::Sent);
    assert_eq!(
        flow_snapshot.messages.first().map(|m| m.id),
        Some(MessageId::ErrorValidationCodeInvalidOrAlreadyUsed)
    );

    // The right code completes the flow and the address.
    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token)
        .with_method("code")
        .with_field("code", code.as_str());
    let flow_snapshot = h.machine.submit(flow.id, &payload).await?;
    assert_eq!(flow_snapshot.state, FlowState::PassedChallenge);
    assert_eq!(
        flow_snapshot.messages.first().map(|m| m.id),
        Some(MessageId::InfoSelfServiceVerificationSuccessful)
    );

    let identity = h.store.get_identity(h.identity.id).await?;
    let address = identity.address(PHONE).expect("address present");
    assert!(address.verified);
    assert_eq!(address.status, AddressStatus::Completed);
    assert!(address.verified_at.is_some());

    // The consumed code is gone for good.
    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token)
        .with_method("code")
        .with_field("code", code.as_str());
    let err = h
        .machine
        .submit(flow.id, &payload)
        .await
        .expect_err("completed flows reject retries");
    assert!(matches!(err, FlowError::RetrySuccessAlreadyCompleted));
    Ok(())
}

#[tokio::test]
async fn csrf_mismatch_changes_nothing() -> Result<()> {
    let h = harness().await?;
    let flow = h.machine.create(FlowType::Verification, Aal::Aal1).await?;

    let payload = SubmissionPayload::new(flow.id, "forged-token").with_field("phone", PHONE);
    let err = h
        .machine
        .submit(flow.id, &payload)
        .await
        .expect_err("forged csrf token");
    assert!(matches!(err, FlowError::CsrfMismatch));

    let stored = h.store.get_flow(flow.id).await?.expect("flow kept");
    assert_eq!(stored.state, FlowState::ChooseMethod);
    assert!(h.courier.jobs().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_address_is_indistinguishable_from_known() -> Result<()> {
    let h = harness().await?;
    let flow = h.machine.create(FlowType::Verification, Aal::Aal1).await?;

    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token)
        .with_field("phone", "+19998887766");
    let flow_snapshot = h.machine.submit(flow.id, &payload).await?;

    // Same state and message as the known-address path.
    assert_eq!(flow_snapshot.state, FlowState::Sent);
    assert_eq!(
        flow_snapshot.messages.first().map(|m| m.id),
        Some(MessageId::InfoSelfServiceVerificationCodeSent)
    );

    // But no challenge exists, so every code fails as invalid.
    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token)
        .with_method("code")
        .with_field("code", "123456");
    let flow_snapshot = h.machine.submit(flow.id, &payload).await?;
    assert_eq!(flow_snapshot.state, FlowState::Sent);
    assert_eq!(
        flow_snapshot.messages.first().map(|m| m.id),
        Some(MessageId::ErrorValidationCodeInvalidOrAlreadyUsed)
    );
    assert!(h.courier.jobs().is_empty());
    Ok(())
}

#[tokio::test]
async fn attempt_ceiling_fails_the_flow_terminally() -> Result<()> {
    let h = harness_with_engine(CodeEngine::new().with_max_attempts(2)).await?;
    let flow = h.machine.create(FlowType::Verification, Aal::Aal1).await?;

    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token).with_field("phone", PHONE);
    h.machine.submit(flow.id, &payload).await?;
    let code = delivered_code(&h.courier, PHONE)
        .await
        .expect("courier delivered the challenge");
    let wrong = if code == "000000" { "000001" } else { "000000" };

    for _ in 0..2 {
        let payload = SubmissionPayload::new(flow.id, &flow.csrf_token)
            .with_method("code")
            .with_field("code", wrong);
        let snapshot = h.machine.submit(flow.id, &payload).await?;
        assert_eq!(snapshot.state, FlowState::Sent);
    }

    // The ceiling is spent; even the right code fails the flow now.
    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token)
        .with_method("code")
        .with_field("code", code.as_str());
    let snapshot = h.machine.submit(flow.id, &payload).await?;
    assert_eq!(snapshot.state, FlowState::Failed);
    assert_eq!(
        snapshot.messages.first().map(|m| m.id),
        Some(MessageId::ErrorValidationTooManyAttempts)
    );

    // Failed is terminal: further submissions read back as data.
    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token)
        .with_method("code")
        .with_field("code", code.as_str());
    let snapshot = h.machine.submit(flow.id, &payload).await?;
    assert_eq!(snapshot.state, FlowState::Failed);
    assert_eq!(
        snapshot.messages.first().map(|m| m.id),
        Some(MessageId::ErrorValidationStateFailure)
    );

    // The abandoned challenge is cleared: the address drops back to Pending
    // and stays unverified.
    let identity = h.store.get_identity(h.identity.id).await?;
    let address = identity.address(PHONE).expect("address present");
    assert!(!address.verified);
    assert_eq!(address.status, AddressStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn expired_flow_is_rejected_lazily() -> Result<()> {
    let h = harness().await?;
    let machine = FlowMachine::new(
        h.store.clone(),
        StrategyRegistry::new().register(Arc::new(CodeStrategy::new(CodeEngine::new()))),
        h.courier.clone(),
    )
    .with_config(FlowConfig::new().with_flow_ttl(Duration::seconds(1)));

    let flow = machine.create(FlowType::Recovery, Aal::Aal1).await?;
    let mut expired = flow.clone();
    expired.expires_at = expired.issued_at - Duration::seconds(1);
    h.store.insert_flow(expired).await?;

    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token).with_field("phone", PHONE);
    let err = machine
        .submit(flow.id, &payload)
        .await
        .expect_err("expired flow");
    assert!(matches!(err, FlowError::FlowExpired));
    assert!(h.store.get_flow(flow.id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn recovery_flow_masks_the_address_in_its_message() -> Result<()> {
    let h = harness().await?;
    let flow = h.machine.create(FlowType::Recovery, Aal::Aal1).await?;

    let payload = SubmissionPayload::new(flow.id, &flow.csrf_token).with_field("phone", PHONE);
    let snapshot = h.machine.submit(flow.id, &payload).await?;
    assert_eq!(snapshot.state, FlowState::Sent);

    let message = snapshot.messages.first().expect("sent message");
    assert_eq!(message.id, MessageId::InfoSelfServiceRecoveryMaskedCodeSent);
    let masked = message
        .context
        .get("masked_address")
        .and_then(|v| v.as_str())
        .expect("masked address in context");
    assert!(masked.ends_with("7890"));
    assert!(!masked.contains("+1234567890"));
    Ok(())
}
