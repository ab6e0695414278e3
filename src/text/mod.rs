//! Typed flow messages and the localized message catalog.
//!
//! The engine never formats user-facing copy itself: strategies and the state
//! machine queue `(MessageId, params)` pairs on the flow, and callers render
//! them through [`render`]. The catalog is an immutable process-wide table
//! built once at startup; changing copy never touches flow logic.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Severity of a queued flow message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Info,
    Success,
    Error,
}

/// Stable numeric message identifiers.
///
/// Ranges follow the original system: `10xxxxx` informational per flow type,
/// `40xxxxx` validation errors, `50xxxxx` system errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageId {
    InfoSelfServiceVerificationSuccessful = 1_080_002,
    InfoSelfServiceVerificationCodeSent = 1_080_003,
    InfoSelfServiceRecoverySuccessful = 1_060_001,
    InfoSelfServiceRecoveryCodeSent = 1_060_003,
    InfoSelfServiceRecoveryMaskedCodeSent = 1_060_007,
    InfoSelfServiceLoginWebauthn = 1_010_008,
    ErrorValidationGeneric = 4_000_001,
    ErrorValidationDuplicateCredentials = 4_000_007,
    ErrorValidationTotpVerifierWrong = 4_000_008,
    ErrorValidationLookupInvalid = 4_000_012,
    ErrorValidationFlowExpired = 4_000_015,
    ErrorValidationInvalidCredentials = 4_000_006,
    ErrorValidationCodeInvalidOrAlreadyUsed = 4_060_006,
    ErrorValidationCodeExpired = 4_060_005,
    ErrorValidationRetrySuccess = 4_060_004,
    ErrorValidationStateFailure = 4_060_001,
    ErrorValidationTooManyAttempts = 4_060_008,
    ErrorValidationCaptcha = 4_000_016,
    ErrorSystemGeneric = 5_000_001,
}

/// One queued flow message: an identifier plus context parameters.
///
/// `context` carries machine-readable values (expiry timestamps, masked
/// addresses) so callers can render richer UIs than the plain text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl Message {
    #[must_use]
    pub fn new(id: MessageId, kind: MessageKind) -> Self {
        Self {
            id,
            kind,
            context: Map::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn verification_successful() -> Self {
        Self::new(
            MessageId::InfoSelfServiceVerificationSuccessful,
            MessageKind::Success,
        )
    }

    #[must_use]
    pub fn verification_code_sent() -> Self {
        Self::new(
            MessageId::InfoSelfServiceVerificationCodeSent,
            MessageKind::Info,
        )
    }

    #[must_use]
    pub fn recovery_successful() -> Self {
        Self::new(MessageId::InfoSelfServiceRecoverySuccessful, MessageKind::Success)
    }

    #[must_use]
    pub fn recovery_code_sent(masked_address: &str) -> Self {
        Self::new(
            MessageId::InfoSelfServiceRecoveryMaskedCodeSent,
            MessageKind::Info,
        )
        .with_context("masked_address", masked_address)
    }

    #[must_use]
    pub fn code_invalid_or_already_used() -> Self {
        Self::new(
            MessageId::ErrorValidationCodeInvalidOrAlreadyUsed,
            MessageKind::Error,
        )
    }

    #[must_use]
    pub fn code_expired() -> Self {
        Self::new(MessageId::ErrorValidationCodeExpired, MessageKind::Error)
    }

    #[must_use]
    pub fn invalid_credentials() -> Self {
        Self::new(MessageId::ErrorValidationInvalidCredentials, MessageKind::Error)
    }

    #[must_use]
    pub fn flow_expired(expired_at: DateTime<Utc>) -> Self {
        Self::new(MessageId::ErrorValidationFlowExpired, MessageKind::Error)
            .with_context("expired_at", expired_at.to_rfc3339())
            .with_context("expired_at_unix", expired_at.timestamp())
    }

    #[must_use]
    pub fn state_failure() -> Self {
        Self::new(MessageId::ErrorValidationStateFailure, MessageKind::Error)
    }

    #[must_use]
    pub fn too_many_attempts() -> Self {
        Self::new(MessageId::ErrorValidationTooManyAttempts, MessageKind::Error)
    }

    #[must_use]
    pub fn duplicate_credentials(available_methods: Vec<String>) -> Self {
        Self::new(
            MessageId::ErrorValidationDuplicateCredentials,
            MessageKind::Error,
        )
        .with_context("available_credential_types", available_methods)
    }

    #[must_use]
    pub fn system_generic() -> Self {
        Self::new(MessageId::ErrorSystemGeneric, MessageKind::Error)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    En,
    Zh,
}

/// Immutable template table, built once. Placeholders use `{name}` and are
/// filled from the message context at render time.
static CATALOG: Lazy<HashMap<(MessageId, Locale), &'static str>> = Lazy::new(|| {
    use Locale::{En, Zh};
    use MessageId::*;

    let mut table = HashMap::new();
    let mut add = |id, en, zh| {
        table.insert((id, En), en);
        table.insert((id, Zh), zh);
    };

    add(
        InfoSelfServiceVerificationSuccessful,
        "You successfully verified your address.",
        "您已成功验证邮箱地址。",
    );
    add(
        InfoSelfServiceVerificationCodeSent,
        "A verification code has been sent to the address you provided. If you have not received it, check the spelling of the address and retry.",
        "验证码已发送至您提供的邮箱。如果未收到，请检查地址拼写并确保使用注册邮箱。",
    );
    add(
        InfoSelfServiceRecoverySuccessful,
        "You successfully recovered your account.",
        "您已成功恢复账户。",
    );
    add(
        InfoSelfServiceRecoveryCodeSent,
        "A recovery code has been sent to the address you provided.",
        "恢复码已发送至您提供的地址。",
    );
    add(
        InfoSelfServiceRecoveryMaskedCodeSent,
        "A recovery code has been sent to {masked_address}.",
        "恢复码已发送至 {masked_address}。",
    );
    add(
        InfoSelfServiceLoginWebauthn,
        "Sign in with your security key or passkey.",
        "使用您的安全密钥或通行密钥登录。",
    );
    add(
        ErrorValidationGeneric,
        "The submitted value is invalid.",
        "提交的值无效。",
    );
    add(
        ErrorValidationDuplicateCredentials,
        "An account with the same identifier exists already. Sign in with one of your existing methods to link it.",
        "已存在使用相同标识的账户。请使用现有方式登录后再进行绑定。",
    );
    add(
        ErrorValidationTotpVerifierWrong,
        "The provided authentication code is invalid, please try again.",
        "动态验证码无效，请重试。",
    );
    add(
        ErrorValidationLookupInvalid,
        "The backup recovery code is not valid.",
        "备用恢复码无效。",
    );
    add(
        ErrorValidationFlowExpired,
        "The flow expired at {expired_at}, please retry.",
        "流程已于 {expired_at} 过期，请重试。",
    );
    add(
        ErrorValidationInvalidCredentials,
        "The provided credentials are invalid. Check for spelling mistakes in your identifier or password.",
        "提供的凭据无效。请检查标识或密码是否拼写有误。",
    );
    add(
        ErrorValidationCodeExpired,
        "The code has expired. Please request a new one.",
        "验证码已过期，请重新获取。",
    );
    add(
        ErrorValidationCodeInvalidOrAlreadyUsed,
        "The code is invalid or has already been used. Please try again.",
        "验证码无效或已被使用，请重试。",
    );
    add(
        ErrorValidationRetrySuccess,
        "The request was already completed successfully and can not be retried.",
        "请求已完成，无法重试。",
    );
    add(
        ErrorValidationStateFailure,
        "The flow reached a failure state and must be retried.",
        "流程已达到失败状态，必须重试。",
    );
    add(
        ErrorValidationTooManyAttempts,
        "Too many invalid attempts, the flow was aborted. Please restart.",
        "错误尝试次数过多，流程已中止，请重新开始。",
    );
    add(
        ErrorValidationCaptcha,
        "Captcha verification failed, please retry.",
        "人机验证失败，请重试。",
    );
    add(
        ErrorSystemGeneric,
        "An error occurred, please try again later.",
        "发生错误，请稍后重试。",
    );
    table
});

/// Render a message into localized text. Pure lookup plus parameter
/// substitution; unknown placeholders are left in place.
#[must_use]
pub fn render(id: MessageId, locale: Locale, params: &Map<String, Value>) -> String {
    let Some(template) = CATALOG.get(&(id, locale)) else {
        // Every id has an English entry; fall back rather than panic.
        return CATALOG
            .get(&(id, Locale::En))
            .map_or_else(String::new, |t| substitute(t, params));
    };
    substitute(template, params)
}

/// Render a [`Message`] with its own context as parameters.
#[must_use]
pub fn render_message(message: &Message, locale: Locale) -> String {
    render(message.id, locale, &message.context)
}

fn substitute(template: &str, params: &Map<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        let needle = format!("{{{key}}}");
        if !out.contains(&needle) {
            continue;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &text);
    }
    out
}

/// Mask an address for display in recovery prompts.
///
/// Emails keep the first two characters of the local part and the full
/// domain; phone numbers keep the last four digits.
#[must_use]
pub fn mask_address(value: &str) -> String {
    if let Some((local, domain)) = value.split_once('@') {
        let visible: String = local.chars().take(2).collect();
        return format!("{visible}****@{domain}");
    }
    // Counted in chars so multi-byte input cannot split a boundary.
    let count = value.chars().count();
    if count <= 4 {
        return "****".to_string();
    }
    let tail: String = value.chars().skip(count - 4).collect();
    format!("****{tail}")
}
