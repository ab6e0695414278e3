//! Error taxonomy for the flow engine.
//!
//! Validation-class errors (wrong code, expired flow, bad payload) are
//! recovered into flow messages by the state machine and never surface as
//! system faults. Upstream provider failures keep their cause chain for
//! server-side logs but are rendered to callers as a generic message.

use thiserror::Error;

use crate::identity::LinkingHints;

/// How an upstream provider call failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamKind {
    /// Transport-level failure (timeout, connection refused); safe to retry.
    Retryable,
    /// Malformed response, application-level error code, or incomplete data.
    Fatal,
}

/// Failure from a third-party identity provider.
///
/// The `reason` is for server-side logs only and must never be forwarded
/// verbatim to the end user.
#[derive(Debug, Error)]
#[error("upstream provider error ({kind:?}): {reason}")]
pub struct UpstreamError {
    pub kind: UpstreamKind,
    pub reason: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl UpstreamError {
    #[must_use]
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            kind: UpstreamKind::Retryable,
            reason: reason.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            kind: UpstreamKind::Fatal,
            reason: reason.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == UpstreamKind::Retryable
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow expired")]
    FlowExpired,
    #[error("flow not found")]
    FlowNotFound,
    #[error("csrf token mismatch")]
    CsrfMismatch,
    #[error("no strategy found for method {0:?}")]
    NoStrategyFound(String),
    #[error("the request was already completed successfully and can not be retried")]
    RetrySuccessAlreadyCompleted,
    #[error("flow is already in a terminal state")]
    FlowAlreadyTerminal,
    #[error("code invalid or already used")]
    CodeInvalidOrUsed,
    #[error("code expired")]
    CodeExpired,
    #[error("too many verification attempts")]
    TooManyAttempts,
    #[error("an account with the same identifier exists already")]
    DuplicateCredentials(LinkingHints),
    #[error("submitted traits do not match the existing identity")]
    TraitsMismatch,
    #[error(transparent)]
    UpstreamProvider(#[from] UpstreamError),
    #[error("captcha verification failed")]
    CaptchaFailed,
    #[error("validation failed for {field}: {message}")]
    Validation { field: String, message: String },
    #[error("identity not found")]
    IdentityNotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FlowError {
    /// Build a field-scoped validation error.
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Validation-class errors are folded into flow messages and returned to
    /// the caller as a normal response rather than a fault.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CodeInvalidOrUsed
                | Self::CodeExpired
                | Self::TooManyAttempts
                | Self::DuplicateCredentials(_)
                | Self::TraitsMismatch
                | Self::CaptchaFailed
                | Self::Validation { .. }
        )
    }
}

pub type Result<T, E = FlowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{FlowError, UpstreamError, UpstreamKind};

    #[test]
    fn upstream_error_kinds() {
        assert!(UpstreamError::retryable("timeout").is_retryable());
        assert!(!UpstreamError::fatal("errcode=40029").is_retryable());
    }

    #[test]
    fn upstream_error_preserves_cause() {
        let cause = anyhow::anyhow!("connection reset");
        let err = UpstreamError::retryable("exchange failed").with_source(cause);
        assert_eq!(err.kind, UpstreamKind::Retryable);
        assert!(err.source.is_some());
    }

    #[test]
    fn recoverable_classification() {
        assert!(FlowError::CodeInvalidOrUsed.is_recoverable());
        assert!(FlowError::validation("code", "missing").is_recoverable());
        assert!(!FlowError::CsrfMismatch.is_recoverable());
        assert!(!FlowError::FlowNotFound.is_recoverable());
    }
}
