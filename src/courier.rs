//! Outbound delivery contract (email/SMS).
//!
//! Delivery is fire-and-forget from the engine's perspective: the flow is
//! marked `Sent` once the courier accepts the job, without awaiting delivery
//! confirmation. Delivery internals (SMTP, SMS gateways, retries) live behind
//! the [`Courier`] trait.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

use crate::identity::Via;

/// One message to deliver. `body` is already rendered; the engine never logs
/// it because challenge bodies carry the clear one-time code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CourierJob {
    pub address: String,
    pub via: Via,
    pub subject: String,
    pub body: String,
}

impl CourierJob {
    /// Build the delivery job for a one-time code.
    #[must_use]
    pub fn code(address: &str, via: Via, code: &str) -> Self {
        Self {
            address: address.to_string(),
            via,
            subject: "Your verification code".to_string(),
            body: format!("Your verification code is: {code}"),
        }
    }

    /// Pull the code back out of a job body. Test helper for asserting
    /// round trips without exposing the code anywhere else.
    #[must_use]
    pub fn extract_code(&self) -> Option<String> {
        let digits: String = self
            .body
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(char::is_ascii_digit)
            .collect();
        if digits.is_empty() {
            None
        } else {
            Some(digits)
        }
    }
}

/// Accepts "send this to address X" requests. At-least-once, asynchronous.
#[async_trait]
pub trait Courier: Send + Sync {
    async fn send(&self, job: CourierJob) -> Result<()>;
}

/// Local dev courier: logs the destination (never the body) and accepts.
#[derive(Clone, Debug, Default)]
pub struct LogCourier;

#[async_trait]
impl Courier for LogCourier {
    async fn send(&self, job: CourierJob) -> Result<()> {
        info!(
            address = %job.address,
            via = ?job.via,
            subject = %job.subject,
            "courier send stub"
        );
        Ok(())
    }
}

/// Test courier that records delivered jobs for assertions.
#[derive(Debug, Default)]
pub struct RecordingCourier {
    jobs: Mutex<Vec<CourierJob>>,
}

impl RecordingCourier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs accepted so far, oldest first.
    #[must_use]
    pub fn jobs(&self) -> Vec<CourierJob> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }

    /// The most recent job sent to `address`, if any.
    #[must_use]
    pub fn last_for(&self, address: &str) -> Option<CourierJob> {
        self.jobs()
            .into_iter()
            .rev()
            .find(|job| job.address == address)
    }
}

#[async_trait]
impl Courier for RecordingCourier {
    async fn send(&self, job: CourierJob) -> Result<()> {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job);
        }
        Ok(())
    }
}
