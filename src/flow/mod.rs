//! Flow lifecycle model: one record per in-progress self-service operation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::text::Message;

pub mod machine;

pub use machine::{FlowConfig, FlowMachine};

/// The self-service operation a flow drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Login,
    Registration,
    Recovery,
    Verification,
    Settings,
}

/// Flow states. `PassedChallenge` and `Failed` are terminal; expiry is
/// derived from `expires_at` on every access rather than stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    ChooseMethod,
    Sent,
    PassedChallenge,
    Failed,
}

impl FlowState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::PassedChallenge | Self::Failed)
    }
}

/// Authentication assurance level requested by the flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Aal {
    #[serde(rename = "aal1")]
    Aal1,
    #[serde(rename = "aal2")]
    Aal2,
}

/// One renderable UI node. Opaque to the engine: strategies produce nodes,
/// callers render them; nothing in the core inspects them afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UiNode {
    pub group: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

impl UiNode {
    #[must_use]
    pub fn input(group: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            node_type: "input".to_string(),
            value: None,
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }
}

/// One in-progress self-service operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    pub state: FlowState,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub csrf_token: String,
    pub requested_aal: Aal,
    /// Strategy group that answered the flow, once one has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    pub ui_nodes: Vec<UiNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// Strategy-private context carried across submissions. Never rendered.
    #[serde(skip_serializing)]
    pub internal_context: Map<String, Value>,
}

impl Flow {
    /// Allocate a new flow. `ttl` must be positive so that
    /// `expires_at > issued_at` holds.
    #[must_use]
    pub fn new(flow_type: FlowType, requested_aal: Aal, csrf_token: String, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_type,
            state: FlowState::ChooseMethod,
            issued_at,
            expires_at: issued_at + ttl.max(Duration::seconds(1)),
            csrf_token,
            requested_aal,
            active: None,
            ui_nodes: Vec::new(),
            messages: Vec::new(),
            internal_context: Map::new(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Constant-time CSRF token check.
    #[must_use]
    pub fn csrf_matches(&self, supplied: &str) -> bool {
        let ours = self.csrf_token.as_bytes();
        let theirs = supplied.as_bytes();
        if ours.len() != theirs.len() {
            return false;
        }
        ours.ct_eq(theirs).into()
    }

    /// Replace queued messages; each submission renders a fresh set.
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn context_set(&mut self, key: &str, value: impl Into<Value>) {
        self.internal_context.insert(key.to_string(), value.into());
    }

    #[must_use]
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.internal_context.get(key).and_then(Value::as_str)
    }
}

/// Logical submission payload: `{flow_id, method, csrf_token, fields...}`.
/// `fields` is method-specific (`code` for the code strategy, provider
/// callback parameters for oidc).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub flow_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub csrf_token: String,
    #[serde(default, flatten)]
    pub fields: Map<String, Value>,
}

impl SubmissionPayload {
    #[must_use]
    pub fn new(flow_id: Uuid, csrf_token: impl Into<String>) -> Self {
        Self {
            flow_id,
            method: None,
            csrf_token: csrf_token.into(),
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}
