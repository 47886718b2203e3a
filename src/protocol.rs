//! jsrdbg wire envelopes.
//!
//! Only the fields needed by the bridge are modelled: a command carries a
//! unique id for correlation, a response carries an arbitrary content payload
//! that may reference that id. Everything else stays opaque
//! [`serde_json::Value`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing request. Immutable once built, discarded after serialization.
#[derive(Debug, Serialize)]
pub struct Command {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            r#type: "command",
            id: uuid::Uuid::new_v4().to_string(),
            content: None,
        }
    }

    pub fn with_content(name: impl Into<String>, content: Value) -> Self {
        Self {
            content: Some(content),
            ..Self::new(name)
        }
    }

    /// Wire form: one JSON object terminated by a newline. Any further framing
    /// belongs to the transport.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        let mut message = serde_json::to_string(self)?;
        message.push('\n');
        Ok(message)
    }
}

/// Incoming message envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    /// `info` or `error`; absent on some target versions.
    #[serde(rename = "type")]
    pub r#type: Option<String>,
    pub subtype: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl Response {
    /// The command id this response answers, if any.
    pub fn command_id(&self) -> Option<&str> {
        self.content.get("id").and_then(Value::as_str)
    }
}
