//! Wire protocol: one JSON object per frame, discriminated by `type`.
//!
//! Inbound (caller → warden): `query`, `close_session`.
//! Outbound (warden → caller): `text`, `tool_use`, `done`, `error`.
//!
//! Every outbound message echoes the `query_id` and `channel_id` of the
//! request it answers so callers can demultiplex overlapping queries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;

/// Name of the discriminator field on every frame.
pub const TAG_FIELD: &str = "type";

/// Tags accepted by [`decode`].
pub const INBOUND_TAGS: &[&str] = &["query", "close_session"];

/// Start or continue a conversation on a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query_id: String,
    pub channel_id: String,
    pub workspace: String,
    pub prompt: String,
    /// Resumption token the caller wants to continue from. Only honoured
    /// when the channel has no live session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Query(QueryRequest),
    CloseSession { channel_id: String },
}

impl InboundMessage {
    pub fn channel_id(&self) -> &str {
        match self {
            Self::Query(q) => &q.channel_id,
            Self::CloseSession { channel_id } => channel_id,
        }
    }
}

/// Field order of each variant is the wire order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        query_id: String,
        channel_id: String,
        content: String,
    },
    ToolUse {
        query_id: String,
        channel_id: String,
        tool: String,
        input: Map<String, Value>,
    },
    Done {
        query_id: String,
        channel_id: String,
        session_id: String,
    },
    Error {
        query_id: String,
        channel_id: String,
        message: String,
    },
}

impl OutboundMessage {
    /// `done` and `error` end a query; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn query_id(&self) -> &str {
        match self {
            Self::Text { query_id, .. }
            | Self::ToolUse { query_id, .. }
            | Self::Done { query_id, .. }
            | Self::Error { query_id, .. } => query_id,
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            Self::Text { channel_id, .. }
            | Self::ToolUse { channel_id, .. }
            | Self::Done { channel_id, .. }
            | Self::Error { channel_id, .. } => channel_id,
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolUse { .. } => "tool_use",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// The `(query_id, channel_id)` pair stamped onto every response of a query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Correlation {
    pub query_id: String,
    pub channel_id: String,
}

impl Correlation {
    pub fn new(query_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn text(&self, content: impl Into<String>) -> OutboundMessage {
        OutboundMessage::Text {
            query_id: self.query_id.clone(),
            channel_id: self.channel_id.clone(),
            content: content.into(),
        }
    }

    pub fn tool_use(&self, tool: impl Into<String>, input: Map<String, Value>) -> OutboundMessage {
        OutboundMessage::ToolUse {
            query_id: self.query_id.clone(),
            channel_id: self.channel_id.clone(),
            tool: tool.into(),
            input,
        }
    }

    pub fn done(&self, session_id: impl Into<String>) -> OutboundMessage {
        OutboundMessage::Done {
            query_id: self.query_id.clone(),
            channel_id: self.channel_id.clone(),
            session_id: session_id.into(),
        }
    }

    pub fn error(&self, message: impl Into<String>) -> OutboundMessage {
        OutboundMessage::Error {
            query_id: self.query_id.clone(),
            channel_id: self.channel_id.clone(),
            message: message.into(),
        }
    }
}

impl From<&QueryRequest> for Correlation {
    fn from(q: &QueryRequest) -> Self {
        Self::new(q.query_id.clone(), q.channel_id.clone())
    }
}

/// Parse one inbound frame.
///
/// The tag is checked before the body so a bad tag reports `UnknownType`
/// even when the rest of the payload is also wrong.
pub fn decode(raw: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(format!("invalid JSON: {e}")))?;

    let Value::Object(ref fields) = value else {
        return Err(ProtocolError::Malformed("expected a JSON object".into()));
    };

    match fields.get(TAG_FIELD) {
        Some(Value::String(tag)) if INBOUND_TAGS.contains(&tag.as_str()) => {}
        Some(Value::String(tag)) => {
            return Err(ProtocolError::UnknownType {
                tag: Some(tag.clone()),
            })
        }
        Some(other) => {
            return Err(ProtocolError::UnknownType {
                tag: Some(other.to_string()),
            })
        }
        None => return Err(ProtocolError::UnknownType { tag: None }),
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Serialize one outbound frame.
pub fn encode(message: &OutboundMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        tracing::error!(error = %e, kind = message.kind(), "Failed to serialize outbound message");
        String::new()
    })
}
