//! Kernel messages as the middleware sees them.
//!
//! Content stays raw JSON: the core only looks at `msg_type` and at
//! `display_data` bundles carrying the reserved key. Conversions to and from
//! `jupyter_protocol::JupyterMessage` are used by the kernel connection.

use chrono::Utc;
use jupyter_protocol::{Header, JupyterMessage, JupyterMessageContent};
use log::warn;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use uuid::Uuid;

/// Protocol version stamped on locally synthesized messages.
pub const PROTOCOL_VERSION: &str = "5.0";

/// Key under `application/json` that carries helper results.
pub const RESERVED_KEY: &str = "hydrogen_python";

/// Error type for message conversion failures.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Failed to parse message content: {0}")]
    ContentParseError(#[from] anyhow::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Socket a message arrived on (or is destined for).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageChannel {
    IOPub,
    Shell,
    Stdin,
    Control,
    Heartbeat,
    Other(String),
}

impl From<String> for MessageChannel {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "iopub" => MessageChannel::IOPub,
            "shell" => MessageChannel::Shell,
            "stdin" => MessageChannel::Stdin,
            "control" => MessageChannel::Control,
            "heartbeat" | "hb" => MessageChannel::Heartbeat,
            _ => MessageChannel::Other(tag),
        }
    }
}

impl From<&str> for MessageChannel {
    fn from(tag: &str) -> Self {
        MessageChannel::from(tag.to_string())
    }
}

impl From<MessageChannel> for String {
    fn from(channel: MessageChannel) -> Self {
        channel.to_string()
    }
}

impl std::fmt::Display for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageChannel::IOPub => write!(f, "iopub"),
            MessageChannel::Shell => write!(f, "shell"),
            MessageChannel::Stdin => write!(f, "stdin"),
            MessageChannel::Control => write!(f, "control"),
            MessageChannel::Heartbeat => write!(f, "heartbeat"),
            MessageChannel::Other(tag) => write!(f, "{}", tag),
        }
    }
}

/// A request/reply envelope with raw JSON content.
///
/// `parent_header` may arrive as `{}`, `null`, or a header; it is written back
/// out as `{}` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: Header,

    #[serde(
        default,
        serialize_with = "serialize_parent_header",
        deserialize_with = "jupyter_protocol::deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default = "empty_object")]
    pub metadata: Value,

    #[serde(default = "empty_object")]
    pub content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<MessageChannel>,
}

fn empty_object() -> Value {
    json!({})
}

fn serialize_parent_header<S>(header: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match header {
        Some(header) => header.serialize(serializer),
        None => empty_object().serialize(serializer),
    }
}

impl KernelMessage {
    /// Build a fresh message with a unique `msg_id` and version `5.0`.
    pub fn synthesize(msg_type: &str, content: Value, session: &str) -> Self {
        KernelMessage {
            header: Header {
                msg_id: Uuid::new_v4().to_string(),
                username: "hydrogen-python".to_string(),
                session: session.to_string(),
                date: Utc::now(),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: None,
            metadata: empty_object(),
            content,
            channel: None,
        }
    }

    /// An `execute_request` for the shell channel.
    pub fn execute_request(code: &str, session: &str) -> Self {
        Self::execute_request_with(code, session, true)
    }

    /// An `execute_request` for helper code. It stays out of `In`/`Out` and
    /// the execution count, and an exception in it does not abort the
    /// requests queued behind it. Not silent, so `display_data` still comes
    /// back on iopub.
    pub fn helper_request(code: &str, session: &str) -> Self {
        Self::execute_request_with(code, session, false)
    }

    fn execute_request_with(code: &str, session: &str, user_code: bool) -> Self {
        let content = json!({
            "code": code,
            "silent": false,
            "store_history": user_code,
            "user_expressions": {},
            "allow_stdin": false,
            "stop_on_error": user_code,
        });
        let mut message = Self::synthesize("execute_request", content, session);
        message.channel = Some(MessageChannel::Shell);
        message
    }

    pub fn with_parent(mut self, parent: &Header) -> Self {
        self.parent_header = Some(parent.clone());
        self
    }

    pub fn with_channel(mut self, channel: MessageChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    pub fn is_execute_reply(&self) -> bool {
        self.header.msg_type == "execute_reply"
    }

    /// Whether this is the iopub `idle` status that ends a request.
    pub fn is_idle(&self) -> bool {
        self.channel == Some(MessageChannel::IOPub)
            && self.header.msg_type == "status"
            && self.content.get("execution_state").and_then(Value::as_str) == Some("idle")
    }

    /// The value stored under the reserved key of an iopub `display_data`
    /// JSON bundle. Everything else, plain stdout included, yields `None`.
    pub fn reserved_payload(&self) -> Option<&Value> {
        if self.channel != Some(MessageChannel::IOPub) || self.header.msg_type != "display_data" {
            return None;
        }
        self.content
            .get("data")?
            .get("application/json")?
            .get(RESERVED_KEY)
    }

    /// Wrap a message read from one of the kernel sockets.
    pub fn from_jupyter(message: JupyterMessage, channel: MessageChannel) -> Self {
        KernelMessage {
            content: content_to_value(&message.content),
            header: message.header,
            parent_header: message.parent_header,
            metadata: message.metadata,
            channel: Some(channel),
        }
    }
}

impl TryFrom<KernelMessage> for JupyterMessage {
    type Error = ConversionError;

    fn try_from(message: KernelMessage) -> Result<Self, Self::Error> {
        let content =
            JupyterMessageContent::from_type_and_content(&message.header.msg_type, message.content)?;

        Ok(JupyterMessage {
            zmq_identities: Vec::new(),
            header: message.header,
            parent_header: message.parent_header,
            metadata: message.metadata,
            content,
            buffers: Vec::new(),
            channel: None,
        })
    }
}

/// Flatten typed content back into wire JSON for the message kinds the
/// middleware forwards. Other kinds keep an empty body.
fn content_to_value(content: &JupyterMessageContent) -> Value {
    let value = match content {
        JupyterMessageContent::DisplayData(data) => serde_json::to_value(data),
        JupyterMessageContent::UpdateDisplayData(data) => serde_json::to_value(data),
        JupyterMessageContent::ExecuteResult(result) => serde_json::to_value(result),
        JupyterMessageContent::StreamContent(stream) => serde_json::to_value(stream),
        JupyterMessageContent::ErrorOutput(error) => serde_json::to_value(error),
        JupyterMessageContent::ExecuteInput(input) => serde_json::to_value(input),
        JupyterMessageContent::ExecuteReply(reply) => serde_json::to_value(reply),
        JupyterMessageContent::Status(status) => serde_json::to_value(status),
        _ => return empty_object(),
    };
    value.unwrap_or_else(|e| {
        warn!("[message] Failed to serialize message content: {}", e);
        empty_object()
    })
}
