//! Wire protocol for the streaming chat channel.
//!
//! Outbound commands are wrapped in a fixed envelope:
//!
//! ```text
//! {"type":"buyer","content":{"body":{"type":"chat","code":"100007","data":{...}}}}
//! ```
//!
//! Inbound frames carry the answer inside `body.data`:
//!
//! ```text
//! {"id":"..","code":"200","body":{"code":"100008","data":{"sseMsgType":"message","data":"{..}","type":"chat"}}}
//! ```
//!
//! For `message` frames `body.data.data` is itself a JSON *string* and is decoded in a
//! second pass. For `stream-end` frames it is already an object. The server contract
//! depends on this asymmetry, so both stages stay explicit here.
//!
//! Heartbeats are the bare text frames `ping` and `pong`, outside of any envelope.

use chatwire_core::{ChatId, ClientType, MsgId, QueryId, RunId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Command code for submitting a query.
pub const SEND_QUERY_CODE: &str = "100007";

/// Command code shared by stop and refresh.
pub const STOP_QUERY_CODE: &str = "100009";

/// Inner code of inbound chat-data frames.
pub const CHAT_DATA_CODE: &str = "100008";

/// Heartbeat request sent by the client.
pub const PING_FRAME: &str = "ping";

/// Heartbeat reply sent by the server.
pub const PONG_FRAME: &str = "pong";

const ENVELOPE_TYPE: &str = "buyer";
const BODY_TYPE: &str = "chat";

/// Returns true if a raw text frame is a heartbeat reply.
///
/// Compared by raw equality; a JSON envelope is never a pong.
#[must_use]
pub fn is_pong(text: &str) -> bool {
    text == PONG_FRAME
}

// =============================================================================
// Outbound
// =============================================================================

/// Submit a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendQuery {
    /// Conversation the question belongs to.
    pub chat_id: ChatId,
    /// Question text; percent-encoded on the wire.
    #[serde(with = "percent")]
    pub query: String,
    /// Correlation token echoed on every answer frame.
    pub run_id: RunId,
    /// Client-generated message ID.
    pub msg_id: MsgId,
    /// Client platform.
    pub client_type: ClientType,
    /// Access token of the user.
    pub access_token: String,
}

/// Stop (or stop-and-resubmit) a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopQuery {
    /// Run to act on.
    pub run_id: RunId,
    /// Server-side question ID, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<QueryId>,
    /// Conversation of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    /// Client platform.
    pub client_type: ClientType,
    /// Access token of the user.
    pub access_token: String,
}

/// A command sent over the streaming channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    /// Ask a question.
    SendQuery(SendQuery),
    /// Stop a running answer.
    StopQuery(StopQuery),
    /// Stop the previous run and resubmit; same wire shape as stop.
    RefreshQuery(StopQuery),
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope<T> {
    #[serde(rename = "type")]
    kind: String,
    content: WireContent<T>,
}

#[derive(Serialize, Deserialize)]
struct WireContent<T> {
    body: WireBody<T>,
}

#[derive(Serialize, Deserialize)]
struct WireBody<T> {
    #[serde(rename = "type")]
    kind: String,
    code: String,
    data: T,
}

impl<T> WireEnvelope<T> {
    fn chat(code: &str, data: T) -> Self {
        Self {
            kind: ENVELOPE_TYPE.to_string(),
            content: WireContent {
                body: WireBody {
                    kind: BODY_TYPE.to_string(),
                    code: code.to_string(),
                    data,
                },
            },
        }
    }
}

impl OutboundCommand {
    /// Wire command code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SendQuery(_) => SEND_QUERY_CODE,
            Self::StopQuery(_) | Self::RefreshQuery(_) => STOP_QUERY_CODE,
        }
    }

    /// Run the command refers to.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::SendQuery(q) => &q.run_id,
            Self::StopQuery(q) | Self::RefreshQuery(q) => &q.run_id,
        }
    }

    /// Serialize into the outbound envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::SendQuery(q) => serde_json::to_string(&WireEnvelope::chat(self.code(), q)),
            Self::StopQuery(q) | Self::RefreshQuery(q) => {
                serde_json::to_string(&WireEnvelope::chat(self.code(), q))
            }
        }
    }

    /// Parse an outbound envelope back into a command, as the server does.
    ///
    /// Stop and refresh share a wire shape, so code `100009` always decodes to
    /// [`OutboundCommand::StopQuery`].
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a command envelope.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let envelope: WireEnvelope<Value> = serde_json::from_str(text)?;
        let body = envelope.content.body;
        match body.code.as_str() {
            SEND_QUERY_CODE => Ok(Self::SendQuery(serde_json::from_value(body.data)?)),
            STOP_QUERY_CODE => Ok(Self::StopQuery(serde_json::from_value(body.data)?)),
            other => Err(FrameError::UnexpectedCode(other.to_string())),
        }
    }
}

mod percent {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&urlencoding::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let raw = String::deserialize(deserializer)?;
        urlencoding::decode(&raw)
            .map(std::borrow::Cow::into_owned)
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Errors decoding an inbound frame. Such frames are dropped, never surfaced.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame (or its nested payload string) is not valid JSON of the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The inner body code is not the chat-data code.
    #[error("unexpected inner code: {0}")]
    UnexpectedCode(String),

    /// `body.data.data` has a JSON type the message kind does not allow.
    #[error("unexpected {kind:?} payload of JSON type {found}")]
    UnexpectedPayload {
        /// Message kind of the frame.
        kind: SseMsgType,
        /// JSON type that was found.
        found: &'static str,
    },
}

/// Kind of an inbound chat frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SseMsgType {
    /// Snapshot of a run in progress.
    Message,
    /// Terminal frame carrying the final record of a run.
    StreamEnd,
}

/// A decoded inbound chat frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Frame ID assigned by the server.
    pub id: String,
    /// Outer status code.
    pub code: String,
    /// Message kind.
    pub kind: SseMsgType,
    /// Decoded answer record, absent when the server sent `null`.
    pub payload: Option<AnswerPayload>,
}

impl InboundFrame {
    /// Run this frame belongs to, if the payload names one.
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        self.payload
            .as_ref()
            .and_then(|p| p.run_id.as_deref())
            .and_then(|id| RunId::new(id).ok())
    }

    /// Returns true for the terminal frame of a run.
    #[must_use]
    pub fn is_stream_end(&self) -> bool {
        self.kind == SseMsgType::StreamEnd
    }
}

/// Answer record as sent by the server.
///
/// Structured sub-fields (`data`, `reference`, `steps`, `label`) are kept as raw JSON
/// because the server sends them either as JSON-encoded strings or as values; they are
/// decoded one by one in [`crate::answer`]. Absent and `null` fields are both `None`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    /// Correlation token.
    #[serde(default, deserialize_with = "lenient_string")]
    pub run_id: Option<String>,
    /// Server-side question ID.
    #[serde(default, deserialize_with = "lenient_string")]
    pub query_id: Option<String>,
    /// Conversation ID.
    #[serde(default, deserialize_with = "lenient_string")]
    pub chat_id: Option<String>,
    /// Echo of the question.
    #[serde(default, deserialize_with = "lenient_string")]
    pub query: Option<String>,
    /// Accumulated thinking content.
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: Option<String>,
    /// Answer text.
    #[serde(default, deserialize_with = "lenient_string")]
    pub response: Option<String>,
    /// Short summary of the answer.
    #[serde(default, deserialize_with = "lenient_string")]
    pub summary: Option<String>,
    /// Server timestamp.
    #[serde(default, deserialize_with = "lenient_string")]
    pub ts: Option<String>,
    /// Analysis record, usually a JSON string.
    #[serde(default)]
    pub data: Option<Value>,
    /// Reference list, usually a JSON string.
    #[serde(default)]
    pub reference: Option<Value>,
    /// Step trace, usually a JSON string.
    #[serde(default)]
    pub steps: Option<Value>,
    /// Labels, usually a JSON string.
    #[serde(default)]
    pub label: Option<Value>,
    /// Collected flag (`0`/`1`).
    #[serde(default)]
    pub is_collect: Option<Value>,
    /// Answer duration in milliseconds.
    #[serde(default)]
    pub message_time_long: Option<Value>,
    /// Paused flag.
    #[serde(default)]
    pub is_paused: Option<Value>,
}

/// Accept strings, numbers and booleans as text; anything else becomes `None`.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    })
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    code: Value,
    #[serde(default)]
    body: Option<RawBody>,
}

#[derive(Default, Deserialize)]
struct RawBody {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChatData {
    sse_msg_type: SseMsgType,
    #[serde(default)]
    data: Value,
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decode an inbound text frame.
///
/// # Errors
///
/// Returns an error if the frame is malformed at any stage or is not a chat-data frame.
pub fn decode_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let body = raw.body.unwrap_or_default();

    let inner_code = scalar_text(&body.code);
    if inner_code != CHAT_DATA_CODE {
        return Err(FrameError::UnexpectedCode(inner_code));
    }

    let chat: RawChatData = serde_json::from_value(body.data)?;
    let payload = match (chat.sse_msg_type, chat.data) {
        (_, Value::Null) => None,
        // Second pass: the message payload is a JSON document inside a string.
        (SseMsgType::Message, Value::String(encoded)) => {
            serde_json::from_str::<Option<AnswerPayload>>(&encoded)?
        }
        (SseMsgType::StreamEnd, record @ Value::Object(_)) => {
            Some(serde_json::from_value(record)?)
        }
        (kind, other) => {
            return Err(FrameError::UnexpectedPayload {
                kind,
                found: json_type(&other),
            })
        }
    };

    Ok(InboundFrame {
        id: scalar_text(&raw.id),
        code: scalar_text(&raw.code),
        kind: chat.sse_msg_type,
        payload,
    })
}
