//! Wire types for the stream-json protocol.
//!
//! # Inbound discriminants
//!
//! | `type`             | Maps to                                  |
//! |--------------------|------------------------------------------|
//! | `system` + `init`  | [`Event::Init`]                          |
//! | `system` (other)   | [`Event::System`]                        |
//! | `assistant`        | [`Event::Assistant`]                     |
//! | `user`             | [`Event::User`]                          |
//! | `result`           | [`Event::Result`] (terminal)             |
//! | `control_response` | [`ControlResponse`], never a query event |
//! | *(any other)*      | [`Event::Other`], forwarded unchanged    |
//!
//! A known discriminant whose body does not fit its typed view is forwarded
//! as [`Event::Other`] with the original object. A `result` is always
//! [`Event::Result`], so a query ends no matter how its result is shaped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Session announcement emitted by a freshly spawned agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitEvent {
    /// Continuation identifier assigned by the agent; empty if not announced.
    #[serde(default, deserialize_with = "null_as_default")]
    pub session_id: String,
    /// Model identifier.
    #[serde(default, deserialize_with = "null_as_default")]
    pub model: String,
    /// Names of the tools the agent may call.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tools: Vec<String>,
    /// Working directory reported by the agent.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Permission mode reported by the agent.
    #[serde(default, rename = "permissionMode")]
    pub permission_mode: Option<String>,
}

/// A `system` message other than `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    /// System subtype, e.g. `compact_boundary`.
    pub subtype: String,
    /// Remaining fields, untouched.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Model reasoning.
    Thinking {
        /// The reasoning text.
        thinking: String,
    },
    /// Tool invocation requested by the agent.
    ToolUse {
        /// Invocation id, echoed back by the matching tool result.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        #[serde(default)]
        input: Value,
    },
    /// Result of an earlier tool invocation.
    ToolResult {
        /// Id of the invocation this result answers.
        tool_use_id: String,
        /// Tool output, either a string or a list of blocks.
        #[serde(default)]
        content: Value,
        /// Whether the tool reported failure.
        #[serde(default)]
        is_error: bool,
    },
    /// Any block type this crate does not model.
    #[serde(other)]
    Unknown,
}

/// The `message` object inside `assistant` and `user` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `assistant` or `user`.
    #[serde(default)]
    pub role: String,
    /// Content blocks; a bare string is normalized to one text block.
    #[serde(default, deserialize_with = "content_blocks")]
    pub content: Vec<ContentBlock>,
    /// Model that produced the message, when reported.
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatMessage {
    /// Concatenate every text block.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn content_blocks<'de, D>(deserializer: D) -> std::result::Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawContent::deserialize(deserializer)? {
        RawContent::Text(text) => vec![ContentBlock::Text { text }],
        RawContent::Blocks(blocks) => blocks,
    })
}

/// Progress event: one assistant or user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// The message body.
    pub message: ChatMessage,
    /// Set when the message belongs to a sub-agent tool call.
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    /// Continuation id the agent attached, if any.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Token usage totals for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens written to the prompt cache.
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    /// Tokens served from the prompt cache.
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Terminal event ending a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// `success`, `error_max_turns`, `error_during_execution`, ...; empty if
    /// the agent sent none.
    #[serde(default, deserialize_with = "null_as_default")]
    pub subtype: String,
    /// Agent-reported failure flag.
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_error: bool,
    /// Human-readable result text.
    #[serde(default)]
    pub result: Option<String>,
    /// Continuation id the result belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Usage totals; zero when absent or `null`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub usage: Usage,
    /// Total cost in USD.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    /// Wall-clock duration.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Number of agent turns.
    #[serde(default)]
    pub num_turns: Option<u32>,
}

impl ResultEvent {
    /// Whether the query completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.subtype == "success" && !self.is_error
    }

    /// Best-effort view of a `result` whose body does not deserialize.
    ///
    /// Fields of the wrong type are left at their defaults.
    fn salvage(value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
        Self {
            subtype: text("subtype").unwrap_or_default(),
            is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or_default(),
            result: text("result"),
            session_id: text("session_id"),
            ..Self::default()
        }
    }
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// `system`/`init`.
    Init(InitEvent),
    /// Any other `system` subtype.
    System(SystemEvent),
    /// Assistant output.
    Assistant(MessageEvent),
    /// Tool-result echoes.
    User(MessageEvent),
    /// Terminal result.
    Result(ResultEvent),
    /// Unknown discriminant, or a known one with an unexpected body,
    /// forwarded unchanged.
    Other(Value),
}

impl Event {
    /// Classify an already-parsed JSON object.
    ///
    /// Never fails: bodies that do not fit their typed view fall back to
    /// [`Event::Other`], except `result`, which is salvaged field by field.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let is_init = value.get("subtype").and_then(Value::as_str) == Some("init");

        match kind.as_str() {
            "system" if is_init => typed(value, Self::Init),
            "system" => typed(value, Self::System),
            "assistant" => typed(value, Self::Assistant),
            "user" => typed(value, Self::User),
            "result" => match ResultEvent::deserialize(&value) {
                Ok(result) => Self::Result(result),
                Err(err) => {
                    debug!(error = %err, "result body does not match; salvaging");
                    Self::Result(ResultEvent::salvage(&value))
                }
            },
            _ => Self::Other(value),
        }
    }

    /// Whether this event ends a query.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
            Self::Other(_) => "other",
        }
    }
}

fn typed<T: DeserializeOwned>(value: Value, wrap: fn(T) -> Event) -> Event {
    match T::deserialize(&value) {
        Ok(body) => wrap(body),
        Err(err) => {
            debug!(error = %err, "event body does not match its type; forwarding as other");
            Event::Other(value)
        }
    }
}

/// Reply to an outbound control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Id of the request this answers.
    pub request_id: String,
    /// `success` or `error`.
    pub subtype: String,
    /// Optional response payload.
    #[serde(default)]
    pub response: Option<Value>,
    /// Error text when `subtype` is `error`.
    #[serde(default)]
    pub error: Option<String>,
}

impl ControlResponse {
    /// Whether the agent acknowledged the request.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.subtype == "success"
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ControlEnvelope {
    pub(crate) response: ControlResponse,
}

/// Build the outbound user turn carrying `prompt`.
///
/// `continuation_id` may be empty before the agent has announced one.
#[must_use]
pub fn user_turn(prompt: &str, continuation_id: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": prompt }],
        },
        "session_id": continuation_id,
        "parent_tool_use_id": null,
    })
}

/// Build an outbound control request.
#[must_use]
pub fn control_request(request_id: &str, subtype: &str) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": { "subtype": subtype },
    })
}
