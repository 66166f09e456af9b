use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type PersonalInfo = BTreeMap<String, Value>;

/// One finished question/answer turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub question: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    pub fn now(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    Response,
    Error,
}

/// A single unit of pipeline output. Concatenating the `Response` parts of a
/// turn in delivery order yields the full answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePart {
    #[serde(rename = "type")]
    pub kind: PartKind,
    pub content: String,
}

impl ResponsePart {
    pub fn response(content: impl Into<String>) -> Self {
        Self {
            kind: PartKind::Response,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: PartKind::Error,
            content: content.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == PartKind::Error
    }
}

/// Inbound frame on the chat channel and body of `POST /chat`.
///
/// Every field is optional on the wire so that a missing `query` can be
/// reported as a protocol error instead of a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub personal_info: Option<PersonalInfo>,
    #[serde(default)]
    pub institution_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<Value>,
}

impl ChatRequest {
    /// The trimmed query, or `None` when it is absent or blank.
    pub fn trimmed_query(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
    }

    /// The client-supplied session id, verbatim, unless it is blank.
    pub fn client_session_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .filter(|session_id| !session_id.trim().is_empty())
    }
}

/// Outbound frame on the chat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: PartKind,
    pub content: String,
    #[serde(default)]
    pub message_id: Option<Value>,
    pub session_id: String,
    #[serde(default)]
    pub is_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub responses: Vec<ResponsePart>,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
