//! Wire and data types shared by the transport, push channel, and engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MalformedEventError;
use crate::progress;

/// Lifecycle status of an intake session.
///
/// Moves one way only: `Active` → `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
}

impl SessionStatus {
    /// Combine the current status with one reported by the service.
    ///
    /// `Completed` absorbs: a reported `Active` never reopens a session.
    pub fn merge(self, incoming: SessionStatus) -> SessionStatus {
        match (self, incoming) {
            (Self::Completed, _) | (_, Self::Completed) => Self::Completed,
            (Self::Active, Self::Active) => Self::Active,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Bot,
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Bot => "bot",
        };
        write!(f, "{s}")
    }
}

/// A server-provisioned intake session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    /// Dialogue step token, e.g. `zip_code` or `license_status`.
    pub current_step: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Answers collected so far, if the service chose to include them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Session {
    /// Progress through the intake, 0..=100.
    pub fn progress_percent(&self) -> u8 {
        progress::progress_percent(&self.current_step)
    }
}

/// One chat message. `id` is the de-duplication key within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Empty when the frame omitted it (push frames do).
    #[serde(default)]
    pub session_id: String,
    pub sender: Sender,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether this message may be attributed to `session_id`.
    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.session_id.is_empty() || self.session_id == session_id
    }

    pub fn is_from_bot(&self) -> bool {
        self.sender == Sender::Bot
    }
}

/// Body of `POST /api/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

/// Acknowledgment returned by `POST /api/messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The bot's reply text; the full message arrives over the push channel.
    pub message: String,
    pub current_step: String,
    pub session_status: SessionStatus,
}

/// Inbound push channel event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A message was stored for the session.
    Message { message: Message },
}

/// Decoding shape for push frames. Tags without a variant land in `Unknown`.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Message {
        message: Message,
    },
    #[serde(other)]
    Unknown,
}

// Every event kind needs a decoding variant.
impl From<PushEvent> for InboundFrame {
    fn from(event: PushEvent) -> Self {
        match event {
            PushEvent::Message { message } => Self::Message { message },
        }
    }
}

impl PushEvent {
    /// Decode a text frame.
    ///
    /// Returns `Ok(None)` for a well-formed frame whose `type` is not known.
    pub fn decode(frame: &str) -> Result<Option<Self>, MalformedEventError> {
        let value: serde_json::Value = serde_json::from_str(frame)?;
        if !value.get("type").is_some_and(serde_json::Value::is_string) {
            return Err(MalformedEventError::MissingType);
        }

        match serde_json::from_value(value)? {
            InboundFrame::Message { message } => Ok(Some(Self::Message { message })),
            InboundFrame::Unknown => Ok(None),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
        }
    }
}

/// Timestamps as the service writes them.
///
/// The service emits naive ISO-8601 in UTC (`2024-05-01T12:00:00.123456`);
/// RFC 3339 with an offset is accepted as well.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, NAIVE_FORMAT).map(|naive| naive.and_utc())
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
