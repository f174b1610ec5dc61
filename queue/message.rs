use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::{error::Error, message_data::MessageField};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    High,
    Normal,
    Low,
}

impl MessagePriority {
    /// Dispatch order. High drains first whenever it has work.
    pub const ALL: [MessagePriority; 3] = [
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::High => "HIGH",
            MessagePriority::Normal => "NORMAL",
            MessagePriority::Low => "LOW",
        }
    }

    pub fn from_wire(s: &str) -> Option<MessagePriority> {
        match s {
            "HIGH" => Some(MessagePriority::High),
            "NORMAL" => Some(MessagePriority::Normal),
            "LOW" => Some(MessagePriority::Low),
            _ => None,
        }
    }
}

impl Default for MessagePriority {
    fn default() -> MessagePriority {
        MessagePriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Delayed,
    Ready,
    InFlight,
    Completed,
    Dead,
}

impl MessageState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageState::Delayed => "DELAYED",
            MessageState::Ready => "READY",
            MessageState::InFlight => "IN_FLIGHT",
            MessageState::Completed => "COMPLETED",
            MessageState::Dead => "DEAD",
        }
    }

    pub fn from_wire(s: &str) -> Option<MessageState> {
        match s {
            "DELAYED" => Some(MessageState::Delayed),
            "READY" => Some(MessageState::Ready),
            "IN_FLIGHT" => Some(MessageState::InFlight),
            "COMPLETED" => Some(MessageState::Completed),
            "DEAD" => Some(MessageState::Dead),
            _ => None,
        }
    }
}

/// A message id: 26-character ULID, lexicographically time-sortable.
pub(crate) fn generate_id() -> String {
    Ulid::new().to_string()
}

/// The full envelope as stored in the `payload:<id>` hash.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub priority: MessagePriority,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub state: MessageState,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Why an envelope hash could not be decoded. Carries whatever identity was
/// recoverable so the caller can still dead-letter the message.
#[derive(Debug)]
pub(crate) struct DecodeFailure {
    pub id: Option<String>,
    pub topic: Option<String>,
    pub reason: String,
}

impl From<DecodeFailure> for Error {
    fn from(failure: DecodeFailure) -> Error {
        Error::CorruptEnvelope {
            id: failure.id.unwrap_or_else(|| String::from("<unknown>")),
            reason: failure.reason,
        }
    }
}

impl Message {
    pub(crate) fn from_hash(mut fields: HashMap<String, String>) -> Result<Message, DecodeFailure> {
        let id = fields.remove(MessageField::Id.as_str());
        let topic = fields.remove(MessageField::Topic.as_str());

        let fail = |reason: String| DecodeFailure {
            id: id.clone(),
            topic: topic.clone(),
            reason,
        };

        let required = |value: Option<String>, name: MessageField| {
            value.ok_or_else(|| fail(format!("missing field {}", name.as_str())))
        };

        let millis = |value: String, name: MessageField| {
            value
                .parse::<i64>()
                .map(|ms| Utc.timestamp_millis(ms))
                .map_err(|_| fail(format!("field {} is not a timestamp", name.as_str())))
        };

        let int = |value: String, name: MessageField| {
            value
                .parse::<u32>()
                .map_err(|_| fail(format!("field {} is not an integer", name.as_str())))
        };

        let opt = |value: Option<String>| value.filter(|v| !v.is_empty());

        let priority_raw = required(fields.remove(MessageField::Priority.as_str()), MessageField::Priority)?;
        let priority = MessagePriority::from_wire(&priority_raw)
            .ok_or_else(|| fail(format!("unknown priority {}", priority_raw)))?;

        let state_raw = required(fields.remove(MessageField::State.as_str()), MessageField::State)?;
        let state = MessageState::from_wire(&state_raw)
            .ok_or_else(|| fail(format!("unknown state {}", state_raw)))?;

        let payload_raw = required(fields.remove(MessageField::Payload.as_str()), MessageField::Payload)?;
        let payload: Value = serde_json::from_str(&payload_raw)
            .map_err(|e| fail(format!("payload is not valid JSON: {}", e)))?;

        let created_at = millis(
            required(fields.remove(MessageField::CreatedAt.as_str()), MessageField::CreatedAt)?,
            MessageField::CreatedAt,
        )?;
        let scheduled_at = millis(
            required(fields.remove(MessageField::ScheduledAt.as_str()), MessageField::ScheduledAt)?,
            MessageField::ScheduledAt,
        )?;
        let expire_at = opt(fields.remove(MessageField::ExpireAt.as_str()))
            .map(|v| millis(v, MessageField::ExpireAt))
            .transpose()?;
        let lease_expires_at = opt(fields.remove(MessageField::LeaseExpiresAt.as_str()))
            .map(|v| millis(v, MessageField::LeaseExpiresAt))
            .transpose()?;

        let max_retries = int(
            required(fields.remove(MessageField::MaxRetries.as_str()), MessageField::MaxRetries)?,
            MessageField::MaxRetries,
        )?;
        let attempts = int(
            required(fields.remove(MessageField::Attempts.as_str()), MessageField::Attempts)?,
            MessageField::Attempts,
        )?;

        Ok(Message {
            id: id.ok_or_else(|| DecodeFailure {
                id: None,
                topic: topic.clone(),
                reason: String::from("missing field id"),
            })?,
            topic: topic.ok_or_else(|| DecodeFailure {
                id: None,
                topic: None,
                reason: String::from("missing field topic"),
            })?,
            priority,
            payload,
            created_at,
            scheduled_at,
            expire_at,
            max_retries,
            attempts,
            last_error: opt(fields.remove(MessageField::LastError.as_str())),
            state,
            lease_expires_at,
        })
    }
}

/// Producer input. Everything except topic and payload has a sensible
/// default; use struct update syntax for the rest.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub topic: String,
    pub payload: Value,
    pub priority: MessagePriority,
    pub delay: Duration,
    /// Absolute deadline; once passed the message is dead-lettered without
    /// being executed.
    pub expire_at: Option<DateTime<Utc>>,
    /// `None` takes the queue default.
    pub max_retries: Option<u32>,
}

impl Default for NewMessage {
    fn default() -> NewMessage {
        NewMessage {
            topic: String::new(),
            payload: Value::Null,
            priority: MessagePriority::Normal,
            delay: Duration::from_secs(0),
            expire_at: None,
            max_retries: None,
        }
    }
}

impl NewMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> NewMessage {
        NewMessage {
            topic: topic.into(),
            payload,
            ..NewMessage::default()
        }
    }

    pub fn from_serialize<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<NewMessage, serde_json::Error> {
        Ok(NewMessage {
            topic: topic.into(),
            payload: serde_json::to_value(payload)?,
            ..NewMessage::default()
        })
    }
}
