//! Outbound event envelope and the payloads carried inside it.
//!
//! Every message the daemons put on the bus is an [`Event`]: a type name
//! that doubles as the default routing key, an ISO-8601 timestamp, an
//! arbitrary JSON `data` object and an optional trace id.
//!
//! ```text
//! {
//!   "event_type": "game.reminder.due",
//!   "timestamp":  "2026-03-01T18:00:00Z",
//!   "data":       { "game_session_id": "...", "reminder_minutes": 60 },
//!   "trace_id":   "..."
//! }
//! ```
//!
//! Dead-lettered messages are decoded back into an `Event` before they are
//! republished, so the envelope must round-trip through JSON unchanged.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{GameSessionId, GameStatus},
};

/// Event type emitted when a reminder comes due.
pub const GAME_REMINDER_DUE: &str = "game.reminder.due";

/// Event type emitted when a status transition comes due.
pub const GAME_STATUS_TRANSITION: &str = "game.status.transition";

/// Envelope for every message published to the primary exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Dotted event name; also the default routing key.
    pub event_type: String,

    /// When the event was built.
    pub timestamp: DateTime<Utc>,

    /// Event-specific payload.
    pub data: serde_json::Value,

    /// Correlation id for following one message across services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Event {
    /// Creates an event from an already-encoded JSON payload.
    pub fn new(
        event_type: impl Into<String>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self { event_type: event_type.into(), timestamp, data, trace_id: None }
    }

    /// Creates an event by serializing a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the payload cannot be encoded.
    pub fn with_payload<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?, timestamp))
    }

    /// Attaches a trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attaches a freshly generated trace id.
    #[must_use]
    pub fn traced(self) -> Self {
        self.with_trace_id(Uuid::new_v4().to_string())
    }

    /// Routing key used when the publisher is not given an override.
    pub fn routing_key(&self) -> &str {
        &self.event_type
    }

    /// Encodes the envelope as a JSON message body.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a message body back into an envelope.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the body is not a valid
    /// envelope.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decodes `data` into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if `data` does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Payload of a `game.reminder.due` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameReminderDue {
    /// Game the reminder is for.
    pub game_session_id: GameSessionId,

    /// How many minutes ahead of the start this reminder fires.
    pub reminder_minutes: i32,

    /// Game start time, if known. Consumers use it for staleness checks.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Game title, if the builder had it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Chat channel the reminder should be posted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Payload of a `game.status.transition` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStatusTransitionDue {
    /// Game whose status changed.
    pub game_session_id: GameSessionId,

    /// Status that was applied.
    pub target_status: GameStatus,

    /// Time the transition was scheduled for.
    pub transition_time: DateTime<Utc>,
}
