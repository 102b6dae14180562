//! Core domain models and strongly-typed identifiers.
//!
//! Defines game sessions, the two schedule-row entities the daemons consume,
//! and newtype ID wrappers for compile-time type safety. Includes database
//! serialization traits and the status transition rules applied when a
//! status schedule comes due.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Declares a UUID-backed identifier with database and display support.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Strongly-typed game session identifier.
    ///
    /// Both schedule tables reference a game session and are deleted by
    /// cascade when it goes away.
    GameSessionId
}

uuid_id! {
    /// Identifier of a reminder row in `notification_schedules`.
    NotificationScheduleId
}

uuid_id! {
    /// Identifier of a transition row in `game_status_schedules`.
    StatusScheduleId
}

/// Lifecycle status of a game session.
///
/// ```text
/// Scheduled -> InProgress -> Completed
///     |            |
///     └────────────┴-> Cancelled
/// ```
///
/// Only the two forward edges are driven by status schedules; cancellation
/// belongs to the CRUD layer and deletes pending rows instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    /// Announced with a start time, not yet running.
    Scheduled,
    /// Start time reached.
    InProgress,
    /// Ran to completion.
    Completed,
    /// Called off before completion.
    Cancelled,
}

impl GameStatus {
    /// Returns the database/wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Status a game must currently hold for a transition into `self` to
    /// apply, or `None` if no schedule may target this status.
    pub const fn expected_source(self) -> Option<Self> {
        match self {
            Self::InProgress => Some(Self::Scheduled),
            Self::Completed => Some(Self::InProgress),
            Self::Scheduled | Self::Cancelled => None,
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("invalid game status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for GameStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for GameStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for GameStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A game session as written by the CRUD layer.
///
/// The scheduling core reads `scheduled_at` for reminder TTLs and reads and
/// writes `status` when a transition comes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GameSession {
    /// Unique identifier for this game.
    pub id: GameSessionId,

    /// Display title shown in reminders.
    pub title: String,

    /// Planned start time, if known.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Planned length in minutes, if known.
    pub duration_minutes: Option<i32>,

    /// Current lifecycle status.
    pub status: GameStatus,

    /// Opaque chat channel the game is announced in.
    pub channel_id: Option<String>,

    /// When the game was created.
    pub created_at: DateTime<Utc>,

    /// When the game was last updated.
    pub updated_at: DateTime<Utc>,
}

impl GameSession {
    /// Planned end time, when both start and duration are known.
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        let start = self.scheduled_at?;
        let minutes = self.duration_minutes?;
        Some(start + Duration::minutes(i64::from(minutes)))
    }
}

/// One reminder to emit ahead of a game.
///
/// At most one row exists per `(game_session_id, reminder_minutes)`. Rows
/// are regenerated rather than mutated when the game is rescheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationSchedule {
    /// Unique identifier for this reminder.
    pub id: NotificationScheduleId,

    /// Game the reminder belongs to.
    pub game_session_id: GameSessionId,

    /// Minutes before the game start this reminder represents.
    pub reminder_minutes: i32,

    /// Absolute time the reminder becomes due.
    pub notification_time: DateTime<Utc>,

    /// Whether the reminder has been published.
    pub sent: bool,
}

impl NotificationSchedule {
    /// Creates an unsent reminder `reminder_minutes` before `starts_at`.
    pub fn for_game(
        game_session_id: GameSessionId,
        starts_at: DateTime<Utc>,
        reminder_minutes: i32,
    ) -> Self {
        Self {
            id: NotificationScheduleId::new(),
            game_session_id,
            reminder_minutes,
            notification_time: starts_at - Duration::minutes(i64::from(reminder_minutes)),
            sent: false,
        }
    }
}

/// A reminder row joined with the parent game fields the builder needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingReminder {
    /// The schedule row itself.
    #[sqlx(flatten)]
    pub schedule: NotificationSchedule,

    /// Parent game start time, if known.
    pub game_scheduled_at: Option<DateTime<Utc>>,

    /// Parent game title.
    pub game_title: Option<String>,

    /// Parent game chat channel.
    pub game_channel_id: Option<String>,
}

/// One pending status change for a game.
///
/// At most one row exists per `(game_session_id, target_status)`, so a game
/// has at most one pending start and one pending completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GameStatusSchedule {
    /// Unique identifier for this transition.
    pub id: StatusScheduleId,

    /// Game whose status will change.
    pub game_session_id: GameSessionId,

    /// Status to apply.
    pub target_status: GameStatus,

    /// When the transition becomes due.
    pub transition_time: DateTime<Utc>,

    /// Whether the transition has been applied.
    pub executed: bool,
}

impl GameStatusSchedule {
    /// Creates an unexecuted transition row.
    pub fn new(
        game_session_id: GameSessionId,
        target_status: GameStatus,
        transition_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: StatusScheduleId::new(),
            game_session_id,
            target_status,
            transition_time,
            executed: false,
        }
    }

    /// The state change this row requests.
    pub fn transition(&self) -> StatusTransition {
        StatusTransition {
            game_session_id: self.game_session_id,
            expected: self.target_status.expected_source(),
            target: self.target_status,
        }
    }
}

/// A guarded status change: apply `target` only if the game is `expected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Game to update.
    pub game_session_id: GameSessionId,
    /// Status the game must currently hold. `None` never matches.
    pub expected: Option<GameStatus>,
    /// Status to set.
    pub target: GameStatus,
}

impl StatusTransition {
    /// Whether a game currently in `current` should take this transition.
    pub fn applies_to(&self, current: GameStatus) -> bool {
        self.expected == Some(current)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            GameStatus::Scheduled,
            GameStatus::InProgress,
            GameStatus::Completed,
            GameStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<GameStatus>(), Ok(status));
        }
        assert!("DONE".parse::<GameStatus>().is_err());
    }

    #[test]
    fn transitions_require_the_preceding_status() {
        let game = GameSessionId::new();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 19, 0, 0).unwrap();

        let begin = GameStatusSchedule::new(game, GameStatus::InProgress, start).transition();
        assert!(begin.applies_to(GameStatus::Scheduled));
        assert!(!begin.applies_to(GameStatus::Cancelled));

        let finish = GameStatusSchedule::new(game, GameStatus::Completed, start).transition();
        assert!(finish.applies_to(GameStatus::InProgress));
        assert!(!finish.applies_to(GameStatus::Scheduled));
        assert!(!finish.applies_to(GameStatus::Completed));
    }

    #[test]
    fn reminder_time_is_offset_from_start() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 19, 0, 0).unwrap();
        let reminder = NotificationSchedule::for_game(GameSessionId::new(), start, 60);

        assert_eq!(reminder.notification_time, start - Duration::minutes(60));
        assert!(!reminder.sent);
    }
}
