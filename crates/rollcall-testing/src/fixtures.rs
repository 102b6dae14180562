//! Builders for games and schedule rows.
//!
//! Times are always passed explicitly so tests can pin them to a
//! `TestClock`.

use chrono::{DateTime, Duration, Utc};
use rollcall_core::models::{
    GameSession, GameSessionId, GameStatus, GameStatusSchedule, NotificationSchedule,
    PendingReminder,
};

/// Builder for test game sessions.
#[derive(Debug, Clone)]
pub struct GameBuilder {
    id: GameSessionId,
    title: String,
    scheduled_at: Option<DateTime<Utc>>,
    duration_minutes: Option<i32>,
    status: GameStatus,
    channel_id: Option<String>,
}

impl GameBuilder {
    /// A scheduled two-hour game with no start time yet.
    pub fn new() -> Self {
        Self {
            id: GameSessionId::new(),
            title: "Friday one-shot".to_string(),
            scheduled_at: None,
            duration_minutes: Some(120),
            status: GameStatus::Scheduled,
            channel_id: Some("general".to_string()),
        }
    }

    /// Sets the title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the start time.
    #[must_use]
    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn lasting_minutes(mut self, minutes: i32) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }

    /// Sets the current status.
    #[must_use]
    pub fn status(mut self, status: GameStatus) -> Self {
        self.status = status;
        self
    }

    /// Builds the game, stamping creation times with `now`.
    pub fn build_at(self, now: DateTime<Utc>) -> GameSession {
        GameSession {
            id: self.id,
            title: self.title,
            scheduled_at: self.scheduled_at,
            duration_minutes: self.duration_minutes,
            status: self.status,
            channel_id: self.channel_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds the game with the current wall-clock time.
    pub fn build(self) -> GameSession {
        self.build_at(Utc::now())
    }
}

impl Default for GameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for reminder rows, optionally carrying the joined game fields.
#[derive(Debug, Clone)]
pub struct ReminderBuilder {
    game_session_id: GameSessionId,
    reminder_minutes: i32,
    notification_time: DateTime<Utc>,
    game_scheduled_at: Option<DateTime<Utc>>,
}

impl ReminderBuilder {
    /// A 60-minute reminder due at `due` for a game with unknown start.
    pub fn due_at(due: DateTime<Utc>) -> Self {
        Self {
            game_session_id: GameSessionId::new(),
            reminder_minutes: 60,
            notification_time: due,
            game_scheduled_at: None,
        }
    }

    /// Attaches the reminder to a game.
    #[must_use]
    pub fn for_game(mut self, game: &GameSession) -> Self {
        self.game_session_id = game.id;
        self.game_scheduled_at = game.scheduled_at;
        self
    }

    /// Sets the offset in minutes.
    #[must_use]
    pub fn minutes_before(mut self, minutes: i32) -> Self {
        self.reminder_minutes = minutes;
        self
    }

    /// Sets the parent game's start time.
    #[must_use]
    pub fn game_starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.game_scheduled_at = Some(at);
        self
    }

    /// Builds the bare schedule row.
    pub fn schedule(&self) -> NotificationSchedule {
        NotificationSchedule {
            id: rollcall_core::NotificationScheduleId::new(),
            game_session_id: self.game_session_id,
            reminder_minutes: self.reminder_minutes,
            notification_time: self.notification_time,
            sent: false,
        }
    }

    /// Builds the row as the pending-reminder query returns it.
    pub fn pending(&self) -> PendingReminder {
        PendingReminder {
            schedule: self.schedule(),
            game_scheduled_at: self.game_scheduled_at,
            game_title: Some("Friday one-shot".to_string()),
            game_channel_id: Some("general".to_string()),
        }
    }
}

/// Builder for status transition rows.
#[derive(Debug, Clone)]
pub struct TransitionBuilder {
    game_session_id: GameSessionId,
    target_status: GameStatus,
    transition_time: DateTime<Utc>,
}

impl TransitionBuilder {
    /// A transition to `target` due at `due` for a fresh game id.
    pub fn to(target: GameStatus, due: DateTime<Utc>) -> Self {
        Self { game_session_id: GameSessionId::new(), target_status: target, transition_time: due }
    }

    /// Attaches the transition to a game.
    #[must_use]
    pub fn for_game(mut self, id: GameSessionId) -> Self {
        self.game_session_id = id;
        self
    }

    /// Builds the row.
    pub fn build(self) -> GameStatusSchedule {
        GameStatusSchedule::new(self.game_session_id, self.target_status, self.transition_time)
    }
}

/// Shifts `now` by a signed number of seconds.
pub fn seconds_from(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    now + Duration::seconds(seconds)
}
