//! Row-to-event mapping and per-schedule-type TTL policy.
//!
//! Builders are pure: they read a row and the current time and return the
//! event to publish plus the per-message expiration, without touching the
//! database or the broker.

use chrono::{DateTime, Utc};
use rollcall_core::{
    events::{GAME_REMINDER_DUE, GAME_STATUS_TRANSITION},
    models::{GameStatusSchedule, PendingReminder},
    Event, GameReminderDue, GameStatusTransitionDue,
};

use crate::error::Result;

/// Shortest expiration a reminder is published with.
pub const MIN_REMINDER_TTL_MS: u64 = 60_000;

/// An event ready to publish, with its optional per-message TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltEvent {
    /// Envelope to publish.
    pub event: Event,
    /// Per-message expiration in milliseconds, if any.
    pub ttl_ms: Option<u64>,
}

/// Maps one schedule row to the event it produces.
pub trait EventBuilder<R>: Send + Sync {
    /// Builds the event for `row` as of `now`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::SerializationError` if the payload cannot
    /// be encoded.
    fn build(&self, row: &R, now: DateTime<Utc>) -> Result<BuiltEvent>;
}

/// Reminder expiration: time left until the game starts, never below
/// [`MIN_REMINDER_TTL_MS`]. A reminder for a game with no start time never
/// expires.
pub fn reminder_ttl_ms(starts_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
    let remaining = (starts_at? - now).num_milliseconds();
    let remaining = u64::try_from(remaining).unwrap_or(0);
    Some(remaining.max(MIN_REMINDER_TTL_MS))
}

/// Builds `game.reminder.due` events.
///
/// A reminder is useless once its game has started, so the message expires
/// at the start time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReminderPolicy;

impl EventBuilder<PendingReminder> for ReminderPolicy {
    fn build(&self, row: &PendingReminder, now: DateTime<Utc>) -> Result<BuiltEvent> {
        let payload = GameReminderDue {
            game_session_id: row.schedule.game_session_id,
            reminder_minutes: row.schedule.reminder_minutes,
            scheduled_at: row.game_scheduled_at,
            title: row.game_title.clone(),
            channel_id: row.game_channel_id.clone(),
        };

        let event = Event::with_payload(GAME_REMINDER_DUE, &payload, now)?.traced();
        Ok(BuiltEvent { event, ttl_ms: reminder_ttl_ms(row.game_scheduled_at, now) })
    }
}

/// Builds `game.status.transition` events. They never expire.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusTransitionPolicy;

impl EventBuilder<GameStatusSchedule> for StatusTransitionPolicy {
    fn build(&self, row: &GameStatusSchedule, now: DateTime<Utc>) -> Result<BuiltEvent> {
        let payload = GameStatusTransitionDue {
            game_session_id: row.game_session_id,
            target_status: row.target_status,
            transition_time: row.transition_time,
        };

        let event = Event::with_payload(GAME_STATUS_TRANSITION, &payload, now)?.traced();
        Ok(BuiltEvent { event, ttl_ms: None })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use rollcall_core::models::{GameSessionId, GameStatus, NotificationSchedule};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap()
    }

    fn reminder(starts_at: Option<DateTime<Utc>>) -> PendingReminder {
        let game = GameSessionId::new();
        PendingReminder {
            schedule: NotificationSchedule::for_game(game, now(), 15),
            game_scheduled_at: starts_at,
            game_title: Some("Campaign night".to_string()),
            game_channel_id: None,
        }
    }

    #[test]
    fn reminder_ttl_runs_until_start() {
        let built = ReminderPolicy.build(&reminder(Some(now() + Duration::minutes(15))), now()).unwrap();
        assert_eq!(built.ttl_ms, Some(900_000));
    }

    #[test]
    fn reminder_ttl_is_floored() {
        let soon = ReminderPolicy.build(&reminder(Some(now() + Duration::seconds(10))), now()).unwrap();
        assert_eq!(soon.ttl_ms, Some(MIN_REMINDER_TTL_MS));

        let past = ReminderPolicy.build(&reminder(Some(now() - Duration::hours(1))), now()).unwrap();
        assert_eq!(past.ttl_ms, Some(MIN_REMINDER_TTL_MS));
    }

    #[test]
    fn reminder_without_start_never_expires() {
        let built = ReminderPolicy.build(&reminder(None), now()).unwrap();
        assert_eq!(built.ttl_ms, None);
        assert_eq!(built.event.routing_key(), GAME_REMINDER_DUE);
    }

    #[test]
    fn transition_never_expires() {
        let row = GameStatusSchedule::new(GameSessionId::new(), GameStatus::InProgress, now());
        let built = StatusTransitionPolicy.build(&row, now()).unwrap();

        assert_eq!(built.ttl_ms, None);
        assert_eq!(built.event.event_type, GAME_STATUS_TRANSITION);
        assert_eq!(built.event.data["target_status"], "IN_PROGRESS");
        assert!(built.event.trace_id.is_some());
    }
}
