//! Core domain models and event types.
//!
//! Provides the schedule-row entities, the outbound event envelope, the
//! clock abstraction and repository access shared by the scheduler daemons
//! and their tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{Event, GameReminderDue, GameStatusTransitionDue};
pub use models::{
    GameSession, GameSessionId, GameStatus, GameStatusSchedule, NotificationSchedule,
    NotificationScheduleId, PendingReminder, StatusScheduleId, StatusTransition,
};
pub use time::{Clock, RealClock, TestClock};
