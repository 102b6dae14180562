//! Test infrastructure for the scheduling crates.
//!
//! Provides isolated PostgreSQL databases with the schema applied and
//! builders for games and schedule rows. Database-backed tests read
//! `TEST_DATABASE_URL` and are `#[ignore]`d by default.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod fixtures;

pub use database::TestDatabase;
pub use fixtures::{GameBuilder, ReminderBuilder, TransitionBuilder};
pub use rollcall_core::{
    models::{GameSessionId, GameStatus},
    storage::Storage,
    Clock, TestClock,
};
