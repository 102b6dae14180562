//! Repository for status transition schedule rows.
//!
//! Unlike reminders, transition rows are updated in place: rescheduling a
//! game moves `transition_time` and resets `executed`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{GameSessionId, GameStatus, GameStatusSchedule, StatusScheduleId},
};

/// Repository for `game_status_schedules`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a transition, or moves an existing one for the same game and
    /// target and marks it pending again.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the game does not exist
    /// or the target status is not schedulable.
    pub async fn upsert(&self, schedule: &GameStatusSchedule) -> Result<StatusScheduleId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO game_status_schedules (
                id, game_session_id, target_status, transition_time, executed
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (game_session_id, target_status)
            DO UPDATE SET transition_time = EXCLUDED.transition_time,
                          executed = FALSE
            RETURNING id
            ",
        )
        .bind(schedule.id)
        .bind(schedule.game_session_id)
        .bind(schedule.target_status)
        .bind(schedule.transition_time)
        .bind(schedule.executed)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Schedules the start and completion transitions of a game.
    ///
    /// # Errors
    ///
    /// Returns error if either upsert fails.
    pub async fn schedule_game(
        &self,
        game_session_id: GameSessionId,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<(StatusScheduleId, StatusScheduleId)> {
        let start = self
            .upsert(&GameStatusSchedule::new(game_session_id, GameStatus::InProgress, starts_at))
            .await?;
        let end = self
            .upsert(&GameStatusSchedule::new(game_session_id, GameStatus::Completed, ends_at))
            .await?;

        Ok((start, end))
    }

    /// Finds a transition by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: StatusScheduleId) -> Result<Option<GameStatusSchedule>> {
        let schedule = sqlx::query_as::<_, GameStatusSchedule>(
            r"
            SELECT id, game_session_id, target_status, transition_time, executed
            FROM game_status_schedules
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(schedule)
    }

    /// Returns the unexecuted transition with the earliest due time.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_earliest_pending(&self) -> Result<Option<GameStatusSchedule>> {
        let row = sqlx::query_as::<_, GameStatusSchedule>(
            r"
            SELECT id, game_session_id, target_status, transition_time, executed
            FROM game_status_schedules
            WHERE executed = FALSE
              AND transition_time IS NOT NULL
            ORDER BY transition_time ASC, id ASC
            LIMIT 1
            ",
        )
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Locks a transition for the rest of the transaction if it is still
    /// unexecuted.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn lock_pending_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: StatusScheduleId,
    ) -> Result<bool> {
        let locked: Option<StatusScheduleId> = sqlx::query_scalar(
            r"
            SELECT id FROM game_status_schedules
            WHERE id = $1 AND executed = FALSE
            FOR UPDATE
            ",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(locked.is_some())
    }

    /// Marks a transition as executed within a transaction.
    ///
    /// Returns `false` if the row was already executed or no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_executed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: StatusScheduleId,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE game_status_schedules
            SET executed = TRUE
            WHERE id = $1 AND executed = FALSE
            ",
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Lists every transition of a game, earliest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_game(
        &self,
        game_session_id: GameSessionId,
    ) -> Result<Vec<GameStatusSchedule>> {
        let rows = sqlx::query_as::<_, GameStatusSchedule>(
            r"
            SELECT id, game_session_id, target_status, transition_time, executed
            FROM game_status_schedules
            WHERE game_session_id = $1
            ORDER BY transition_time ASC
            ",
        )
        .bind(game_session_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }
}
