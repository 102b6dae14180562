//! Repository for reminder schedule rows.
//!
//! The scheduler reads the single earliest unsent reminder and flips `sent`
//! inside its processing transaction. Collaborators create rows, and on
//! reschedule delete and regenerate them rather than editing times in
//! place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{GameSessionId, NotificationSchedule, NotificationScheduleId, PendingReminder},
};

/// Repository for `notification_schedules`.
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

    /// Inserts a reminder row.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the game already has a
    /// reminder with the same offset, or if the game does not exist.
    pub async fn create(&self, schedule: &NotificationSchedule) -> Result<NotificationScheduleId> {
        self.create_impl(&*self.pool, schedule).await
    }

    async fn create_impl<'e, E>(
        &self,
        executor: E,
        schedule: &NotificationSchedule,
    ) -> Result<NotificationScheduleId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO notification_schedules (
                id, game_session_id, reminder_minutes, notification_time, sent
            ) VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(schedule.id)
        .bind(schedule.game_session_id)
        .bind(schedule.reminder_minutes)
        .bind(schedule.notification_time)
        .bind(schedule.sent)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a reminder by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(
        &self,
        id: NotificationScheduleId,
    ) -> Result<Option<NotificationSchedule>> {
        let schedule = sqlx::query_as::<_, NotificationSchedule>(
            r"
            SELECT id, game_session_id, reminder_minutes, notification_time, sent
            FROM notification_schedules
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(schedule)
    }

    /// Returns the unsent reminder with the earliest due time, joined with
    /// its game.
    ///
    /// Ties on `notification_time` are broken by id so repeated queries
    /// agree.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_earliest_pending(&self) -> Result<Option<PendingReminder>> {
        let row = sqlx::query_as::<_, PendingReminder>(
            r"
            SELECT ns.id, ns.game_session_id, ns.reminder_minutes,
                   ns.notification_time, ns.sent,
                   gs.scheduled_at AS game_scheduled_at,
                   gs.title AS game_title,
                   gs.channel_id AS game_channel_id
            FROM notification_schedules ns
            JOIN game_sessions gs ON gs.id = ns.game_session_id
            WHERE ns.sent = FALSE
              AND ns.notification_time IS NOT NULL
            ORDER BY ns.notification_time ASC, ns.id ASC
            LIMIT 1
            ",
        )
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Locks a reminder for the rest of the transaction if it is still
    /// unsent.
    ///
    /// Returns `false` when another worker already sent it or it was
    /// deleted by a reschedule.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn lock_pending_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: NotificationScheduleId,
    ) -> Result<bool> {
        let locked: Option<NotificationScheduleId> = sqlx::query_scalar(
            r"
            SELECT id FROM notification_schedules
            WHERE id = $1 AND sent = FALSE
            FOR UPDATE
            ",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(locked.is_some())
    }

    /// Marks a reminder as sent within a transaction.
    ///
    /// Returns `false` if the row was already sent or no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_sent_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: NotificationScheduleId,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE notification_schedules
            SET sent = TRUE
            WHERE id = $1 AND sent = FALSE
            ",
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Replaces every reminder of a game with fresh rows for `offsets`.
    ///
    /// Used when a game is rescheduled: the old rows, sent or not, are
    /// deleted and new unsent rows are derived from `starts_at`.
    ///
    /// # Errors
    ///
    /// Returns error if any statement fails; nothing is applied in that
    /// case.
    pub async fn replace_for_game(
        &self,
        game_session_id: GameSessionId,
        starts_at: DateTime<Utc>,
        offsets: &[i32],
    ) -> Result<Vec<NotificationSchedule>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM notification_schedules WHERE game_session_id = $1")
            .bind(game_session_id)
            .execute(&mut *tx)
            .await?;

        let mut created = Vec::with_capacity(offsets.len());
        for &minutes in offsets {
            let schedule = NotificationSchedule::for_game(game_session_id, starts_at, minutes);
            self.create_impl(&mut *tx, &schedule).await?;
            created.push(schedule);
        }

        tx.commit().await?;
        Ok(created)
    }

    /// Counts unsent reminders.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_pending(&self) -> Result<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM notification_schedules WHERE sent = FALSE")
                .fetch_one(&*self.pool)
                .await?;

        Ok(count)
    }
}
