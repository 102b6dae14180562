//! Repository for game session operations.
//!
//! Game sessions belong to the CRUD layer; the scheduler only locks and
//! updates `status` when a transition comes due. The remaining operations
//! exist for collaborators and fixtures.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{GameSession, GameSessionId, GameStatus},
};

/// Repository for game session database operations.
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

    /// Inserts a game session.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the id already exists.
    pub async fn create(&self, game: &GameSession) -> Result<GameSessionId> {
        self.create_impl(&*self.pool, game).await
    }

    /// Inserts a game session within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        game: &GameSession,
    ) -> Result<GameSessionId> {
        self.create_impl(&mut **tx, game).await
    }

    async fn create_impl<'e, E>(&self, executor: E, game: &GameSession) -> Result<GameSessionId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO game_sessions (
                id, title, scheduled_at, duration_minutes, status, channel_id,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(game.id)
        .bind(&game.title)
        .bind(game.scheduled_at)
        .bind(game.duration_minutes)
        .bind(game.status)
        .bind(&game.channel_id)
        .bind(game.created_at)
        .bind(game.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a game session by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: GameSessionId) -> Result<Option<GameSession>> {
        let game = sqlx::query_as::<_, GameSession>(
            r"
            SELECT id, title, scheduled_at, duration_minutes, status, channel_id,
                   created_at, updated_at
            FROM game_sessions
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(game)
    }

    /// Reads a game's status and holds a row lock until the transaction
    /// ends.
    ///
    /// Returns `None` if the game no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn lock_status_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: GameSessionId,
    ) -> Result<Option<GameStatus>> {
        let status = sqlx::query_scalar(
            r"
            SELECT status
            FROM game_sessions
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(status)
    }

    /// Sets a game's status.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the game does not exist.
    pub async fn update_status(&self, id: GameSessionId, status: GameStatus) -> Result<()> {
        self.update_status_impl(&*self.pool, id, status).await
    }

    /// Sets a game's status within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the game does not exist.
    pub async fn update_status_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: GameSessionId,
        status: GameStatus,
    ) -> Result<()> {
        self.update_status_impl(&mut **tx, id, status).await
    }

    async fn update_status_impl<'e, E>(
        &self,
        executor: E,
        id: GameSessionId,
        status: GameStatus,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r"
            UPDATE game_sessions
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(status)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("game session {id}")));
        }

        Ok(())
    }

    /// Cancels a game and removes every pending schedule row for it.
    ///
    /// Sent reminders and executed transitions are kept for history.
    ///
    /// # Errors
    ///
    /// Returns error if any statement fails; nothing is applied in that
    /// case.
    pub async fn cancel(&self, id: GameSessionId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        self.update_status_impl(&mut *tx, id, GameStatus::Cancelled).await?;

        sqlx::query("DELETE FROM notification_schedules WHERE game_session_id = $1 AND sent = FALSE")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM game_status_schedules WHERE game_session_id = $1 AND executed = FALSE",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Deletes a game; both schedule tables cascade.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, id: GameSessionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM game_sessions WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
