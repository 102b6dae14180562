//! Database access layer for games and their schedule rows.
//!
//! Repositories translate between the domain models and the three tables
//! in [`schema`]. The scheduler daemons use them through a single-connection
//! pool so each daemon holds exactly one database session.

use std::sync::Arc;

use sqlx::PgPool;

pub mod game_status_schedules;
pub mod games;
pub mod notification_schedules;
pub mod schema;

use crate::error::Result;

/// Container for all repository instances sharing one pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for game sessions.
    pub games: Arc<games::Repository>,

    /// Repository for reminder rows.
    pub notification_schedules: Arc<notification_schedules::Repository>,

    /// Repository for status transition rows.
    pub game_status_schedules: Arc<game_status_schedules::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            games: Arc::new(games::Repository::new(pool.clone())),
            notification_schedules: Arc::new(notification_schedules::Repository::new(
                pool.clone(),
            )),
            game_status_schedules: Arc::new(game_status_schedules::Repository::new(pool)),
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.games.pool()
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool()).await?;

        Ok(())
    }
}
