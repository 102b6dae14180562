//! Database management for integration tests.
//!
//! Every [`TestDatabase`] is a fresh PostgreSQL database created next to the
//! one named by `TEST_DATABASE_URL`, with the schema applied. The scheduler
//! queries "earliest pending row" across a whole table, so tests must not
//! share one.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rollcall_core::storage::{schema, Storage};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable naming the server used for test databases.
pub const TEST_DATABASE_URL_ENV: &str = "TEST_DATABASE_URL";

static ADMIN_POOL: tokio::sync::OnceCell<PgPool> = tokio::sync::OnceCell::const_new();

// Limits concurrent CREATE DATABASE statements
static DB_CREATION_SEMAPHORE: Semaphore = Semaphore::const_new(3);

/// Isolated test database with the rollcall schema applied.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    options: PgConnectOptions,
    database_name: String,
}

impl TestDatabase {
    /// Creates a fresh database and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns error if `TEST_DATABASE_URL` is unset or the server is
    /// unreachable.
    pub async fn new() -> Result<Self> {
        let start = Instant::now();
        let admin_pool = admin_pool().await?;
        let database_name = format!("rollcall_test_{}", Uuid::new_v4().simple());

        {
            let _permit = DB_CREATION_SEMAPHORE
                .acquire()
                .await
                .context("database creation semaphore closed")?;

            sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
                .execute(&admin_pool)
                .await
                .with_context(|| format!("failed to create database {database_name}"))?;
        }

        let options = base_options()?.database(&database_name);
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options.clone())
            .await
            .with_context(|| format!("failed to connect to {database_name}"))?;

        schema::run_migrations(&pool).await.context("failed to apply schema")?;

        let elapsed = start.elapsed();
        if elapsed > Duration::from_millis(500) {
            warn!("test database {} took {}ms to prepare", database_name, elapsed.as_millis());
        } else {
            info!("created test database {}", database_name);
        }

        Ok(Self { pool, options, database_name })
    }

    /// Access to the database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connection options for opening dedicated sessions, as the daemons do.
    pub fn connect_options(&self) -> PgConnectOptions {
        self.options.clone()
    }

    /// Repositories over this database.
    pub fn storage(&self) -> Storage {
        Storage::new(self.pool.clone())
    }

    /// Name of the database.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Closes all connections and drops the database.
    ///
    /// # Errors
    ///
    /// Returns error if the drop fails.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;
        let admin_pool = admin_pool().await?;

        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.database_name))
            .execute(&admin_pool)
            .await
            .with_context(|| format!("failed to drop database {}", self.database_name))?;

        debug!("dropped test database {}", self.database_name);
        Ok(())
    }
}

fn base_options() -> Result<PgConnectOptions> {
    let url = std::env::var(TEST_DATABASE_URL_ENV)
        .with_context(|| format!("{TEST_DATABASE_URL_ENV} environment variable is required"))?;

    url.parse::<PgConnectOptions>().with_context(|| format!("failed to parse {TEST_DATABASE_URL_ENV}"))
}

async fn admin_pool() -> Result<PgPool> {
    if let Some(pool) = ADMIN_POOL.get() {
        if !pool.is_closed() {
            return Ok(pool.clone());
        }
    }

    let pool = ADMIN_POOL
        .get_or_try_init(|| async {
            let opts = base_options()?.database("postgres");

            let pool = PgPoolOptions::new()
                .max_connections(2)
                .min_connections(0)
                .acquire_timeout(Duration::from_secs(3))
                .connect_with(opts)
                .await
                .context("failed to connect to admin database")?;

            anyhow::Ok(pool)
        })
        .await?;

    Ok(pool.clone())
}
