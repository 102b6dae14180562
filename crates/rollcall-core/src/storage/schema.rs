//! Idempotent schema setup for the game and schedule tables.
//!
//! Creates the three tables, partial indexes over the pending predicates the
//! daemons query, and the triggers that `NOTIFY` the scheduler whenever a
//! schedule row is inserted, updated or deleted. Every statement is safe to
//! run against an already-migrated database.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

/// Channel notified on any change to `notification_schedules`.
pub const NOTIFICATION_CHANNEL: &str = "notification_schedule_changed";

/// Channel notified on any change to `game_status_schedules`.
pub const GAME_STATUS_CHANNEL: &str = "game_status_schedule_changed";

const STATEMENTS: &[(&str, &str)] = &[
    (
        "game_sessions table",
        r"
        CREATE TABLE IF NOT EXISTS game_sessions (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            title TEXT NOT NULL,
            scheduled_at TIMESTAMPTZ,
            duration_minutes INTEGER,
            status TEXT NOT NULL DEFAULT 'SCHEDULED'
                CHECK (status IN ('SCHEDULED', 'IN_PROGRESS', 'COMPLETED', 'CANCELLED')),
            channel_id TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "notification_schedules table",
        r"
        CREATE TABLE IF NOT EXISTS notification_schedules (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            game_session_id UUID NOT NULL REFERENCES game_sessions(id) ON DELETE CASCADE,
            reminder_minutes INTEGER NOT NULL,
            notification_time TIMESTAMPTZ NOT NULL,
            sent BOOLEAN NOT NULL DEFAULT FALSE,
            UNIQUE (game_session_id, reminder_minutes)
        )
        ",
    ),
    (
        "game_status_schedules table",
        r"
        CREATE TABLE IF NOT EXISTS game_status_schedules (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            game_session_id UUID NOT NULL REFERENCES game_sessions(id) ON DELETE CASCADE,
            target_status TEXT NOT NULL CHECK (target_status IN ('IN_PROGRESS', 'COMPLETED')),
            transition_time TIMESTAMPTZ NOT NULL,
            executed BOOLEAN NOT NULL DEFAULT FALSE,
            UNIQUE (game_session_id, target_status)
        )
        ",
    ),
    (
        "pending reminders index",
        r"
        CREATE INDEX IF NOT EXISTS idx_notification_schedules_pending
            ON notification_schedules (notification_time)
            WHERE sent = FALSE
        ",
    ),
    (
        "pending transitions index",
        r"
        CREATE INDEX IF NOT EXISTS idx_game_status_schedules_pending
            ON game_status_schedules (transition_time)
            WHERE executed = FALSE
        ",
    ),
    (
        "reminder notify function",
        r"
        CREATE OR REPLACE FUNCTION notify_notification_schedule_changed() RETURNS trigger AS $$
        BEGIN
            PERFORM pg_notify(
                'notification_schedule_changed',
                json_build_object('op', TG_OP, 'id', COALESCE(NEW.id, OLD.id))::text
            );
            RETURN NULL;
        END;
        $$ LANGUAGE plpgsql
        ",
    ),
    (
        "reminder notify trigger cleanup",
        "DROP TRIGGER IF EXISTS notification_schedule_changed ON notification_schedules",
    ),
    (
        "reminder notify trigger",
        r"
        CREATE TRIGGER notification_schedule_changed
            AFTER INSERT OR UPDATE OR DELETE ON notification_schedules
            FOR EACH ROW EXECUTE FUNCTION notify_notification_schedule_changed()
        ",
    ),
    (
        "transition notify function",
        r"
        CREATE OR REPLACE FUNCTION notify_game_status_schedule_changed() RETURNS trigger AS $$
        BEGIN
            PERFORM pg_notify(
                'game_status_schedule_changed',
                json_build_object('op', TG_OP, 'id', COALESCE(NEW.id, OLD.id))::text
            );
            RETURN NULL;
        END;
        $$ LANGUAGE plpgsql
        ",
    ),
    (
        "transition notify trigger cleanup",
        "DROP TRIGGER IF EXISTS game_status_schedule_changed ON game_status_schedules",
    ),
    (
        "transition notify trigger",
        r"
        CREATE TRIGGER game_status_schedule_changed
            AFTER INSERT OR UPDATE OR DELETE ON game_status_schedules
            FOR EACH ROW EXECUTE FUNCTION notify_game_status_schedule_changed()
        ",
    ),
];

/// Applies the schema to `pool`.
///
/// # Errors
///
/// Returns `CoreError::Database` with the failing statement's error.
/// Statements applied before it are kept.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for (name, sql) in STATEMENTS {
        debug!(statement = name, "applying schema statement");
        sqlx::query(sql).execute(pool).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_notify_the_published_channels() {
        let bodies: String = STATEMENTS.iter().map(|(_, sql)| *sql).collect();
        assert!(bodies.contains(&format!("'{NOTIFICATION_CHANNEL}'")));
        assert!(bodies.contains(&format!("'{GAME_STATUS_CHANNEL}'")));
    }

    #[test]
    fn every_statement_is_rerunnable() {
        for (name, sql) in STATEMENTS {
            let idempotent = sql.contains("IF NOT EXISTS")
                || sql.contains("OR REPLACE")
                || sql.contains("IF EXISTS")
                || name.ends_with("trigger");
            assert!(idempotent, "{name} cannot be re-applied");
        }
    }
}
