//! Integration tests for the game and schedule repositories.
//!
//! Each test runs against its own database created from
//! `TEST_DATABASE_URL`.

use chrono::{Duration, TimeZone, Utc};
use rollcall_core::{
    models::{GameStatus, GameStatusSchedule},
    CoreError,
};
use rollcall_testing::{fixtures::seconds_from, GameBuilder, ReminderBuilder, TestDatabase};

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn storage_health_check() {
    let db = TestDatabase::new().await.unwrap();

    assert!(db.storage().health_check().await.is_ok());

    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn earliest_pending_reminder_is_ordered_by_due_time() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();

    let game = GameBuilder::new().starting_at(seconds_from(now, 7200)).build_at(now);
    storage.games.create(&game).await.unwrap();

    let later = ReminderBuilder::due_at(seconds_from(now, 600)).for_game(&game).minutes_before(110);
    let sooner = ReminderBuilder::due_at(seconds_from(now, -60)).for_game(&game).minutes_before(122);
    let later_id = storage.notification_schedules.create(&later.schedule()).await.unwrap();
    let sooner_id = storage.notification_schedules.create(&sooner.schedule()).await.unwrap();

    let first = storage.notification_schedules.find_earliest_pending().await.unwrap().unwrap();
    assert_eq!(first.schedule.id, sooner_id);
    assert_eq!(first.game_scheduled_at, game.scheduled_at);
    assert_eq!(first.game_title.as_deref(), Some(game.title.as_str()));

    let mut tx = db.pool().begin().await.unwrap();
    assert!(storage.notification_schedules.mark_sent_in_tx(&mut tx, sooner_id).await.unwrap());
    assert!(!storage.notification_schedules.mark_sent_in_tx(&mut tx, sooner_id).await.unwrap());
    tx.commit().await.unwrap();

    let next = storage.notification_schedules.find_earliest_pending().await.unwrap().unwrap();
    assert_eq!(next.schedule.id, later_id);
    assert_eq!(storage.notification_schedules.count_pending().await.unwrap(), 1);

    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn duplicate_reminder_offset_is_rejected() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc::now();

    let game = GameBuilder::new().starting_at(seconds_from(now, 3600)).build_at(now);
    storage.games.create(&game).await.unwrap();

    let reminder = ReminderBuilder::due_at(now).for_game(&game).minutes_before(60);
    storage.notification_schedules.create(&reminder.schedule()).await.unwrap();
    let err = storage.notification_schedules.create(&reminder.schedule()).await.unwrap_err();

    assert!(matches!(err, CoreError::ConstraintViolation(_)));

    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn rescheduling_regenerates_reminders() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc::now();
    let start = seconds_from(now, 7200);

    let game = GameBuilder::new().starting_at(start).build_at(now);
    storage.games.create(&game).await.unwrap();
    storage.notification_schedules.replace_for_game(game.id, start, &[60, 15]).await.unwrap();

    let moved = start + Duration::hours(24);
    let rows =
        storage.notification_schedules.replace_for_game(game.id, moved, &[60]).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].notification_time, moved - Duration::minutes(60));
    assert_eq!(storage.notification_schedules.count_pending().await.unwrap(), 1);

    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn status_upsert_resets_executed() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();

    let game = GameBuilder::new().starting_at(now).build_at(now);
    storage.games.create(&game).await.unwrap();
    let (start_id, _) = storage
        .game_status_schedules
        .schedule_game(game.id, now, seconds_from(now, 7200))
        .await
        .unwrap();

    let mut tx = db.pool().begin().await.unwrap();
    storage.game_status_schedules.mark_executed_in_tx(&mut tx, start_id).await.unwrap();
    tx.commit().await.unwrap();

    let moved = seconds_from(now, 86_400);
    let id = storage
        .game_status_schedules
        .upsert(&GameStatusSchedule::new(game.id, GameStatus::InProgress, moved))
        .await
        .unwrap();

    assert_eq!(id, start_id);
    let row = storage.game_status_schedules.find_by_id(id).await.unwrap().unwrap();
    assert!(!row.executed);
    assert_eq!(row.transition_time, moved);

    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn cancelling_removes_pending_rows() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc::now();
    let start = seconds_from(now, 3600);

    let game = GameBuilder::new().starting_at(start).build_at(now);
    storage.games.create(&game).await.unwrap();
    storage.notification_schedules.replace_for_game(game.id, start, &[30]).await.unwrap();
    storage.game_status_schedules.schedule_game(game.id, start, seconds_from(start, 7200)).await.unwrap();

    storage.games.cancel(game.id).await.unwrap();

    let game = storage.games.find_by_id(game.id).await.unwrap().unwrap();
    assert_eq!(game.status, GameStatus::Cancelled);
    assert!(storage.notification_schedules.find_earliest_pending().await.unwrap().is_none());
    assert!(storage.game_status_schedules.find_by_game(game.id).await.unwrap().is_empty());

    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn status_lock_reads_current_status() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();

    let game = GameBuilder::new().status(GameStatus::InProgress).build();
    storage.games.create(&game).await.unwrap();

    let mut tx = db.pool().begin().await.unwrap();
    let status = storage.games.lock_status_in_tx(&mut tx, game.id).await.unwrap();
    assert_eq!(status, Some(GameStatus::InProgress));
    storage.games.update_status_in_tx(&mut tx, game.id, GameStatus::Completed).await.unwrap();
    tx.rollback().await.unwrap();

    let game = storage.games.find_by_id(game.id).await.unwrap().unwrap();
    assert_eq!(game.status, GameStatus::InProgress);

    db.cleanup().await.unwrap();
}
