//! Schedule stores against a real PostgreSQL database.
//!
//! Ignored by default; run with `TEST_DATABASE_URL` pointing at a server
//! the tests may create databases on.

use chrono::{TimeZone, Utc};
use rollcall_scheduler::{Disposition, ReminderStore, ScheduleStore, StatusStore};
use rollcall_testing::{
    fixtures::seconds_from, GameBuilder, GameStatus, ReminderBuilder, TestDatabase,
    TransitionBuilder,
};

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn completion_and_executed_flag_commit_together() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();

    let game = GameBuilder::new()
        .starting_at(seconds_from(now, -3600))
        .lasting_minutes(60)
        .status(GameStatus::InProgress)
        .build_at(now);
    storage.games.create(&game).await.unwrap();
    let row = TransitionBuilder::to(GameStatus::Completed, now).for_game(game.id).build();
    storage.game_status_schedules.upsert(&row).await.unwrap();

    let mut store = StatusStore::new(db.connect_options());
    store.connect().await.unwrap();
    let due = store.find_earliest_pending().await.unwrap().unwrap();
    assert_eq!(due.id, row.id);

    store.begin().await.unwrap();
    assert_eq!(store.apply(&due).await.unwrap(), Disposition::Proceed);
    store.mark_processed(&due).await.unwrap();
    store.commit().await.unwrap();

    let game_after = storage.games.find_by_id(game.id).await.unwrap().unwrap();
    assert_eq!(game_after.status, GameStatus::Completed);
    assert!(storage.game_status_schedules.find_by_id(row.id).await.unwrap().unwrap().executed);
    assert!(store.find_earliest_pending().await.unwrap().is_none());

    store.close().await.unwrap();
    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn rolled_back_transition_leaves_game_untouched() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();

    let game = GameBuilder::new().starting_at(now).build_at(now);
    storage.games.create(&game).await.unwrap();
    let row = TransitionBuilder::to(GameStatus::InProgress, now).for_game(game.id).build();
    storage.game_status_schedules.upsert(&row).await.unwrap();

    let mut store = StatusStore::new(db.connect_options());
    store.connect().await.unwrap();

    store.begin().await.unwrap();
    assert_eq!(store.apply(&row).await.unwrap(), Disposition::Proceed);
    store.rollback().await.unwrap();

    let game_after = storage.games.find_by_id(game.id).await.unwrap().unwrap();
    assert_eq!(game_after.status, GameStatus::Scheduled);
    let pending = store.find_earliest_pending().await.unwrap().unwrap();
    assert_eq!(pending.id, row.id);

    store.close().await.unwrap();
    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn transition_for_cancelled_game_is_moot() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();

    let game = GameBuilder::new().starting_at(now).status(GameStatus::Cancelled).build_at(now);
    storage.games.create(&game).await.unwrap();
    let row = TransitionBuilder::to(GameStatus::InProgress, now).for_game(game.id).build();
    storage.game_status_schedules.upsert(&row).await.unwrap();

    let mut store = StatusStore::new(db.connect_options());
    store.connect().await.unwrap();
    store.begin().await.unwrap();
    let disposition = store.apply(&row).await.unwrap();
    assert!(matches!(disposition, Disposition::Moot { .. }));
    store.mark_processed(&row).await.unwrap();
    store.commit().await.unwrap();

    let game_after = storage.games.find_by_id(game.id).await.unwrap().unwrap();
    assert_eq!(game_after.status, GameStatus::Cancelled);
    assert!(store.find_earliest_pending().await.unwrap().is_none());

    store.close().await.unwrap();
    db.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn sent_reminder_is_moot_on_second_apply() {
    let db = TestDatabase::new().await.unwrap();
    let storage = db.storage();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();

    let game = GameBuilder::new().starting_at(seconds_from(now, 3600)).build_at(now);
    storage.games.create(&game).await.unwrap();
    let reminder = ReminderBuilder::due_at(now).for_game(&game).minutes_before(60);
    storage.notification_schedules.create(&reminder.schedule()).await.unwrap();

    let mut store = ReminderStore::new(db.connect_options());
    store.connect().await.unwrap();
    let due = store.find_earliest_pending().await.unwrap().unwrap();

    store.begin().await.unwrap();
    assert_eq!(store.apply(&due).await.unwrap(), Disposition::Proceed);
    store.mark_processed(&due).await.unwrap();
    store.commit().await.unwrap();

    store.begin().await.unwrap();
    assert!(matches!(store.apply(&due).await.unwrap(), Disposition::Moot { .. }));
    store.rollback().await.unwrap();

    assert!(store.find_earliest_pending().await.unwrap().is_none());

    store.close().await.unwrap();
    db.cleanup().await.unwrap();
}
