//! Schedule-table abstraction the daemon loop is generic over.
//!
//! A store is one database session over one schedule table. The daemon
//! asks it for the earliest pending row, then runs a unit of work inside
//! `begin`/`commit`: `apply` performs any row-specific state change and
//! says whether to publish, `mark_processed` flips the row's flag.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::models::{
    GameStatusSchedule, NotificationScheduleId, PendingReminder, StatusScheduleId,
    StatusTransition,
};

use crate::error::Result;

/// A schedule row the daemon can order and process.
pub trait ScheduleRow: Clone + fmt::Debug + Send + Sync + 'static {
    /// Row identifier.
    type Id: Copy + PartialEq + fmt::Display + fmt::Debug + Send + Sync;

    /// Row identifier.
    fn id(&self) -> Self::Id;

    /// When the row becomes due. Rows without a due time are never
    /// selected.
    fn due_time(&self) -> Option<DateTime<Utc>>;

    /// Guarded status change applied with the row, if any.
    fn transition(&self) -> Option<StatusTransition> {
        None
    }
}

impl ScheduleRow for PendingReminder {
    type Id = NotificationScheduleId;

    fn id(&self) -> Self::Id {
        self.schedule.id
    }

    fn due_time(&self) -> Option<DateTime<Utc>> {
        Some(self.schedule.notification_time)
    }
}

impl ScheduleRow for GameStatusSchedule {
    type Id = StatusScheduleId;

    fn id(&self) -> Self::Id {
        self.id
    }

    fn due_time(&self) -> Option<DateTime<Utc>> {
        Some(self.transition_time)
    }

    fn transition(&self) -> Option<StatusTransition> {
        Some(GameStatusSchedule::transition(self))
    }
}

/// Outcome of applying a row inside the unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Publish the event and mark the row.
    Proceed,
    /// Mark the row without publishing; the change no longer applies.
    Moot {
        /// Why the row no longer applies.
        reason: String,
    },
}

/// One database session over one schedule table.
#[async_trait]
pub trait ScheduleStore: Send {
    /// Row type this store yields.
    type Row: ScheduleRow;

    /// Opens the session.
    async fn connect(&mut self) -> Result<()>;

    /// Returns the pending row with the earliest due time.
    async fn find_earliest_pending(&mut self) -> Result<Option<Self::Row>>;

    /// Starts the unit of work.
    async fn begin(&mut self) -> Result<()>;

    /// Locks the row, applies its state change and decides whether to
    /// publish.
    async fn apply(&mut self, row: &Self::Row) -> Result<Disposition>;

    /// Flips the row's processed flag.
    async fn mark_processed(&mut self, row: &Self::Row) -> Result<()>;

    /// Commits the unit of work.
    async fn commit(&mut self) -> Result<()>;

    /// Rolls the unit of work back. A no-op outside a unit of work.
    async fn rollback(&mut self) -> Result<()>;

    /// Discards the session and opens a new one.
    async fn reconnect(&mut self) -> Result<()>;

    /// Closes the session. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

pub mod mock {
    //! In-memory schedule store for testing the daemon loop.
    //!
    //! Holds rows and game statuses in shared state so a test keeps a clone
    //! for assertions while the daemon owns another. Marks and status
    //! changes are staged until `commit`, so rollback behaves like the
    //! database.

    use std::{collections::HashMap, sync::Arc};

    use async_trait::async_trait;
    use rollcall_core::models::{GameSessionId, GameStatus};
    use tokio::sync::RwLock;

    use super::{Disposition, ScheduleRow, ScheduleStore};
    use crate::error::{Result, SchedulerError};

    #[derive(Debug)]
    struct Entry<R> {
        row: R,
        processed: bool,
    }

    #[derive(Debug)]
    struct State<R: ScheduleRow> {
        rows: Vec<Entry<R>>,
        games: HashMap<GameSessionId, GameStatus>,
        in_unit: bool,
        staged_marks: Vec<R::Id>,
        staged_status: Vec<(GameSessionId, GameStatus)>,
        query_failures: usize,
        fail_commit: bool,
        fail_mark: bool,
        fail_close: bool,
        queries: usize,
        commits: usize,
        rollbacks: usize,
        reconnects: usize,
        closes: usize,
    }

    /// In-memory [`ScheduleStore`]. Clones share state.
    #[derive(Debug)]
    pub struct MemoryStore<R: ScheduleRow> {
        state: Arc<RwLock<State<R>>>,
    }

    impl<R: ScheduleRow> Clone for MemoryStore<R> {
        fn clone(&self) -> Self {
            Self { state: self.state.clone() }
        }
    }

    impl<R: ScheduleRow> Default for MemoryStore<R> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<R: ScheduleRow> MemoryStore<R> {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self {
                state: Arc::new(RwLock::new(State {
                    rows: Vec::new(),
                    games: HashMap::new(),
                    in_unit: false,
                    staged_marks: Vec::new(),
                    staged_status: Vec::new(),
                    query_failures: 0,
                    fail_commit: false,
                    fail_mark: false,
                    fail_close: false,
                    queries: 0,
                    commits: 0,
                    rollbacks: 0,
                    reconnects: 0,
                    closes: 0,
                })),
            }
        }

        /// Adds a pending row.
        pub async fn insert(&self, row: R) {
            self.state.write().await.rows.push(Entry { row, processed: false });
        }

        /// Sets a game's current status.
        pub async fn set_game_status(&self, game: GameSessionId, status: GameStatus) {
            self.state.write().await.games.insert(game, status);
        }

        /// Returns a game's committed status.
        pub async fn game_status(&self, game: GameSessionId) -> Option<GameStatus> {
            self.state.read().await.games.get(&game).copied()
        }

        /// Whether a row's flag has been committed.
        pub async fn is_processed(&self, id: R::Id) -> bool {
            self.state.read().await.rows.iter().any(|e| e.row.id() == id && e.processed)
        }

        /// Number of rows not yet processed.
        pub async fn pending_count(&self) -> usize {
            self.state.read().await.rows.iter().filter(|e| !e.processed).count()
        }

        /// Makes the next `n` queries fail.
        pub async fn fail_next_queries(&self, n: usize) {
            self.state.write().await.query_failures = n;
        }

        /// Makes the next commit fail.
        pub async fn fail_next_commit(&self) {
            self.state.write().await.fail_commit = true;
        }

        /// Makes the next `mark_processed` fail.
        pub async fn fail_next_mark(&self) {
            self.state.write().await.fail_mark = true;
        }

        /// Makes `close` fail.
        pub async fn fail_close(&self) {
            self.state.write().await.fail_close = true;
        }

        /// Counters: (queries, commits, rollbacks, reconnects, closes).
        pub async fn counters(&self) -> (usize, usize, usize, usize, usize) {
            let s = self.state.read().await;
            (s.queries, s.commits, s.rollbacks, s.reconnects, s.closes)
        }
    }

    #[async_trait]
    impl<R: ScheduleRow> ScheduleStore for MemoryStore<R> {
        type Row = R;

        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn find_earliest_pending(&mut self) -> Result<Option<R>> {
            let mut state = self.state.write().await;
            state.queries += 1;
            if state.query_failures > 0 {
                state.query_failures -= 1;
                return Err(SchedulerError::database("server closed the connection"));
            }

            // Stable: first inserted wins ties
            let earliest = state
                .rows
                .iter()
                .filter(|e| !e.processed)
                .filter_map(|e| e.row.due_time().map(|due| (due, &e.row)))
                .fold(None::<(chrono::DateTime<chrono::Utc>, &R)>, |best, (due, row)| match best {
                    Some((best_due, _)) if best_due <= due => best,
                    _ => Some((due, row)),
                })
                .map(|(_, row)| row.clone());

            Ok(earliest)
        }

        async fn begin(&mut self) -> Result<()> {
            let mut state = self.state.write().await;
            state.in_unit = true;
            state.staged_marks.clear();
            state.staged_status.clear();
            Ok(())
        }

        async fn apply(&mut self, row: &R) -> Result<Disposition> {
            let mut state = self.state.write().await;

            let pending = state.rows.iter().any(|e| e.row.id() == row.id() && !e.processed);
            if !pending {
                return Ok(Disposition::Moot { reason: "row no longer pending".to_string() });
            }

            let Some(transition) = row.transition() else {
                return Ok(Disposition::Proceed);
            };

            match state.games.get(&transition.game_session_id).copied() {
                Some(current) if transition.applies_to(current) => {
                    state.staged_status.push((transition.game_session_id, transition.target));
                    Ok(Disposition::Proceed)
                },
                Some(current) => Ok(Disposition::Moot {
                    reason: format!("game is {current}, not {:?}", transition.expected),
                }),
                None => Ok(Disposition::Moot { reason: "game no longer exists".to_string() }),
            }
        }

        async fn mark_processed(&mut self, row: &R) -> Result<()> {
            let mut state = self.state.write().await;
            if state.fail_mark {
                state.fail_mark = false;
                return Err(SchedulerError::database("update failed"));
            }
            state.staged_marks.push(row.id());
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            let mut state = self.state.write().await;
            if state.fail_commit {
                state.fail_commit = false;
                return Err(SchedulerError::database("commit failed"));
            }

            let marks = std::mem::take(&mut state.staged_marks);
            for entry in &mut state.rows {
                if marks.contains(&entry.row.id()) {
                    entry.processed = true;
                }
            }
            let statuses = std::mem::take(&mut state.staged_status);
            for (game, status) in statuses {
                state.games.insert(game, status);
            }

            state.in_unit = false;
            state.commits += 1;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            let mut state = self.state.write().await;
            if state.in_unit {
                state.staged_marks.clear();
                state.staged_status.clear();
                state.in_unit = false;
                state.rollbacks += 1;
            }
            Ok(())
        }

        async fn reconnect(&mut self) -> Result<()> {
            let mut state = self.state.write().await;
            state.reconnects += 1;
            state.in_unit = false;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            let mut state = self.state.write().await;
            state.closes += 1;
            if state.fail_close {
                return Err(SchedulerError::database("close failed"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use rollcall_core::models::{GameSessionId, GameStatus};

    use super::{mock::MemoryStore, *};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[tokio::test]
    async fn earliest_row_wins_and_ties_keep_insertion_order() {
        let mut store = MemoryStore::new();
        let game = GameSessionId::new();
        let late = GameStatusSchedule::new(game, GameStatus::Completed, at(10));
        let first = GameStatusSchedule::new(game, GameStatus::InProgress, at(1));
        let tie = GameStatusSchedule::new(GameSessionId::new(), GameStatus::InProgress, at(1));
        store.insert(late).await;
        store.insert(first.clone()).await;
        store.insert(tie).await;

        let found = store.find_earliest_pending().await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn rollback_discards_staged_changes() {
        let mut store = MemoryStore::new();
        let game = GameSessionId::new();
        let row = GameStatusSchedule::new(game, GameStatus::InProgress, at(0));
        store.insert(row.clone()).await;
        store.set_game_status(game, GameStatus::Scheduled).await;

        store.begin().await.unwrap();
        assert_eq!(store.apply(&row).await.unwrap(), Disposition::Proceed);
        store.mark_processed(&row).await.unwrap();
        store.rollback().await.unwrap();

        assert!(!store.is_processed(row.id).await);
        assert_eq!(store.game_status(game).await, Some(GameStatus::Scheduled));
    }

    #[tokio::test]
    async fn transition_from_wrong_status_is_moot() {
        let mut store = MemoryStore::new();
        let game = GameSessionId::new();
        let row = GameStatusSchedule::new(game, GameStatus::Completed, at(0));
        store.insert(row.clone()).await;
        store.set_game_status(game, GameStatus::Cancelled).await;

        store.begin().await.unwrap();
        let disposition = store.apply(&row).await.unwrap();

        assert!(matches!(disposition, Disposition::Moot { .. }));
    }
}
