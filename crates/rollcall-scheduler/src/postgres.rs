//! PostgreSQL-backed schedule stores.
//!
//! Each store owns a single-connection pool, so a daemon holds exactly one
//! query session next to its notifier session. The unit of work runs in
//! one transaction on that connection; between units the connection is
//! idle.

use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::{
    models::{GameStatusSchedule, PendingReminder},
    storage::Storage,
};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    Postgres, Transaction,
};
use tracing::{debug, warn};

use crate::{
    error::{Result, SchedulerError},
    store::{Disposition, ScheduleStore},
};

/// One database session with an optional open transaction.
struct Session {
    options: PgConnectOptions,
    storage: Option<Storage>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl Session {
    fn new(options: PgConnectOptions) -> Self {
        Self { options, storage: None, tx: None }
    }

    fn open(&mut self) {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy_with(self.options.clone());
        self.storage = Some(Storage::new(pool));
    }

    async fn connect(&mut self) -> Result<()> {
        if self.storage.is_none() {
            self.open();
        }
        self.storage()?.health_check().await?;
        Ok(())
    }

    fn storage(&self) -> Result<&Storage> {
        self.storage.as_ref().ok_or_else(|| SchedulerError::database("store is not connected"))
    }

    fn in_tx(&mut self) -> Result<(&Storage, &mut Transaction<'static, Postgres>)> {
        let storage =
            self.storage.as_ref().ok_or_else(|| SchedulerError::database("store is not connected"))?;
        let tx = self.tx.as_mut().ok_or_else(|| SchedulerError::internal("no open transaction"))?;
        Ok((storage, tx))
    }

    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(SchedulerError::internal("transaction already open"));
        }
        let tx = self.storage()?.pool().begin().await?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| SchedulerError::internal("no open transaction"))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "rollback on close failed");
            }
        }
        if let Some(storage) = self.storage.take() {
            storage.pool().close().await;
            debug!("schedule store closed");
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.close().await;
        self.open();
        self.storage()?.health_check().await?;
        Ok(())
    }
}

/// Store over `notification_schedules`.
pub struct ReminderStore {
    session: Session,
}

impl ReminderStore {
    /// Creates a disconnected store.
    pub fn new(options: PgConnectOptions) -> Self {
        Self { session: Session::new(options) }
    }
}

#[async_trait]
impl ScheduleStore for ReminderStore {
    type Row = PendingReminder;

    async fn connect(&mut self) -> Result<()> {
        self.session.connect().await
    }

    async fn find_earliest_pending(&mut self) -> Result<Option<PendingReminder>> {
        let row = self.session.storage()?.notification_schedules.find_earliest_pending().await?;
        Ok(row)
    }

    async fn begin(&mut self) -> Result<()> {
        self.session.begin().await
    }

    async fn apply(&mut self, row: &PendingReminder) -> Result<Disposition> {
        let (storage, tx) = self.session.in_tx()?;
        let pending =
            storage.notification_schedules.lock_pending_in_tx(tx, row.schedule.id).await?;

        if pending {
            Ok(Disposition::Proceed)
        } else {
            Ok(Disposition::Moot { reason: "reminder already sent or removed".to_string() })
        }
    }

    async fn mark_processed(&mut self, row: &PendingReminder) -> Result<()> {
        let (storage, tx) = self.session.in_tx()?;
        if !storage.notification_schedules.mark_sent_in_tx(tx, row.schedule.id).await? {
            debug!(schedule_id = %row.schedule.id, "reminder was already marked sent");
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.session.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.session.rollback().await
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.session.reconnect().await
    }

    async fn close(&mut self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }
}

/// Store over `game_status_schedules`.
///
/// Applying a row also performs the guarded status update on the game in
/// the same transaction, so the status change and the `executed` flag
/// commit together.
pub struct StatusStore {
    session: Session,
}

impl StatusStore {
    /// Creates a disconnected store.
    pub fn new(options: PgConnectOptions) -> Self {
        Self { session: Session::new(options) }
    }
}

#[async_trait]
impl ScheduleStore for StatusStore {
    type Row = GameStatusSchedule;

    async fn connect(&mut self) -> Result<()> {
        self.session.connect().await
    }

    async fn find_earliest_pending(&mut self) -> Result<Option<GameStatusSchedule>> {
        let row = self.session.storage()?.game_status_schedules.find_earliest_pending().await?;
        Ok(row)
    }

    async fn begin(&mut self) -> Result<()> {
        self.session.begin().await
    }

    async fn apply(&mut self, row: &GameStatusSchedule) -> Result<Disposition> {
        let (storage, tx) = self.session.in_tx()?;

        if !storage.game_status_schedules.lock_pending_in_tx(tx, row.id).await? {
            return Ok(Disposition::Moot {
                reason: "transition already executed or removed".to_string(),
            });
        }

        let transition = row.transition();
        let Some(current) = storage.games.lock_status_in_tx(tx, transition.game_session_id).await?
        else {
            return Ok(Disposition::Moot { reason: "game no longer exists".to_string() });
        };

        if !transition.applies_to(current) {
            return Ok(Disposition::Moot {
                reason: format!("game is {current}, cannot move to {}", transition.target),
            });
        }

        storage.games.update_status_in_tx(tx, transition.game_session_id, transition.target).await?;
        Ok(Disposition::Proceed)
    }

    async fn mark_processed(&mut self, row: &GameStatusSchedule) -> Result<()> {
        let (storage, tx) = self.session.in_tx()?;
        if !storage.game_status_schedules.mark_executed_in_tx(tx, row.id).await? {
            debug!(schedule_id = %row.id, "transition was already marked executed");
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.session.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.session.rollback().await
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.session.reconnect().await
    }

    async fn close(&mut self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }
}
