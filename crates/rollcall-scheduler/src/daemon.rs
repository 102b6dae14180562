//! Generic scheduler daemon.
//!
//! One daemon drives one schedule table. Each iteration looks at the single
//! earliest pending row: if it is due, the row is processed as one unit of
//! work; otherwise the daemon blocks on its change notifier until the row
//! comes due, a schedule change is announced, or the idle interval passes.
//!
//! # State Machine
//!
//! ```text
//!  Disconnected ──start──▶ Connected ──▶ ┌──────────┐ ◀──▶ ┌────────────┐
//!                                         │ Waiting  │      │ Processing │
//!                                         └──────────┘      └────────────┘
//!                                               │ cancellation token
//!                                               ▼
//!                                         ShuttingDown ──▶ Terminated
//! ```
//!
//! Rows are processed strictly in due-time order. Because selection is by
//! "not yet processed" rather than by time window, rows that came due while
//! the daemon was down are picked up on the first iterations after a
//! restart.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use rollcall_core::Clock;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broker::MessageBroker,
    builder::EventBuilder,
    dead_letter::DeadLetterDrainer,
    error::Result,
    notifier::ChangeNotifier,
    store::{Disposition, ScheduleRow, ScheduleStore},
};

/// Default upper bound on a single idle wait.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(300);

/// Default pause after a failed iteration.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How long to wait before looking at the schedule again.
///
/// Never negative and never longer than `max_idle`; with no pending row the
/// daemon idles for the full `max_idle`.
pub fn compute_wait(
    due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_idle: Duration,
) -> Duration {
    due.map_or(max_idle, |due| (due - now).to_std().unwrap_or(Duration::ZERO).min(max_idle))
}

/// Daemon tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Notification channel announcing changes to the schedule table.
    pub channel: String,
    /// Upper bound on a single idle wait.
    pub max_idle: Duration,
    /// Pause after a failed iteration.
    pub error_backoff: Duration,
}

impl DaemonConfig {
    /// Creates a config for `channel` with default intervals.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            max_idle: DEFAULT_MAX_IDLE,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

/// Lifecycle state of a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DaemonState {
    /// Not yet started.
    Disconnected,
    /// Sessions open, loop not yet entered.
    Connected,
    /// Blocked on the change notifier.
    Waiting,
    /// Inside a unit of work.
    Processing,
    /// Closing sessions.
    ShuttingDown,
    /// Stopped.
    Terminated,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Waiting => write!(f, "waiting"),
            Self::Processing => write!(f, "processing"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// What the loop should do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Go straight to the next iteration.
    Continue,
    /// Pause for the error backoff first.
    RetryAfterBackoff,
    /// Stop the loop.
    FatalShutdown,
}

/// Counters for daemon monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    /// Rows published and marked.
    pub rows_processed: u64,
    /// Rows marked without publishing because they no longer applied.
    pub moot_transitions: u64,
    /// Units of work rolled back.
    pub processing_failures: u64,
    /// Iterations whose schedule query failed even after a session rebuild.
    pub query_failures: u64,
    /// Embedded drain passes run.
    pub drains_run: u64,
    /// When the last row was processed.
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Id of the last row processed.
    pub last_row_id: Option<String>,
}

struct EmbeddedDrain {
    drainer: DeadLetterDrainer,
    interval: Duration,
    last_run: Option<Instant>,
}

/// Scheduler loop over one schedule table.
pub struct SchedulerDaemon<S, E> {
    store: S,
    builder: E,
    notifier: Box<dyn ChangeNotifier>,
    broker: Box<dyn MessageBroker>,
    config: DaemonConfig,
    drain: Option<EmbeddedDrain>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<DaemonStats>>,
    state: DaemonState,
    cancellation_token: CancellationToken,
}

impl<S, E> SchedulerDaemon<S, E>
where
    S: ScheduleStore,
    E: EventBuilder<S::Row>,
{
    /// Creates a daemon. Nothing is connected until [`Self::start`].
    pub fn new(
        store: S,
        builder: E,
        notifier: Box<dyn ChangeNotifier>,
        broker: Box<dyn MessageBroker>,
        config: DaemonConfig,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            builder,
            notifier,
            broker,
            config,
            drain: None,
            clock,
            stats: Arc::new(RwLock::new(DaemonStats::default())),
            state: DaemonState::Disconnected,
            cancellation_token,
        }
    }

    /// Drains dead-letter queues on start and then every `interval`.
    #[must_use]
    pub fn with_embedded_drain(mut self, drainer: DeadLetterDrainer, interval: Duration) -> Self {
        self.drain = Some(EmbeddedDrain { drainer, interval, last_run: None });
        self
    }

    /// Shared stats handle.
    pub fn stats(&self) -> Arc<RwLock<DaemonStats>> {
        self.stats.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Opens the notifier, broker and store sessions, then runs the initial
    /// embedded drain if one is configured.
    ///
    /// # Errors
    ///
    /// Returns the first connection failure.
    pub async fn start(&mut self) -> Result<()> {
        self.notifier.connect().await?;
        self.notifier.subscribe(&self.config.channel).await?;
        self.broker.connect().await?;
        self.store.connect().await?;
        self.state = DaemonState::Connected;

        info!(
            channel = %self.config.channel,
            max_idle_secs = self.config.max_idle.as_secs(),
            "scheduler daemon connected"
        );

        self.maybe_drain().await;
        Ok(())
    }

    /// Runs until the cancellation token fires, then closes every session.
    ///
    /// Connection failures at start and inside the loop are logged and
    /// retried after the error backoff; the daemon only exits on shutdown.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok` once shut down.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.start().await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        error = %e,
                        retryable = e.is_retryable(),
                        "scheduler daemon failed to start"
                    );
                    if !self.backoff().await {
                        self.shutdown().await;
                        return Ok(());
                    }
                },
            }
        }

        loop {
            match self.run_iteration().await {
                IterationOutcome::Continue => {},
                IterationOutcome::RetryAfterBackoff => {
                    if !self.backoff().await {
                        break;
                    }
                },
                IterationOutcome::FatalShutdown => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Sleeps for the error backoff. Returns `false` if cancelled instead.
    async fn backoff(&self) -> bool {
        tokio::select! {
            () = self.clock.sleep(self.config.error_backoff) => true,
            () = self.cancellation_token.cancelled() => false,
        }
    }

    /// Runs one iteration of the loop.
    pub async fn run_iteration(&mut self) -> IterationOutcome {
        if self.cancellation_token.is_cancelled() {
            info!("scheduler daemon received shutdown signal");
            return IterationOutcome::FatalShutdown;
        }

        let row = match self.find_earliest().await {
            Ok(row) => row,
            Err(e) => {
                error!(error = %e, category = %e.category(), "schedule query failed");
                self.stats.write().await.query_failures += 1;
                return IterationOutcome::RetryAfterBackoff;
            },
        };

        let now = self.clock.now_utc();
        let due = row.as_ref().and_then(|r| r.due_time());

        let outcome = match row {
            Some(row) if due.is_some_and(|due| due <= now) => {
                self.state = DaemonState::Processing;
                match self.process(&row, now).await {
                    Ok(()) => IterationOutcome::Continue,
                    Err(e) => {
                        error!(
                            row_id = %row.id(),
                            error = %e,
                            category = %e.category(),
                            retryable = e.is_retryable(),
                            "row processing failed, left pending"
                        );
                        IterationOutcome::RetryAfterBackoff
                    },
                }
            },
            _ => {
                let wait = compute_wait(due, now, self.config.max_idle);
                let timeout = self.until_next_drain().map_or(wait, |left| wait.min(left));
                self.state = DaemonState::Waiting;
                self.wait(timeout).await
            },
        };

        if outcome != IterationOutcome::FatalShutdown {
            self.maybe_drain().await;
        }
        outcome
    }

    /// Queries the earliest pending row, rebuilding the store session once
    /// if the query fails.
    async fn find_earliest(&mut self) -> Result<Option<S::Row>> {
        match self.store.find_earliest_pending().await {
            Ok(row) => Ok(row),
            Err(e) => {
                warn!(error = %e, "schedule query failed, rebuilding store session");
                self.store.reconnect().await?;
                self.store.find_earliest_pending().await
            },
        }
    }

    async fn wait(&mut self, timeout: Duration) -> IterationOutcome {
        debug!(timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "waiting");

        tokio::select! {
            result = self.notifier.wait(timeout) => match result {
                Ok(wake) if wake.received => {
                    debug!(channel = ?wake.channel, "schedule changed");
                    IterationOutcome::Continue
                },
                Ok(_) => IterationOutcome::Continue,
                Err(e) => {
                    warn!(error = %e, "change notifier failed");
                    IterationOutcome::RetryAfterBackoff
                },
            },
            () = self.cancellation_token.cancelled() => IterationOutcome::FatalShutdown,
        }
    }

    /// Processes one due row as a single unit of work, rolling back on any
    /// failure.
    async fn process(&mut self, row: &S::Row, now: DateTime<Utc>) -> Result<()> {
        self.store.begin().await?;

        match self.process_in_unit(row, now).await {
            Ok(disposition) => {
                let mut stats = self.stats.write().await;
                match disposition {
                    Disposition::Proceed => stats.rows_processed += 1,
                    Disposition::Moot { .. } => stats.moot_transitions += 1,
                }
                stats.last_processed_at = Some(now);
                stats.last_row_id = Some(row.id().to_string());
                Ok(())
            },
            Err(e) => {
                if let Err(rollback_error) = self.store.rollback().await {
                    warn!(error = %rollback_error, "rollback failed");
                }
                self.stats.write().await.processing_failures += 1;
                Err(e)
            },
        }
    }

    async fn process_in_unit(&mut self, row: &S::Row, now: DateTime<Utc>) -> Result<Disposition> {
        let disposition = self.store.apply(row).await?;

        match &disposition {
            Disposition::Proceed => {
                let built = self.builder.build(row, now)?;
                self.broker.publish(&built.event, None, built.ttl_ms).await?;
                self.store.mark_processed(row).await?;
                self.store.commit().await?;

                info!(
                    row_id = %row.id(),
                    event_type = %built.event.event_type,
                    trace_id = ?built.event.trace_id,
                    ttl_ms = ?built.ttl_ms,
                    "scheduled event published"
                );
            },
            Disposition::Moot { reason } => {
                self.store.mark_processed(row).await?;
                self.store.commit().await?;

                info!(row_id = %row.id(), reason = %reason, "row no longer applies, marked done");
            },
        }

        Ok(disposition)
    }

    /// Time left before the embedded drain is due again.
    fn until_next_drain(&self) -> Option<Duration> {
        let drain = self.drain.as_ref()?;
        let last = drain.last_run?;
        Some(drain.interval.saturating_sub(self.clock.now().duration_since(last)))
    }

    /// Runs the embedded drain if one is configured and its interval has
    /// elapsed.
    async fn maybe_drain(&mut self) {
        let Some(drain) = self.drain.as_mut() else {
            return;
        };

        let now = self.clock.now();
        if drain.last_run.is_some_and(|last| now.duration_since(last) < drain.interval) {
            return;
        }
        drain.last_run = Some(now);

        match drain.drainer.run_pass(self.broker.as_mut()).await {
            Ok(reports) => {
                let republished: u32 = reports.iter().map(|r| r.republished).sum();
                debug!(queues = reports.len(), republished, "embedded drain finished");
                self.stats.write().await.drains_run += 1;
            },
            Err(e) => {
                warn!(error = %e, "embedded drain lost the broker connection, reconnecting");
                if let Err(e) = self.broker.close().await {
                    debug!(error = %e, "broker close failed");
                }
                if let Err(e) = self.broker.connect().await {
                    warn!(error = %e, "broker reconnect failed");
                }
            },
        }
    }

    /// Closes notifier, broker and store, in that order. A failure closing
    /// one does not stop the others from closing.
    pub async fn shutdown(&mut self) {
        self.state = DaemonState::ShuttingDown;
        info!("scheduler daemon shutting down");

        if let Err(e) = self.notifier.close().await {
            warn!(error = %e, "failed to close change notifier");
        }
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "failed to close broker");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "failed to close schedule store");
        }

        self.state = DaemonState::Terminated;
        info!("scheduler daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap()
    }

    #[test]
    fn no_row_waits_full_idle() {
        assert_eq!(compute_wait(None, now(), DEFAULT_MAX_IDLE), DEFAULT_MAX_IDLE);
    }

    #[test]
    fn overdue_row_waits_zero() {
        let due = now() - chrono::Duration::minutes(10);
        assert_eq!(compute_wait(Some(due), now(), DEFAULT_MAX_IDLE), Duration::ZERO);
    }

    #[test]
    fn wait_is_capped_by_idle() {
        let soon = now() + chrono::Duration::seconds(30);
        let later = now() + chrono::Duration::hours(2);

        assert_eq!(compute_wait(Some(soon), now(), DEFAULT_MAX_IDLE), Duration::from_secs(30));
        assert_eq!(compute_wait(Some(later), now(), DEFAULT_MAX_IDLE), DEFAULT_MAX_IDLE);
    }

    #[test]
    fn state_displays_lowercase() {
        assert_eq!(DaemonState::ShuttingDown.to_string(), "shutting_down");
    }
}
