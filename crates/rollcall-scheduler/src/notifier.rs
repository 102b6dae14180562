//! Wake-up channel built on PostgreSQL `LISTEN`/`NOTIFY`.
//!
//! A notifier owns one dedicated, autocommit database session. The daemon
//! subscribes to its schedule table's channel and then blocks in
//! [`ChangeNotifier::wait`] until a trigger fires or the timeout elapses.
//! Waiting is readiness-driven through the listener's socket; nothing
//! polls.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgListener, PgPoolOptions},
    PgPool,
};
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};

/// Body of a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyPayload {
    /// Payload parsed as JSON.
    Json(serde_json::Value),
    /// Payload that was not valid JSON, verbatim.
    Raw(String),
}

impl NotifyPayload {
    /// Parses a payload, keeping it verbatim if it is not JSON.
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).map_or_else(|_| Self::Raw(raw.to_string()), Self::Json)
    }
}

/// Result of one wait.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Wake {
    /// Whether a notification arrived before the timeout.
    pub received: bool,
    /// Channel the notification arrived on.
    pub channel: Option<String>,
    /// Best-effort decoded payload.
    pub payload: Option<NotifyPayload>,
}

impl Wake {
    /// The timeout elapsed with no notification.
    pub fn timed_out() -> Self {
        Self::default()
    }

    /// A notification arrived.
    pub fn notified(channel: impl Into<String>, raw_payload: &str) -> Self {
        Self {
            received: true,
            channel: Some(channel.into()),
            payload: Some(NotifyPayload::parse(raw_payload)),
        }
    }
}

/// Blocks until a database change notification or a timeout.
#[async_trait]
pub trait ChangeNotifier: Send {
    /// Opens the dedicated session.
    async fn connect(&mut self) -> Result<()>;

    /// Registers interest in `channel`. Subscriptions survive reconnects.
    async fn subscribe(&mut self, channel: &str) -> Result<()>;

    /// Waits for a notification for at most `timeout`.
    ///
    /// A session found closed is rebuilt, with subscriptions replayed,
    /// before waiting. A session that drops during the wait is rebuilt once
    /// and the wait resumes for whatever is left of `timeout`.
    async fn wait(&mut self, timeout: Duration) -> Result<Wake>;

    /// Closes the session. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// [`ChangeNotifier`] over a `PgListener`.
pub struct PgChangeNotifier {
    options: PgConnectOptions,
    pool: Option<PgPool>,
    listener: Option<PgListener>,
    channels: Vec<String>,
}

impl PgChangeNotifier {
    /// Creates a disconnected notifier.
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options, pool: None, listener: None, channels: Vec::new() }
    }

    async fn open(&mut self) -> Result<()> {
        self.shutdown_pool().await;

        // Single-connection pool: the listener holds the only slot
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy_with(self.options.clone());

        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| SchedulerError::notifier(format!("failed to connect listener: {e}")))?;

        if !self.channels.is_empty() {
            let channels: Vec<&str> = self.channels.iter().map(String::as_str).collect();
            listener
                .listen_all(channels)
                .await
                .map_err(|e| SchedulerError::notifier(format!("failed to replay LISTEN: {e}")))?;
        }

        debug!(channels = ?self.channels, "notification listener connected");
        self.listener = Some(listener);
        self.pool = Some(pool);
        Ok(())
    }

    async fn shutdown_pool(&mut self) {
        self.listener = None;
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }
}

#[async_trait]
impl ChangeNotifier for PgChangeNotifier {
    async fn connect(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.open().await?;
        }
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        if !self.channels.iter().any(|c| c == channel) {
            self.channels.push(channel.to_string());
        }

        if let Some(listener) = self.listener.as_mut() {
            listener
                .listen(channel)
                .await
                .map_err(|e| SchedulerError::notifier(format!("LISTEN {channel} failed: {e}")))?;
        }

        info!(channel, "subscribed to schedule changes");
        Ok(())
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Wake> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut reopened = false;

        loop {
            if self.listener.is_none() {
                warn!(channels = ?self.channels, "notification listener closed, reconnecting");
                self.open().await?;
            }
            let Some(listener) = self.listener.as_mut() else {
                return Err(SchedulerError::notifier("listener unavailable after reconnect"));
            };

            let lost = match tokio::time::timeout_at(deadline, listener.try_recv()).await {
                Err(_elapsed) => return Ok(Wake::timed_out()),
                Ok(Ok(Some(notification))) => {
                    return Ok(Wake::notified(notification.channel(), notification.payload()));
                },
                Ok(Ok(None)) => SchedulerError::notifier("listener connection lost"),
                Ok(Err(e)) => {
                    SchedulerError::notifier(format!("failed to receive notification: {e}"))
                },
            };

            // Rebuilt once per wait; a second drop goes back to the daemon
            self.listener = None;
            if reopened {
                return Err(lost);
            }
            reopened = true;
            warn!(error = %lost, "listener dropped mid-wait");
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.pool.is_some() {
            self.shutdown_pool().await;
            debug!("notification listener closed");
        }
        Ok(())
    }
}

pub mod mock {
    //! Scripted notifier for driving the daemon loop in tests.
    //!
    //! Waits return immediately: either the next scripted wake or a timeout.
    //! Every requested timeout is recorded so tests can assert on the wait
    //! the daemon computed.

    use std::{collections::VecDeque, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use tokio::sync::RwLock;

    use super::{ChangeNotifier, Wake};
    use crate::error::{Result, SchedulerError};

    #[derive(Debug, Default)]
    struct State {
        connected: bool,
        connects: usize,
        channels: Vec<String>,
        scripted: VecDeque<Wake>,
        waits: Vec<Duration>,
        fail_close: bool,
        closes: usize,
    }

    /// In-memory notifier. Clones share state.
    #[derive(Debug, Clone, Default)]
    pub struct ManualNotifier {
        state: Arc<RwLock<State>>,
    }

    impl ManualNotifier {
        /// Creates a disconnected notifier with no scripted wakes.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues a notification for a later wait.
        pub async fn notify(&self, channel: &str, payload: &str) {
            self.state.write().await.scripted.push_back(Wake::notified(channel, payload));
        }

        /// Timeouts passed to `wait`, in call order.
        pub async fn waits(&self) -> Vec<Duration> {
            self.state.read().await.waits.clone()
        }

        /// Channels subscribed so far.
        pub async fn channels(&self) -> Vec<String> {
            self.state.read().await.channels.clone()
        }

        /// Makes `close` fail.
        pub async fn fail_close(&self) {
            self.state.write().await.fail_close = true;
        }

        /// Number of `close` calls.
        pub async fn closes(&self) -> usize {
            self.state.read().await.closes
        }

        /// Drops the session so the next wait must reconnect.
        pub async fn drop_connection(&self) {
            self.state.write().await.connected = false;
        }

        /// Number of sessions opened.
        pub async fn connects(&self) -> usize {
            self.state.read().await.connects
        }
    }

    #[async_trait]
    impl ChangeNotifier for ManualNotifier {
        async fn connect(&mut self) -> Result<()> {
            let mut state = self.state.write().await;
            if !state.connected {
                state.connected = true;
                state.connects += 1;
            }
            Ok(())
        }

        async fn subscribe(&mut self, channel: &str) -> Result<()> {
            let mut state = self.state.write().await;
            if !state.channels.iter().any(|c| c == channel) {
                state.channels.push(channel.to_string());
            }
            Ok(())
        }

        async fn wait(&mut self, timeout: Duration) -> Result<Wake> {
            let mut state = self.state.write().await;
            if !state.connected {
                state.connected = true;
                state.connects += 1;
            }
            state.waits.push(timeout);
            Ok(state.scripted.pop_front().unwrap_or_else(Wake::timed_out))
        }

        async fn close(&mut self) -> Result<()> {
            let mut state = self.state.write().await;
            state.closes += 1;
            state.connected = false;
            if state.fail_close {
                return Err(SchedulerError::notifier("close failed"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{mock::ManualNotifier, *};

    #[test]
    fn json_payloads_are_decoded() {
        let wake = Wake::notified("notification_schedule_changed", r#"{"op":"INSERT","id":"x"}"#);
        assert!(wake.received);
        assert_eq!(
            wake.payload,
            Some(NotifyPayload::Json(serde_json::json!({"op": "INSERT", "id": "x"})))
        );
    }

    #[test]
    fn malformed_payloads_are_kept_raw() {
        assert_eq!(NotifyPayload::parse("not-json"), NotifyPayload::Raw("not-json".to_string()));
    }

    #[test]
    fn timeout_has_no_payload() {
        let wake = Wake::timed_out();
        assert!(!wake.received);
        assert!(wake.payload.is_none());
    }

    #[tokio::test]
    async fn closed_session_is_rebuilt_before_waiting() {
        let mut notifier = ManualNotifier::new();
        notifier.connect().await.unwrap();
        notifier.subscribe("game_status_schedule_changed").await.unwrap();

        notifier.drop_connection().await;
        let wake = notifier.wait(Duration::from_secs(1)).await.unwrap();

        assert!(!wake.received);
        assert_eq!(notifier.connects().await, 2);
        assert_eq!(notifier.channels().await, vec!["game_status_schedule_changed"]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut notifier = PgChangeNotifier::new(PgConnectOptions::new());
        notifier.close().await.unwrap();
        notifier.close().await.unwrap();
    }
}
