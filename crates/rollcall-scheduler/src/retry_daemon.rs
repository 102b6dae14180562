//! Standalone dead-letter retry daemon.
//!
//! Drains every configured dead-letter queue on a fixed interval with the
//! [`DrainPolicy::RequeueOnPublishFailure`] policy, so a message is only
//! lost when it cannot be decoded.

use std::{sync::Arc, time::Duration};

use rollcall_core::Clock;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    broker::MessageBroker,
    dead_letter::{DeadLetterDrainer, DeadLetterStats, DrainPolicy},
    error::Result,
};

/// Default pause between drain passes.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic drain of every configured dead-letter queue.
pub struct DeadLetterRetryDaemon {
    broker: Box<dyn MessageBroker>,
    drainer: DeadLetterDrainer,
    interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl DeadLetterRetryDaemon {
    /// Creates a retry daemon over `queues`.
    pub fn new(
        broker: Box<dyn MessageBroker>,
        queues: Vec<String>,
        interval: Duration,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let drainer =
            DeadLetterDrainer::new(DrainPolicy::RequeueOnPublishFailure, queues, clock.clone());
        Self { broker, drainer, interval, clock, cancellation_token }
    }

    /// Shared stats handle, for the health endpoint.
    pub fn stats(&self) -> Arc<RwLock<DeadLetterStats>> {
        self.drainer.stats()
    }

    /// Runs one drain pass, reconnecting the broker first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be reached or the connection
    /// drops mid-pass. Per-queue failures are recorded in the stats.
    pub async fn run_once(&mut self) -> Result<()> {
        self.broker.connect().await?;
        let reports = self.drainer.run_pass(self.broker.as_mut()).await?;

        let republished: u32 = reports.iter().map(|r| r.republished).sum();
        let failed: u32 = reports.iter().map(|r| r.failed).sum();
        info!(queues = reports.len(), republished, failed, "dead-letter retry pass finished");
        Ok(())
    }

    /// Drains every interval until the cancellation token fires, then
    /// closes the broker.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok` once shut down.
    pub async fn run(mut self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "dead-letter retry daemon starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Err(e) = self.run_once().await {
                error!(error = %e, category = %e.category(), "dead-letter retry pass failed");
                if e.is_connection_lost() {
                    // Force a fresh connection on the next pass
                    if let Err(e) = self.broker.close().await {
                        warn!(error = %e, "failed to close broker");
                    }
                }
            }

            tokio::select! {
                () = self.clock.sleep(self.interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "failed to close broker");
        }
        info!("dead-letter retry daemon stopped");
        Ok(())
    }
}
