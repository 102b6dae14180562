//! Dead-letter drain and per-queue health tracking.
//!
//! A drain pass empties what is currently sitting in a `<queue>.dlq`:
//! each message is decoded back into an [`Event`] and republished to the
//! primary exchange without a TTL. The pass is bounded by the depth read
//! at its start, so messages requeued during the pass are not read twice.
//!
//! ```text
//!   depth = declare(<queue>.dlq)
//!   repeat depth times:
//!       next ──▶ decode ──ok──▶ publish ──ok──▶ ack
//!                  │                │
//!                  └─err─▶ nack(drop)
//!                                   └─err─▶ nack(requeue per policy)
//! ```

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use rollcall_core::{Clock, Event};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    broker::{DeadLetter, MessageBroker},
    error::Result,
};

/// Consecutive failing passes after which a queue reports unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// What to do with a dead letter that could not be republished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Drop it on any failure. Used by the drain embedded in a daemon.
    DropOnFailure,
    /// Requeue it when the republish fails; drop it only when it cannot be
    /// decoded. Used by the standalone retry daemon.
    RequeueOnPublishFailure,
}

impl DrainPolicy {
    fn requeue_on_publish_failure(self) -> bool {
        matches!(self, Self::RequeueOnPublishFailure)
    }
}

/// Outcome of draining one dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Primary queue whose dead letters were drained.
    pub queue: String,
    /// Depth at the start of the pass.
    pub depth: u32,
    /// Messages republished and acked.
    pub republished: u32,
    /// Messages nacked.
    pub failed: u32,
}

impl DrainReport {
    /// Whether every message in the pass was republished.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Drains the dead-letter queue of `queue` once.
///
/// # Errors
///
/// Returns an error if the broker fails to declare, read or settle a
/// message. Messages already settled stay settled. A connection lost
/// while republishing ends the pass without settling the message in hand;
/// the broker redelivers it.
pub async fn drain<B: MessageBroker + ?Sized>(
    broker: &mut B,
    queue: &str,
    policy: DrainPolicy,
) -> Result<DrainReport> {
    let depth = broker.declare_dead_letter_queue(queue).await?;
    let mut report = DrainReport { queue: queue.to_string(), depth, ..Default::default() };
    if depth == 0 {
        return Ok(report);
    }

    info!(queue, depth, "draining dead-letter queue");

    for _ in 0..depth {
        let Some(letter) = broker.next_dead_letter(queue).await? else {
            break;
        };

        if settle(&mut *broker, &letter, policy).await? {
            report.republished += 1;
        } else {
            report.failed += 1;
        }
    }

    info!(
        queue,
        republished = report.republished,
        failed = report.failed,
        "dead-letter drain finished"
    );
    Ok(report)
}

/// Republishes one dead letter and settles it. Returns whether it was
/// republished.
async fn settle<B: MessageBroker + ?Sized>(
    broker: &mut B,
    letter: &DeadLetter,
    policy: DrainPolicy,
) -> Result<bool> {
    let event = match Event::from_slice(&letter.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                delivery_tag = letter.delivery_tag,
                error = %e,
                "dropping malformed dead letter"
            );
            broker.nack(letter.delivery_tag, false).await?;
            return Ok(false);
        },
    };

    let routing_key =
        if letter.routing_key.is_empty() { event.routing_key() } else { &letter.routing_key };

    match broker.publish_once(&event, Some(routing_key)).await {
        Ok(()) => {
            broker.ack(letter.delivery_tag).await?;
            debug!(routing_key, trace_id = ?event.trace_id, "dead letter republished");
            Ok(true)
        },
        // The letter's tag died with the channel; the broker redelivers it
        Err(e) if e.is_connection_lost() => Err(e),
        Err(e) => {
            let requeue = policy.requeue_on_publish_failure();
            warn!(routing_key, requeue, error = %e, "dead letter republish failed");
            broker.nack(letter.delivery_tag, requeue).await?;
            Ok(false)
        },
    }
}

/// Running health of one dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    /// Messages republished across all passes.
    pub processed: u64,
    /// Messages nacked across all passes.
    pub failed: u64,
    /// Passes in a row that had a failure or errored.
    pub consecutive_failures: u32,
    /// When the queue was last drained.
    pub last_drain_at: Option<DateTime<Utc>>,
    /// Most recent pass error.
    pub last_error: Option<String>,
}

impl QueueHealth {
    /// Whether the queue is below the failure threshold.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < UNHEALTHY_THRESHOLD
    }
}

/// Health of every drained queue, keyed by primary queue name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    queues: BTreeMap<String, QueueHealth>,
}

impl DeadLetterStats {
    /// Records the outcome of one pass over `queue`.
    pub fn record(&mut self, queue: &str, outcome: &Result<DrainReport>, now: DateTime<Utc>) {
        let health = self.queues.entry(queue.to_string()).or_default();
        health.last_drain_at = Some(now);

        match outcome {
            Ok(report) => {
                health.processed += u64::from(report.republished);
                health.failed += u64::from(report.failed);
                if report.is_clean() {
                    health.consecutive_failures = 0;
                    health.last_error = None;
                } else {
                    health.consecutive_failures += 1;
                }
            },
            Err(e) => {
                health.consecutive_failures += 1;
                health.last_error = Some(e.to_string());
            },
        }
    }

    /// Health of one queue, if it was ever drained.
    pub fn queue(&self, queue: &str) -> Option<&QueueHealth> {
        self.queues.get(queue)
    }

    /// Every tracked queue.
    pub fn queues(&self) -> impl Iterator<Item = (&str, &QueueHealth)> {
        self.queues.iter().map(|(name, health)| (name.as_str(), health))
    }

    /// Queues at or above the failure threshold.
    pub fn unhealthy_queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, health)| !health.is_healthy())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether every tracked queue is healthy.
    pub fn is_healthy(&self) -> bool {
        self.queues.values().all(QueueHealth::is_healthy)
    }
}

/// Drains a fixed set of queues and keeps their stats.
#[derive(Debug, Clone)]
pub struct DeadLetterDrainer {
    policy: DrainPolicy,
    queues: Vec<String>,
    stats: Arc<RwLock<DeadLetterStats>>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterDrainer {
    /// Creates a drainer for `queues`.
    pub fn new(policy: DrainPolicy, queues: Vec<String>, clock: Arc<dyn Clock>) -> Self {
        Self { policy, queues, stats: Arc::new(RwLock::new(DeadLetterStats::default())), clock }
    }

    /// Shared stats handle, for the health endpoint.
    pub fn stats(&self) -> Arc<RwLock<DeadLetterStats>> {
        self.stats.clone()
    }

    /// Drain policy in effect.
    pub fn policy(&self) -> DrainPolicy {
        self.policy
    }

    /// Drains every queue once.
    ///
    /// A failure on one queue is recorded and the pass moves on, except for
    /// a lost connection, which ends the pass so the caller can reconnect.
    ///
    /// # Errors
    ///
    /// Returns the connection-lost error that ended the pass.
    pub async fn run_pass(&self, broker: &mut dyn MessageBroker) -> Result<Vec<DrainReport>> {
        let mut reports = Vec::with_capacity(self.queues.len());

        for queue in &self.queues {
            let outcome = drain(&mut *broker, queue, self.policy).await;
            self.stats.write().await.record(queue, &outcome, self.clock.now_utc());

            match outcome {
                Ok(report) => reports.push(report),
                Err(e) if e.is_connection_lost() => return Err(e),
                Err(e) => warn!(queue = %queue, error = %e, "dead-letter drain failed"),
            }
        }

        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use rollcall_core::TestClock;
    use serde_json::json;

    use super::*;
    use crate::{broker::mock::MemoryBroker, error::SchedulerError};

    const QUEUE: &str = "bot.notifications";

    fn valid_letter() -> Vec<u8> {
        Event::new("game.reminder.due", json!({"reminder_minutes": 60}), Utc::now())
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn empty_queue_returns_immediately() {
        let mut broker = MemoryBroker::new();

        let report = drain(&mut broker, QUEUE, DrainPolicy::DropOnFailure).await.unwrap();

        assert_eq!(report.depth, 0);
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn republish_failure_requeues_only_under_requeue_policy() {
        for (policy, requeued) in [
            (DrainPolicy::DropOnFailure, false),
            (DrainPolicy::RequeueOnPublishFailure, true),
        ] {
            let mut broker = MemoryBroker::new();
            broker.dead_letter(QUEUE, "game.reminder.due", valid_letter()).await;
            broker.fail_next_publishes(1).await;

            let report = drain(&mut broker, QUEUE, policy).await.unwrap();

            assert_eq!(report.failed, 1);
            assert_eq!(broker.nacked().await, vec![(1, requeued)]);
            assert_eq!(broker.dead_letter_depth(QUEUE).await, usize::from(requeued));
        }
    }

    #[tokio::test]
    async fn malformed_letter_is_dropped_even_under_requeue_policy() {
        let mut broker = MemoryBroker::new();
        broker.dead_letter(QUEUE, "game.reminder.due", b"not json".to_vec()).await;

        let report =
            drain(&mut broker, QUEUE, DrainPolicy::RequeueOnPublishFailure).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(broker.nacked().await, vec![(1, false)]);
        assert_eq!(broker.dead_letter_depth(QUEUE).await, 0);
    }

    #[test]
    fn queue_turns_unhealthy_after_three_failing_passes() {
        let mut stats = DeadLetterStats::default();
        let now = Utc::now();
        let failing: Result<DrainReport> = Err(SchedulerError::broker("channel closed"));

        stats.record(QUEUE, &failing, now);
        stats.record(QUEUE, &failing, now);
        assert!(stats.is_healthy());

        stats.record(QUEUE, &failing, now);
        assert!(!stats.is_healthy());
        assert_eq!(stats.unhealthy_queues(), vec![QUEUE.to_string()]);

        let clean = Ok(DrainReport { queue: QUEUE.to_string(), ..Default::default() });
        stats.record(QUEUE, &clean, now);
        assert!(stats.is_healthy());
        assert!(stats.queue(QUEUE).unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn drainer_records_stats_per_queue() {
        let clock = Arc::new(TestClock::new());
        let drainer = DeadLetterDrainer::new(
            DrainPolicy::DropOnFailure,
            vec![QUEUE.to_string(), "bot.game_status".to_string()],
            clock.clone(),
        );
        let mut broker = MemoryBroker::new();
        broker.dead_letter(QUEUE, "game.reminder.due", valid_letter()).await;

        let reports = drainer.run_pass(&mut broker).await.unwrap();

        assert_eq!(reports.len(), 2);
        let stats = drainer.stats();
        let stats = stats.read().await;
        assert_eq!(stats.queue(QUEUE).unwrap().processed, 1);
        assert_eq!(stats.queue(QUEUE).unwrap().last_drain_at, Some(clock.now_utc()));
        assert_eq!(stats.queue("bot.game_status").unwrap().processed, 0);
    }
}
