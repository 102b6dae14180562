//! Integration tests for dead-letter draining and the retry daemon.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use rollcall_core::{events::GAME_STATUS_TRANSITION, Event, TestClock};
use rollcall_scheduler::{
    broker::mock::MemoryBroker,
    dead_letter::{drain, DrainPolicy},
    DeadLetterRetryDaemon, DeadLetterSource,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const QUEUE: &str = "bot.game_status";

fn letter(n: u32) -> Vec<u8> {
    Event::new(GAME_STATUS_TRANSITION, json!({ "n": n }), Utc::now())
        .with_trace_id(format!("trace-{n}"))
        .to_bytes()
        .unwrap()
}

#[tokio::test]
async fn draining_valid_letters_republishes_all_and_empties_queue() -> Result<()> {
    for k in 1..=5 {
        let mut broker = MemoryBroker::new();
        for n in 0..k {
            broker.dead_letter(QUEUE, GAME_STATUS_TRANSITION, letter(n)).await;
        }

        let report = drain(&mut broker, QUEUE, DrainPolicy::DropOnFailure).await?;

        assert_eq!(report.depth, k);
        assert_eq!(report.republished, k);
        assert_eq!(broker.published().await.len(), k as usize);
        assert_eq!(broker.dead_letter_depth(QUEUE).await, 0);
        assert_eq!(broker.acked().await.len(), k as usize);
        assert!(broker.nacked().await.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn one_malformed_letter_is_nacked_and_the_rest_republished() -> Result<()> {
    for k in 2..=5 {
        let mut broker = MemoryBroker::new();
        for n in 0..k - 1 {
            broker.dead_letter(QUEUE, GAME_STATUS_TRANSITION, letter(n)).await;
        }
        broker.dead_letter(QUEUE, GAME_STATUS_TRANSITION, b"{\"event_type\":".to_vec()).await;

        let report = drain(&mut broker, QUEUE, DrainPolicy::DropOnFailure).await?;

        assert_eq!(report.republished, k - 1);
        assert_eq!(report.failed, 1);
        assert_eq!(broker.published().await.len(), (k - 1) as usize);
        assert_eq!(broker.nacked().await.len(), 1);
        assert_eq!(broker.dead_letter_depth(QUEUE).await, 0);
    }
    Ok(())
}

#[tokio::test]
async fn republish_keeps_original_routing_key_and_drops_ttl() -> Result<()> {
    let mut broker = MemoryBroker::new();
    broker.dead_letter(QUEUE, "game.status.transition.audit", letter(7)).await;

    drain(&mut broker, QUEUE, DrainPolicy::DropOnFailure).await?;

    let published = broker.published().await;
    assert_eq!(published[0].routing_key, "game.status.transition.audit");
    assert_eq!(published[0].expiration_ms, None);
    assert_eq!(published[0].event.trace_id.as_deref(), Some("trace-7"));
    Ok(())
}

#[tokio::test]
async fn letters_requeued_during_a_pass_are_not_read_twice() -> Result<()> {
    let mut broker = MemoryBroker::new();
    broker.dead_letter(QUEUE, GAME_STATUS_TRANSITION, letter(1)).await;
    broker.fail_next_publishes(5).await;

    let report = drain(&mut broker, QUEUE, DrainPolicy::RequeueOnPublishFailure).await?;

    assert_eq!(report.depth, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(broker.nacked().await, vec![(1, true)]);
    assert_eq!(broker.dead_letter_depth(QUEUE).await, 1);
    Ok(())
}

#[tokio::test]
async fn connection_drop_during_republish_leaves_letter_for_redelivery() -> Result<()> {
    let mut broker = MemoryBroker::new();
    broker.dead_letter(QUEUE, GAME_STATUS_TRANSITION, letter(1)).await;
    broker.dead_letter(QUEUE, GAME_STATUS_TRANSITION, letter(2)).await;
    broker.drop_connection_on_next_publishes(1).await;

    let err = drain(&mut broker, QUEUE, DrainPolicy::RequeueOnPublishFailure).await.unwrap_err();

    assert!(err.is_connection_lost());
    assert!(broker.published().await.is_empty());
    assert!(broker.acked().await.is_empty());
    assert!(broker.nacked().await.is_empty());
    assert_eq!(broker.dead_letter_depth(QUEUE).await, 2);

    let report = drain(&mut broker, QUEUE, DrainPolicy::RequeueOnPublishFailure).await?;

    assert_eq!(report.republished, 2);
    let traces: Vec<_> =
        broker.published().await.into_iter().filter_map(|p| p.event.trace_id).collect();
    assert_eq!(traces, vec!["trace-1", "trace-2"]);
    assert_eq!(broker.acked().await, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn stale_delivery_tag_is_rejected() {
    let mut broker = MemoryBroker::new();
    broker.dead_letter(QUEUE, GAME_STATUS_TRANSITION, letter(1)).await;

    assert!(broker.ack(1).await.is_err());
    assert!(broker.nack(1, true).await.is_err());
}

#[tokio::test]
async fn retry_daemon_requeues_on_publish_failure() -> Result<()> {
    let broker = MemoryBroker::new();
    broker.dead_letter(QUEUE, GAME_STATUS_TRANSITION, letter(1)).await;
    broker.fail_next_publishes(1).await;

    let mut daemon = DeadLetterRetryDaemon::new(
        Box::new(broker.clone()),
        vec![QUEUE.to_string()],
        Duration::from_secs(60),
        Arc::new(TestClock::new()),
        CancellationToken::new(),
    );

    daemon.run_once().await?;
    assert_eq!(broker.dead_letter_depth(QUEUE).await, 1);

    daemon.run_once().await?;
    assert_eq!(broker.dead_letter_depth(QUEUE).await, 0);
    assert_eq!(broker.published().await.len(), 1);

    let stats = daemon.stats();
    let stats = stats.read().await;
    let health = stats.queue(QUEUE).unwrap();
    assert_eq!(health.processed, 1);
    assert_eq!(health.failed, 1);
    assert_eq!(health.consecutive_failures, 0);
    Ok(())
}

#[tokio::test]
async fn retry_daemon_stops_on_cancel_and_closes_broker() -> Result<()> {
    let broker = MemoryBroker::new();
    let token = CancellationToken::new();
    let daemon = DeadLetterRetryDaemon::new(
        Box::new(broker.clone()),
        vec![QUEUE.to_string()],
        Duration::from_secs(60),
        Arc::new(TestClock::new()),
        token.clone(),
    );

    token.cancel();
    daemon.run().await?;

    assert_eq!(broker.closes().await, 1);
    Ok(())
}
