//! Message broker access: the synchronous publisher and dead-letter reads.
//!
//! Publishing waits for the broker's confirm before returning, so a row is
//! only marked processed once its event is safely enqueued. A connection
//! dropped mid-publish is reopened once and the same message, properties
//! included, is sent again.

use std::fmt;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use rollcall_core::Event;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SchedulerError};

/// Binding key used for a queue configured without explicit keys.
pub const MATCH_ALL: &str = "#";

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// A primary queue and the routing keys bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Routing keys bound on both the primary and the dead-letter exchange.
    pub routing_keys: Vec<String>,
}

impl QueueSpec {
    /// Parses `queue` or `queue:key1|key2`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty queue name.
    pub fn parse(entry: &str) -> Result<Self> {
        let (name, keys) = entry.split_once(':').unwrap_or((entry, ""));
        let name = name.trim();
        if name.is_empty() {
            return Err(SchedulerError::configuration(format!("empty queue name in '{entry}'")));
        }

        let mut routing_keys: Vec<String> = keys
            .split('|')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect();
        if routing_keys.is_empty() {
            routing_keys.push(MATCH_ALL.to_string());
        }

        Ok(Self { name: name.to_string(), routing_keys })
    }

    /// Parses a comma separated list of entries.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if an entry is invalid or the list is
    /// empty.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let queues = list
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>>>()?;

        if queues.is_empty() {
            return Err(SchedulerError::configuration("no primary queues configured"));
        }
        Ok(queues)
    }
}

/// Exchanges and queues declared on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopology {
    /// Durable topic exchange for primary traffic.
    pub exchange: String,
    /// Durable topic exchange receiving dead-lettered messages.
    pub dead_letter_exchange: String,
    /// Primary queues, each paired with a `<queue>.dlq`.
    pub queues: Vec<QueueSpec>,
    /// `x-message-ttl` applied to every primary queue.
    pub message_ttl_ms: u64,
}

impl BrokerTopology {
    /// Names of every configured primary queue.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }
}

/// A message read from a dead-letter queue, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Broker delivery tag used to ack or nack.
    pub delivery_tag: u64,
    /// Routing key the message was originally published with.
    pub routing_key: String,
    /// Raw message body.
    pub payload: Vec<u8>,
}

/// A serialized event and the properties it is published with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Routing key on the primary exchange.
    pub routing_key: String,
    /// JSON body.
    pub body: Vec<u8>,
    /// Per-message `expiration`, in milliseconds.
    pub expiration_ms: Option<u64>,
    /// Trace id carried as the correlation id.
    pub correlation_id: Option<String>,
}

impl OutgoingMessage {
    /// Serializes `event`, routing by its type unless `routing_key` is
    /// given.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the event cannot be encoded.
    pub fn from_event(
        event: &Event,
        routing_key: Option<&str>,
        expiration_ms: Option<u64>,
    ) -> Result<Self> {
        Ok(Self {
            routing_key: routing_key.unwrap_or_else(|| event.routing_key()).to_string(),
            body: event.to_bytes()?,
            expiration_ms,
            correlation_id: event.trace_id.clone(),
        })
    }

    /// AMQP properties: persistent, JSON, and `expiration` only when set.
    pub fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into());
        if let Some(ms) = self.expiration_ms {
            properties = properties.with_expiration(ms.to_string().into());
        }
        if let Some(id) = &self.correlation_id {
            properties = properties.with_correlation_id(id.as_str().into());
        }
        properties
    }
}

/// Publishes events to the primary exchange.
#[async_trait]
pub trait Publisher: Send {
    /// Opens the connection and declares the topology.
    async fn connect(&mut self) -> Result<()>;

    /// Publishes `event` and waits for the broker to confirm it.
    async fn publish(
        &mut self,
        event: &Event,
        routing_key: Option<&str>,
        expiration_ms: Option<u64>,
    ) -> Result<()>;

    /// Publishes `event` on the current channel without reconnecting.
    ///
    /// Used while deliveries from that channel are still unsettled: their
    /// tags are meaningless on a new channel, so a dropped connection is
    /// returned as connection-lost and the broker redelivers them.
    async fn publish_once(&mut self, event: &Event, routing_key: Option<&str>) -> Result<()>;

    /// Closes the connection. Safe to call more than once, or before
    /// `connect`.
    async fn close(&mut self) -> Result<()>;
}

/// Reads and settles messages on dead-letter queues.
#[async_trait]
pub trait DeadLetterSource: Send {
    /// Declares the dead-letter queue of `primary` and returns its depth.
    async fn declare_dead_letter_queue(&mut self, primary: &str) -> Result<u32>;

    /// Takes the next message from the dead-letter queue of `primary`.
    async fn next_dead_letter(&mut self, primary: &str) -> Result<Option<DeadLetter>>;

    /// Acknowledges a dead letter, removing it.
    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    /// Rejects a dead letter, returning it to its queue when `requeue`.
    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

/// A broker session that both publishes and drains.
pub trait MessageBroker: Publisher + DeadLetterSource {}

impl<T: Publisher + DeadLetterSource + ?Sized> MessageBroker for T {}

/// A transport that can send one message and be reopened.
#[async_trait]
trait Link: Send {
    async fn send(&mut self, message: &OutgoingMessage) -> Result<()>;

    async fn reopen(&mut self) -> Result<()>;
}

/// Sends `message`, reopening the link and resending once if the
/// connection was lost.
async fn publish_with_reconnect<L: Link + ?Sized>(
    link: &mut L,
    message: &OutgoingMessage,
) -> Result<()> {
    match link.send(message).await {
        Err(e) if e.is_connection_lost() => {
            warn!(error = %e, routing_key = %message.routing_key, "publish lost connection, reconnecting");
            link.reopen().await?;
            link.send(message).await
        },
        other => other,
    }
}

fn classify(context: &str, err: lapin::Error) -> SchedulerError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError => {
            SchedulerError::connection_lost(format!("{context}: {err}"))
        },
        other => SchedulerError::broker(format!("{context}: {other}")),
    }
}

/// RabbitMQ broker session over `lapin`.
///
/// One connection and one confirm-mode channel per instance.
pub struct AmqpBroker {
    url: String,
    topology: BrokerTopology,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("exchange", &self.topology.exchange)
            .field("connected", &self.channel.is_some())
            .finish_non_exhaustive()
    }
}

impl AmqpBroker {
    /// Creates a disconnected broker session.
    pub fn new(url: impl Into<String>, topology: BrokerTopology) -> Self {
        Self { url: url.into(), topology, connection: None, channel: None }
    }

    /// Opens a connection and closes it immediately.
    ///
    /// # Errors
    ///
    /// Returns a connection-lost error if the broker is unreachable.
    pub async fn probe(url: &str) -> Result<()> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| classify("broker unreachable", e))?;
        connection.close(200, "probe").await.map_err(|e| classify("probe close failed", e))?;
        Ok(())
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| SchedulerError::connection_lost("broker channel is not open"))
    }

    async fn open(&mut self) -> Result<()> {
        self.shutdown().await;

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| classify("failed to connect to broker", e))?;
        let channel =
            connection.create_channel().await.map_err(|e| classify("failed to open channel", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify("failed to enable confirms", e))?;

        declare_topology(&channel, &self.topology).await?;

        info!(exchange = %self.topology.exchange, "broker connected");
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.channel = None;
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "closing").await {
                debug!(error = %e, "broker connection already closed");
            }
        }
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions { durable: true, ..Default::default() }
}

async fn declare_topology(channel: &Channel, topology: &BrokerTopology) -> Result<()> {
    for exchange in [&topology.exchange, &topology.dead_letter_exchange] {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify("failed to declare exchange", e))?;
    }

    for queue in &topology.queues {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(topology.dead_letter_exchange.as_str().into()),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(i64::try_from(topology.message_ttl_ms).unwrap_or(i64::MAX)),
        );
        channel
            .queue_declare(&queue.name, durable_queue(), args)
            .await
            .map_err(|e| classify("failed to declare queue", e))?;

        let dlq = dead_letter_queue_name(&queue.name);
        channel
            .queue_declare(&dlq, durable_queue(), FieldTable::default())
            .await
            .map_err(|e| classify("failed to declare dead-letter queue", e))?;

        for key in &queue.routing_keys {
            channel
                .queue_bind(
                    &queue.name,
                    &topology.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| classify("failed to bind queue", e))?;
            channel
                .queue_bind(
                    &dlq,
                    &topology.dead_letter_exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| classify("failed to bind dead-letter queue", e))?;
        }

        debug!(queue = %queue.name, keys = ?queue.routing_keys, "queue declared");
    }

    Ok(())
}

#[async_trait]
impl Link for AmqpBroker {
    async fn send(&mut self, message: &OutgoingMessage) -> Result<()> {
        let confirm = self
            .channel()?
            .basic_publish(
                &self.topology.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                message.properties(),
            )
            .await
            .map_err(|e| classify("publish failed", e))?
            .await
            .map_err(|e| classify("publish confirm failed", e))?;

        if confirm.is_nack() {
            return Err(SchedulerError::broker(format!(
                "broker rejected message for {}",
                message.routing_key
            )));
        }
        Ok(())
    }

    async fn reopen(&mut self) -> Result<()> {
        self.open().await
    }
}

#[async_trait]
impl Publisher for AmqpBroker {
    async fn connect(&mut self) -> Result<()> {
        if self.channel.is_none() {
            self.open().await?;
        }
        Ok(())
    }

    #[instrument(
        name = "publish",
        skip(self, event),
        fields(event_type = %event.event_type, trace_id = ?event.trace_id)
    )]
    async fn publish(
        &mut self,
        event: &Event,
        routing_key: Option<&str>,
        expiration_ms: Option<u64>,
    ) -> Result<()> {
        let message = OutgoingMessage::from_event(event, routing_key, expiration_ms)?;
        publish_with_reconnect(self, &message).await?;
        debug!(routing_key = %message.routing_key, expiration_ms, "event published");
        Ok(())
    }

    async fn publish_once(&mut self, event: &Event, routing_key: Option<&str>) -> Result<()> {
        let message = OutgoingMessage::from_event(event, routing_key, None)?;
        self.send(&message).await?;
        debug!(routing_key = %message.routing_key, "event republished");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSource for AmqpBroker {
    async fn declare_dead_letter_queue(&mut self, primary: &str) -> Result<u32> {
        let queue = self
            .channel()?
            .queue_declare(
                &dead_letter_queue_name(primary),
                durable_queue(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify("failed to declare dead-letter queue", e))?;

        Ok(queue.message_count())
    }

    async fn next_dead_letter(&mut self, primary: &str) -> Result<Option<DeadLetter>> {
        let message = self
            .channel()?
            .basic_get(&dead_letter_queue_name(primary), BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| classify("failed to read dead letter", e))?;

        Ok(message.map(|m| DeadLetter {
            delivery_tag: m.delivery.delivery_tag,
            routing_key: m.delivery.routing_key.to_string(),
            payload: m.delivery.data,
        }))
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| classify("ack failed", e))
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel()?
            .basic_nack(delivery_tag, BasicNackOptions { requeue, ..Default::default() })
            .await
            .map_err(|e| classify("nack failed", e))
    }
}

pub mod mock {
    //! In-memory broker for testing the daemons and the drain.
    //!
    //! Records every published message and keeps per-queue dead-letter
    //! queues. Clones share state.

    use std::{
        collections::{HashMap, VecDeque},
        sync::Arc,
    };

    use async_trait::async_trait;
    use rollcall_core::Event;
    use tokio::sync::RwLock;

    use super::{DeadLetter, DeadLetterSource, Publisher};
    use crate::error::{Result, SchedulerError};

    /// A message accepted by [`MemoryBroker::publish`].
    #[derive(Debug, Clone, PartialEq)]
    pub struct Published {
        /// The event as published.
        pub event: Event,
        /// Effective routing key.
        pub routing_key: String,
        /// Per-message expiration.
        pub expiration_ms: Option<u64>,
    }

    #[derive(Debug, Default)]
    struct State {
        published: Vec<Published>,
        dead_letters: HashMap<String, VecDeque<DeadLetter>>,
        unsettled: HashMap<u64, (String, DeadLetter)>,
        next_tag: u64,
        acked: Vec<u64>,
        nacked: Vec<(u64, bool)>,
        publish_failures: usize,
        connection_drops: usize,
        fail_close: bool,
        connects: usize,
        closes: usize,
    }

    /// In-memory [`Publisher`] and [`DeadLetterSource`].
    #[derive(Debug, Clone, Default)]
    pub struct MemoryBroker {
        state: Arc<RwLock<State>>,
    }

    impl MemoryBroker {
        /// Creates an empty broker.
        pub fn new() -> Self {
            Self::default()
        }

        /// Enqueues a dead letter behind `primary`.
        pub async fn dead_letter(&self, primary: &str, routing_key: &str, payload: Vec<u8>) {
            let mut state = self.state.write().await;
            state.next_tag += 1;
            let letter = DeadLetter {
                delivery_tag: state.next_tag,
                routing_key: routing_key.to_string(),
                payload,
            };
            state.dead_letters.entry(primary.to_string()).or_default().push_back(letter);
        }

        /// Messages published so far.
        pub async fn published(&self) -> Vec<Published> {
            self.state.read().await.published.clone()
        }

        /// Dead letters still queued behind `primary`.
        pub async fn dead_letter_depth(&self, primary: &str) -> usize {
            self.state.read().await.dead_letters.get(primary).map_or(0, VecDeque::len)
        }

        /// Delivery tags acknowledged.
        pub async fn acked(&self) -> Vec<u64> {
            self.state.read().await.acked.clone()
        }

        /// Delivery tags rejected, with their requeue flag.
        pub async fn nacked(&self) -> Vec<(u64, bool)> {
            self.state.read().await.nacked.clone()
        }

        /// Makes the next `n` publishes fail.
        pub async fn fail_next_publishes(&self, n: usize) {
            self.state.write().await.publish_failures = n;
        }

        /// Drops the connection during the next `n` publishes. Unsettled
        /// dead letters go back to the head of their queues, as a broker
        /// redelivers them when their channel dies.
        pub async fn drop_connection_on_next_publishes(&self, n: usize) {
            self.state.write().await.connection_drops = n;
        }

        /// Makes `close` fail.
        pub async fn fail_close(&self) {
            self.state.write().await.fail_close = true;
        }

        /// Number of `connect` calls.
        pub async fn connects(&self) -> usize {
            self.state.read().await.connects
        }

        /// Number of `close` calls.
        pub async fn closes(&self) -> usize {
            self.state.read().await.closes
        }
    }

    impl State {
        /// Returns `true` if the connection dropped on this publish.
        fn take_connection_drop(&mut self) -> bool {
            if self.connection_drops == 0 {
                return false;
            }
            self.connection_drops -= 1;
            for (queue, letter) in std::mem::take(&mut self.unsettled).into_values() {
                self.dead_letters.entry(queue).or_default().push_front(letter);
            }
            true
        }

        fn record(&mut self, event: &Event, routing_key: Option<&str>, expiration_ms: Option<u64>) {
            self.published.push(Published {
                event: event.clone(),
                routing_key: routing_key.unwrap_or_else(|| event.routing_key()).to_string(),
                expiration_ms,
            });
        }
    }

    #[async_trait]
    impl Publisher for MemoryBroker {
        async fn connect(&mut self) -> Result<()> {
            self.state.write().await.connects += 1;
            Ok(())
        }

        async fn publish(
            &mut self,
            event: &Event,
            routing_key: Option<&str>,
            expiration_ms: Option<u64>,
        ) -> Result<()> {
            let mut state = self.state.write().await;
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(SchedulerError::broker("publish rejected"));
            }
            if state.take_connection_drop() {
                // Reconnected and resent
                state.connects += 1;
            }

            state.record(event, routing_key, expiration_ms);
            Ok(())
        }

        async fn publish_once(&mut self, event: &Event, routing_key: Option<&str>) -> Result<()> {
            let mut state = self.state.write().await;
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(SchedulerError::broker("publish rejected"));
            }
            if state.take_connection_drop() {
                return Err(SchedulerError::connection_lost("connection reset by peer"));
            }

            state.record(event, routing_key, None);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            let mut state = self.state.write().await;
            state.closes += 1;
            if state.fail_close {
                return Err(SchedulerError::broker("close failed"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DeadLetterSource for MemoryBroker {
        async fn declare_dead_letter_queue(&mut self, primary: &str) -> Result<u32> {
            let mut state = self.state.write().await;
            let depth = state.dead_letters.entry(primary.to_string()).or_default().len();
            Ok(u32::try_from(depth).unwrap_or(u32::MAX))
        }

        async fn next_dead_letter(&mut self, primary: &str) -> Result<Option<DeadLetter>> {
            let mut state = self.state.write().await;
            let letter = state.dead_letters.get_mut(primary).and_then(VecDeque::pop_front);
            if let Some(letter) = &letter {
                state.unsettled.insert(letter.delivery_tag, (primary.to_string(), letter.clone()));
            }
            Ok(letter)
        }

        async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
            let mut state = self.state.write().await;
            if state.unsettled.remove(&delivery_tag).is_none() {
                return Err(unknown_tag(delivery_tag));
            }
            state.acked.push(delivery_tag);
            Ok(())
        }

        async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
            let mut state = self.state.write().await;
            let Some((queue, letter)) = state.unsettled.remove(&delivery_tag) else {
                return Err(unknown_tag(delivery_tag));
            };
            if requeue {
                state.dead_letters.entry(queue).or_default().push_back(letter);
            }
            state.nacked.push((delivery_tag, requeue));
            Ok(())
        }
    }

    fn unknown_tag(delivery_tag: u64) -> SchedulerError {
        SchedulerError::broker(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct FlakyLink {
        drops: usize,
        reopens: usize,
        sent: Vec<OutgoingMessage>,
    }

    #[async_trait]
    impl Link for FlakyLink {
        async fn send(&mut self, message: &OutgoingMessage) -> Result<()> {
            if self.drops > 0 {
                self.drops -= 1;
                return Err(SchedulerError::connection_lost("socket closed"));
            }
            self.sent.push(message.clone());
            Ok(())
        }

        async fn reopen(&mut self) -> Result<()> {
            self.reopens += 1;
            Ok(())
        }
    }

    fn message(expiration_ms: Option<u64>) -> OutgoingMessage {
        let event = Event::new("game.reminder.due", json!({}), Utc::now()).with_trace_id("trace-1");
        OutgoingMessage::from_event(&event, None, expiration_ms).unwrap()
    }

    #[tokio::test]
    async fn dropped_connection_is_reopened_once_with_same_properties() {
        let mut link = FlakyLink { drops: 1, ..Default::default() };
        let message = message(Some(3_000_000));

        publish_with_reconnect(&mut link, &message).await.unwrap();

        assert_eq!(link.reopens, 1);
        assert_eq!(link.sent, vec![message.clone()]);
        assert_eq!(
            link.sent[0].properties().expiration().as_ref().map(|e| e.as_str()),
            Some("3000000")
        );
    }

    #[tokio::test]
    async fn second_drop_is_returned() {
        let mut link = FlakyLink { drops: 2, ..Default::default() };

        let err = publish_with_reconnect(&mut link, &message(None)).await.unwrap_err();

        assert!(err.is_connection_lost());
        assert_eq!(link.reopens, 1);
        assert!(link.sent.is_empty());
    }

    #[test]
    fn expiration_is_only_set_when_given() {
        let properties = message(None).properties();

        assert!(properties.expiration().is_none());
        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(
            properties.correlation_id().as_ref().map(|id| id.as_str()),
            Some("trace-1")
        );
    }

    #[test]
    fn routing_key_defaults_to_event_type() {
        let event = Event::new("game.status.transition", json!({}), Utc::now());

        let default = OutgoingMessage::from_event(&event, None, None).unwrap();
        let custom = OutgoingMessage::from_event(&event, Some("audit"), None).unwrap();

        assert_eq!(default.routing_key, "game.status.transition");
        assert_eq!(custom.routing_key, "audit");
    }

    #[test]
    fn queue_entries_parse_with_and_without_keys() {
        let queues =
            QueueSpec::parse_list("bot.notifications:game.reminder.due, audit ,").unwrap();

        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].routing_keys, vec!["game.reminder.due"]);
        assert_eq!(queues[1].name, "audit");
        assert_eq!(queues[1].routing_keys, vec![MATCH_ALL]);
        assert!(QueueSpec::parse_list(" , ").is_err());
        assert!(QueueSpec::parse(":key").is_err());
    }

    #[tokio::test]
    async fn memory_broker_requeues_on_nack() {
        use mock::MemoryBroker;

        let mut broker = MemoryBroker::new();
        broker.dead_letter("bot.notifications", "game.reminder.due", b"{}".to_vec()).await;

        let letter = broker.next_dead_letter("bot.notifications").await.unwrap().unwrap();
        broker.nack(letter.delivery_tag, true).await.unwrap();

        assert_eq!(broker.dead_letter_depth("bot.notifications").await, 1);
        assert_eq!(broker.declare_dead_letter_queue("bot.notifications").await.unwrap(), 1);
    }
}
