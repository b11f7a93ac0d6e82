//! Broker plumbing: exchange topology, publishing, and the consuming listener.
//!
//! The services are written against exchange/queue semantics: every queue bound
//! to an exchange receives every message (fanout), a consumer holds at most
//! `prefetch` unacknowledged deliveries, and a failed delivery is requeued.
//! On Kafka an exchange is a topic and a durable queue is a consumer group, so
//! each bound group sees every record. Acknowledging stores the position for
//! the next commit, but never past a record that is still unsettled. Requeueing hands the same record back to the handler
//! after `redelivery_delay` until it succeeds; if shutdown interrupts that, the
//! offset stays uncommitted and the record is delivered again on restart.
//!
//! There is no redelivery cap and no dead-letter destination: a message whose
//! handler always fails is retried for as long as the listener runs.

use std::collections::{BTreeSet, HashMap};
use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::{future, Stream, StreamExt};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;
use serde::de::DeserializeOwned;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PublishError;

pub const ORDERS_EXCHANGE: &str = "orders.exchange";
pub const PAYMENTS_EXCHANGE: &str = "payments.exchange";

/// Queue Payments binds to the orders exchange.
pub const PAYMENT_REQUESTS_QUEUE: &str = "payments.orders.request";
/// Queue Orders binds to the payments exchange.
pub const PAYMENT_STATUS_QUEUE: &str = "orders.payment.status";

pub const DEFAULT_PREFETCH: usize = 10;
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(1);

pub const TYPE_HEADER: &str = "type";
pub const MESSAGE_ID_HEADER: &str = "message-id";

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes `body` to every queue bound to `exchange`.
    async fn publish(
        &self,
        exchange: &str,
        message_type: &str,
        message_id: Uuid,
        body: &[u8],
    ) -> Result<(), PublishError>;
}

/// Producer handle owned by the process. Built once at startup and dropped on
/// shutdown, which flushes anything still in the client queue.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn connect(brokers: &str) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            // Persistent delivery: wait for the full in-sync replica set.
            .set("acks", "all")
            .create()?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(
        &self,
        exchange: &str,
        message_type: &str,
        message_id: Uuid,
        body: &[u8],
    ) -> Result<(), PublishError> {
        let message_id = message_id.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: TYPE_HEADER,
                value: Some(message_type),
            })
            .insert(Header {
                key: MESSAGE_ID_HEADER,
                value: Some(message_id.as_str()),
            });
        let record = FutureRecord::<(), [u8]>::to(exchange)
            .payload(body)
            .headers(headers);

        self.producer
            .send(record, Timeout::Never)
            .await
            .map_err(|(e, _)| PublishError::Kafka(e))?;

        Ok(())
    }
}

/// Creates the exchange if it does not exist yet. A single partition keeps
/// every consumer of the exchange seeing messages in publish order.
pub async fn declare_exchange(brokers: &str, exchange: &str) -> Result<(), KafkaError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .create()?;

    let topic = NewTopic::new(exchange, 1, TopicReplication::Fixed(1));
    let results = admin.create_topics([&topic], &AdminOptions::new()).await?;

    for result in results {
        match result {
            Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
            Err((name, code)) => {
                error!(exchange = %name, ?code, "Failed to declare exchange");
                return Err(KafkaError::AdminOp(code));
            }
        }
    }

    Ok(())
}

/// Business handler invoked once per delivered message.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

/// A received message and its position in the queue.
pub trait Delivery: Send + Sync {
    fn payload(&self) -> Option<&[u8]>;

    fn partition(&self) -> i32;

    fn offset(&self) -> i64;
}

/// Where acknowledged positions are recorded for the next commit.
pub trait OffsetStore: Send + Sync {
    /// `next_offset` is the first offset of `partition` that still needs delivering.
    fn store(&self, partition: i32, next_offset: i64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub queue: String,
    pub prefetch: usize,
    pub redelivery_delay: Duration,
}

impl ListenerOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: DEFAULT_PREFETCH,
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
        }
    }
}

/// Decodes one payload and runs the handler on it.
///
/// Empty or undecodable payloads are acknowledged and dropped: they would fail
/// the same way on every redelivery. Handler errors are requeued.
pub async fn process_payload<M, H>(handler: &H, queue: &str, payload: Option<&[u8]>) -> Disposition
where
    M: DeserializeOwned + Send,
    H: MessageHandler<M> + ?Sized,
{
    let message = match payload.map(serde_json::from_slice::<Option<M>>) {
        Some(Ok(Some(message))) => message,
        Some(Ok(None)) | None => {
            warn!(queue, "Received empty message, dropping");
            return Disposition::Ack;
        }
        Some(Err(e)) => {
            warn!(queue, error = %e, "Received malformed message, dropping");
            return Disposition::Ack;
        }
    };

    match handler.handle(message).await {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            error!(queue, error = format!("{e:#}"), "Failed to process message, requeueing");
            Disposition::Requeue
        }
    }
}

#[derive(Default)]
struct PartitionOffsets {
    unsettled: BTreeSet<i64>,
    next_acked: Option<i64>,
    stored: Option<i64>,
}

/// Acknowledgements arrive out of order when handlers run concurrently, but a
/// partition's committed position must never pass a record that is still
/// unsettled. The tracker only releases the lowest position below which every
/// received record has been acknowledged.
#[derive(Default)]
struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    fn received(&mut self, partition: i32, offset: i64) {
        self.partitions.entry(partition).or_default().unsettled.insert(offset);
    }

    /// Returns the position to store when it moved forward.
    fn acked(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&partition)?;
        state.unsettled.remove(&offset);
        let next_acked = state.next_acked.map_or(offset + 1, |n| n.max(offset + 1));
        state.next_acked = Some(next_acked);

        let next = match state.unsettled.first() {
            Some(&lowest) => lowest.min(next_acked),
            None => next_acked,
        };
        if state.stored.is_some_and(|stored| stored >= next) {
            return None;
        }
        state.stored = Some(next);
        Some(next)
    }
}

struct Settled {
    partition: i32,
    offset: i64,
    acked: bool,
}

async fn settle<M, H, D>(handler: &H, delivery: D, options: &ListenerOptions, shutdown: &CancellationToken) -> Settled
where
    M: DeserializeOwned + Send,
    H: MessageHandler<M> + ?Sized,
    D: Delivery,
{
    let mut settled = Settled {
        partition: delivery.partition(),
        offset: delivery.offset(),
        acked: false,
    };
    let mut redeliveries = 0u32;
    loop {
        match process_payload::<M, H>(handler, &options.queue, delivery.payload()).await {
            Disposition::Ack => {
                settled.acked = true;
                return settled;
            }
            Disposition::Requeue => {
                redeliveries += 1;
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        warn!(
                            queue = %options.queue,
                            offset = settled.offset,
                            redeliveries,
                            "Shutdown requested, leaving message unacknowledged"
                        );
                        return settled;
                    }
                    _ = time::sleep(options.redelivery_delay) => {}
                }
                debug!(queue = %options.queue, offset = settled.offset, redeliveries, "Redelivering message");
            }
        }
    }
}

/// Settles deliveries with at most `options.prefetch` handlers in flight.
/// Stops taking new deliveries once `shutdown` fires; in-flight handler calls
/// run to completion.
pub async fn consume<M, H, S, O>(
    deliveries: S,
    handler: &H,
    offsets: &O,
    options: &ListenerOptions,
    shutdown: CancellationToken,
) where
    M: DeserializeOwned + Send,
    H: MessageHandler<M> + ?Sized,
    S: Stream,
    S::Item: Delivery,
    O: OffsetStore + ?Sized,
{
    let stop = shutdown.clone();
    let mut deliveries = pin!(deliveries.take_until(async move { stop.cancelled().await }));
    let mut tracker = OffsetTracker::default();
    let mut in_flight = FuturesUnordered::new();

    let record = |tracker: &mut OffsetTracker, settled: Settled| {
        if !settled.acked {
            return;
        }
        if let Some(next) = tracker.acked(settled.partition, settled.offset) {
            if let Err(e) = offsets.store(settled.partition, next) {
                error!(queue = %options.queue, error = %e, "Error acknowledging message");
            }
        }
    };

    loop {
        tokio::select! {
            Some(settled) = in_flight.next(), if !in_flight.is_empty() => record(&mut tracker, settled),
            next = deliveries.next(), if in_flight.len() < options.prefetch => match next {
                Some(delivery) => {
                    tracker.received(delivery.partition(), delivery.offset());
                    in_flight.push(settle::<M, H, _>(handler, delivery, options, &shutdown));
                }
                None => break,
            },
            else => break,
        }
    }

    while let Some(settled) = in_flight.next().await {
        record(&mut tracker, settled);
    }
}

struct KafkaDelivery {
    message: OwnedMessage,
}

impl KafkaDelivery {
    fn received(received: KafkaResult<BorrowedMessage<'_>>) -> future::Ready<Option<Self>> {
        future::ready(match received {
            Ok(message) => Some(Self {
                message: message.detach(),
            }),
            Err(e) => {
                error!(error = %e, "Error receiving message");
                None
            }
        })
    }
}

impl Delivery for KafkaDelivery {
    fn payload(&self) -> Option<&[u8]> {
        self.message.payload()
    }

    fn partition(&self) -> i32 {
        self.message.partition()
    }

    fn offset(&self) -> i64 {
        self.message.offset()
    }
}

struct KafkaOffsets<'a> {
    consumer: &'a StreamConsumer,
    topic: &'a str,
}

impl OffsetStore for KafkaOffsets<'_> {
    fn store(&self, partition: i32, next_offset: i64) -> anyhow::Result<()> {
        self.consumer.store_offset(self.topic, partition, next_offset)?;
        Ok(())
    }
}

/// Long-lived consumer of one exchange through one durable queue.
pub struct BrokerListener {
    brokers: String,
    exchange: String,
    options: ListenerOptions,
}

impl BrokerListener {
    pub fn new(brokers: impl Into<String>, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            exchange: exchange.into(),
            options: ListenerOptions::new(queue),
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.options.prefetch = prefetch.max(1);
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.options.redelivery_delay = delay;
        self
    }

    pub async fn run<M, H>(self, handler: &H, shutdown: CancellationToken) -> Result<(), KafkaError>
    where
        M: DeserializeOwned + Send,
        H: MessageHandler<M> + ?Sized,
    {
        declare_exchange(&self.brokers, &self.exchange).await?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &self.options.queue)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[&self.exchange])?;

        info!(
            exchange = %self.exchange,
            queue = %self.options.queue,
            prefetch = self.options.prefetch,
            "Broker listener started"
        );

        let deliveries = consumer.stream().filter_map(KafkaDelivery::received);
        let offsets = KafkaOffsets {
            consumer: &consumer,
            topic: &self.exchange,
        };
        consume::<M, H, _, _>(deliveries, handler, &offsets, &self.options, shutdown).await;

        if let Err(e) = consumer.commit_consumer_state(rdkafka::consumer::CommitMode::Sync) {
            warn!(queue = %self.options.queue, error = %e, "Error committing offsets on shutdown");
        }
        info!(queue = %self.options.queue, "Broker listener stopped");
        Ok(())
    }
}
