use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::Serialize;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::broker::MessagePublisher;
use crate::db::{DbPool, PgUnitOfWork};
use crate::error::StoreError;
use crate::events::IntegrationEvent;
use crate::schema::outbox_messages;

pub const DEFAULT_BATCH_SIZE: i64 = 50;
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = outbox_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxMessage {
    pub id: Uuid,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub error: Option<String>,
}

impl OutboxMessage {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Records a successful publish. `processed_at` is only ever set once.
    pub fn mark_processed(&mut self, at: DateTime<Utc>) {
        if self.processed_at.is_none() {
            self.processed_at = Some(at);
        }
        self.attempt += 1;
    }

    /// Records a failed publish; the row stays queued for the next cycle.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempt += 1;
        self.error = Some(error.into());
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = outbox_messages)]
pub struct NewOutboxMessage {
    pub id: Uuid,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxMessage {
    pub fn from_event<E: IntegrationEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            message_type: E::TYPE.to_string(),
            payload: serde_json::to_value(event)?,
            created_at: Utc::now(),
        })
    }
}

/// Write side of the outbox. Implementations append through an already open
/// transaction and never commit on their own.
#[async_trait]
pub trait OutboxSink: Send {
    async fn append_outbox(&mut self, message: NewOutboxMessage) -> Result<(), StoreError>;
}

/// Queues `event` in the caller's unit of work.
pub async fn append<S, E>(sink: &mut S, event: &E) -> Result<(), StoreError>
where
    S: OutboxSink + ?Sized,
    E: IntegrationEvent,
{
    let message = NewOutboxMessage::from_event(event)?;
    debug!(
        outbox_id = %message.id,
        message_type = %message.message_type,
        message_id = %event.message_id(),
        "Queued outbox message"
    );
    sink.append_outbox(message).await
}

#[async_trait]
impl<'c> OutboxSink for PgUnitOfWork<'c> {
    async fn append_outbox(&mut self, message: NewOutboxMessage) -> Result<(), StoreError> {
        diesel::insert_into(outbox_messages::table)
            .values(&message)
            .execute(self.conn())
            .await?;
        Ok(())
    }
}

/// Read side of the outbox, used by the dispatcher.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unprocessed rows, oldest first, at most `limit`.
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Persists the marks of one dispatch cycle in a single commit.
    async fn save(&self, messages: &[OutboxMessage]) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: DbPool,
}

impl PgOutboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut conn = self.pool.get().await?;

        let messages = outbox_messages::table
            .filter(outbox_messages::processed_at.is_null())
            .order(outbox_messages::created_at.asc())
            .limit(limit)
            .select(OutboxMessage::as_select())
            .load(&mut conn)
            .await?;

        Ok(messages)
    }

    async fn save(&self, messages: &[OutboxMessage]) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get().await?;
        let messages = messages.to_vec();

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                for message in &messages {
                    match message.processed_at {
                        // Guarded so a concurrent dispatcher's mark is never overwritten.
                        Some(processed_at) => {
                            diesel::update(
                                outbox_messages::table
                                    .find(message.id)
                                    .filter(outbox_messages::processed_at.is_null()),
                            )
                            .set((
                                outbox_messages::processed_at.eq(processed_at),
                                outbox_messages::attempt.eq(message.attempt),
                                outbox_messages::error.eq(message.error.as_deref()),
                            ))
                            .execute(conn)
                            .await?;
                        }
                        None => {
                            diesel::update(outbox_messages::table.find(message.id))
                                .set((
                                    outbox_messages::attempt.eq(message.attempt),
                                    outbox_messages::error.eq(message.error.as_deref()),
                                ))
                                .execute(conn)
                                .await?;
                        }
                    }
                }
                Ok(())
            })
        })
        .await
    }
}

/// Drains an outbox to one broker exchange.
///
/// Publish-then-mark is not atomic: a row whose publish succeeded but whose mark
/// was not saved is published again on a later cycle. Consumers deduplicate on
/// the event's message id, so the dispatcher does not try to prevent this.
/// Running several dispatchers over the same table has the same effect.
pub struct OutboxDispatcher<S, P> {
    store: S,
    publisher: P,
    exchange: String,
    batch_size: i64,
    idle_delay: Duration,
}

impl<S, P> OutboxDispatcher<S, P>
where
    S: OutboxStore,
    P: MessagePublisher,
{
    pub fn new(store: S, publisher: P, exchange: impl Into<String>) -> Self {
        Self {
            store,
            publisher,
            exchange: exchange.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            idle_delay: DEFAULT_IDLE_DELAY,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(exchange = %self.exchange, batch_size = self.batch_size, "Outbox dispatcher started");

        while !shutdown.is_cancelled() {
            let idle = match self.dispatch_batch().await {
                Ok(0) => true,
                Ok(count) => {
                    debug!(exchange = %self.exchange, count, "Dispatched outbox batch");
                    false
                }
                Err(e) => {
                    error!(exchange = %self.exchange, error = %e, "Error processing outbox messages");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = time::sleep(self.idle_delay) => {}
                }
            }
        }

        info!(exchange = %self.exchange, "Outbox dispatcher stopped");
    }

    /// Runs one cycle and returns how many rows it fetched.
    pub async fn dispatch_batch(&self) -> Result<usize, StoreError> {
        let mut messages = self.store.fetch_unprocessed(self.batch_size).await?;
        if messages.is_empty() {
            return Ok(0);
        }

        for message in messages.iter_mut() {
            let body = serde_json::to_vec(&message.payload)?;
            match self
                .publisher
                .publish(&self.exchange, &message.message_type, message.id, &body)
                .await
            {
                Ok(()) => {
                    message.mark_processed(Utc::now());
                    info!(
                        outbox_id = %message.id,
                        message_type = %message.message_type,
                        "Published outbox message"
                    );
                }
                Err(e) => {
                    error!(
                        outbox_id = %message.id,
                        attempt = message.attempt + 1,
                        error = %e,
                        "Failed to dispatch outbox message"
                    );
                    message.record_failure(e.to_string());
                }
            }
        }

        self.store.save(&messages).await?;
        Ok(messages.len())
    }
}
