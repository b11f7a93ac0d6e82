use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use uuid::Uuid;

use crate::db::PgUnitOfWork;
use crate::error::StoreError;
use crate::events::IntegrationEvent;
use crate::schema::inbox_messages;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = inbox_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct InboxMessage {
    pub id: Uuid,
    pub message_id: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub error: Option<String>,
}

impl InboxMessage {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = inbox_messages)]
pub struct NewInboxMessage {
    pub id: Uuid,
    pub message_id: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl NewInboxMessage {
    pub fn from_event<E: IntegrationEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            message_id: event.message_id().to_string(),
            message_type: E::TYPE.to_string(),
            payload: serde_json::to_value(event)?,
            received_at: Utc::now(),
        })
    }
}

/// Inbox access inside one open transaction.
#[async_trait]
pub trait InboxStore: Send {
    async fn find_inbox(&mut self, message_id: &str) -> Result<Option<InboxMessage>, StoreError>;

    /// Inserts the record unless one with the same message id exists, and
    /// returns whichever record is stored.
    async fn record_inbox_seen(&mut self, message: NewInboxMessage) -> Result<InboxMessage, StoreError>;

    async fn mark_inbox_processed(&mut self, message: &InboxMessage) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboxEntry {
    /// Not processed yet; the caller applies its effects and marks it processed.
    Pending(InboxMessage),
    AlreadyProcessed(InboxMessage),
}

/// Records `event` as received and reports whether its effects were already applied.
pub async fn admit<S, E>(store: &mut S, event: &E) -> Result<InboxEntry, StoreError>
where
    S: InboxStore + ?Sized,
    E: IntegrationEvent,
{
    let message_id = event.message_id().to_string();
    let record = match store.find_inbox(&message_id).await? {
        Some(existing) => existing,
        None => store.record_inbox_seen(NewInboxMessage::from_event(event)?).await?,
    };

    if record.is_processed() {
        Ok(InboxEntry::AlreadyProcessed(record))
    } else {
        Ok(InboxEntry::Pending(record))
    }
}

#[async_trait]
impl<'c> InboxStore for PgUnitOfWork<'c> {
    async fn find_inbox(&mut self, message_id: &str) -> Result<Option<InboxMessage>, StoreError> {
        let found = inbox_messages::table
            .filter(inbox_messages::message_id.eq(message_id))
            .select(InboxMessage::as_select())
            .first(self.conn())
            .await
            .optional()?;
        Ok(found)
    }

    async fn record_inbox_seen(&mut self, message: NewInboxMessage) -> Result<InboxMessage, StoreError> {
        let message_id = message.message_id.clone();
        diesel::insert_into(inbox_messages::table)
            .values(&message)
            .on_conflict(inbox_messages::message_id)
            .do_nothing()
            .execute(self.conn())
            .await?;

        let stored = inbox_messages::table
            .filter(inbox_messages::message_id.eq(&message_id))
            .select(InboxMessage::as_select())
            .first(self.conn())
            .await?;
        Ok(stored)
    }

    async fn mark_inbox_processed(&mut self, message: &InboxMessage) -> Result<(), StoreError> {
        diesel::update(inbox_messages::table.find(message.id))
            .set((
                inbox_messages::processed_at.eq(Some(Utc::now())),
                inbox_messages::attempt.eq(inbox_messages::attempt + 1),
            ))
            .execute(self.conn())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OrderPaymentRequested;
    use crate::testing::MemoryInbox;
    use bigdecimal::BigDecimal;

    fn request() -> OrderPaymentRequested {
        OrderPaymentRequested::new(Uuid::new_v4(), Uuid::new_v4(), BigDecimal::from(25))
    }

    #[tokio::test]
    async fn first_delivery_is_pending() {
        let mut inbox = MemoryInbox::default();
        let event = request();

        let entry = admit(&mut inbox, &event).await.unwrap();

        let InboxEntry::Pending(record) = entry else {
            panic!("expected pending entry, got {entry:?}");
        };
        assert_eq!(record.message_id, event.message_id.to_string());
        assert_eq!(record.message_type, "OrderPaymentRequested");
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn unprocessed_redelivery_reuses_the_record() {
        let mut inbox = MemoryInbox::default();
        let event = request();

        let first = admit(&mut inbox, &event).await.unwrap();
        let second = admit(&mut inbox, &event).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn processed_message_is_reported_as_duplicate() {
        let mut inbox = MemoryInbox::default();
        let event = request();

        let InboxEntry::Pending(record) = admit(&mut inbox, &event).await.unwrap() else {
            panic!("expected pending entry");
        };
        inbox.mark_inbox_processed(&record).await.unwrap();

        let again = admit(&mut inbox, &event).await.unwrap();
        let InboxEntry::AlreadyProcessed(stored) = again else {
            panic!("expected duplicate, got {again:?}");
        };
        assert_eq!(stored.attempt, 1);
        assert!(stored.processed_at.is_some());
    }
}
