//! In-memory stand-ins for the storage and broker seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::broker::MessagePublisher;
use crate::error::{PublishError, StoreError};
use crate::events::IntegrationEvent;
use crate::inbox::{InboxMessage, InboxStore, NewInboxMessage};
use crate::outbox::{NewOutboxMessage, OutboxMessage, OutboxSink, OutboxStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outbox table shared between a dispatcher under test and the test body.
#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    rows: Arc<Mutex<Vec<OutboxMessage>>>,
}

impl MemoryOutboxStore {
    pub fn push(&self, message: NewOutboxMessage) -> Uuid {
        let id = message.id;
        lock(&self.rows).push(OutboxMessage {
            id,
            message_type: message.message_type,
            payload: message.payload,
            created_at: message.created_at,
            processed_at: None,
            attempt: 0,
            error: None,
        });
        id
    }

    pub fn all(&self) -> Vec<OutboxMessage> {
        lock(&self.rows).clone()
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxMessage> {
        lock(&self.rows).iter().find(|m| m.id == id).cloned()
    }

    pub fn unprocessed_count(&self) -> usize {
        lock(&self.rows).iter().filter(|m| !m.is_processed()).count()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut pending: Vec<OutboxMessage> =
            lock(&self.rows).iter().filter(|m| !m.is_processed()).cloned().collect();
        pending.sort_by_key(|m| m.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn save(&self, messages: &[OutboxMessage]) -> Result<(), StoreError> {
        let mut rows = lock(&self.rows);
        for message in messages {
            if let Some(row) = rows.iter_mut().find(|r| r.id == message.id) {
                if row.processed_at.is_none() {
                    row.processed_at = message.processed_at;
                }
                row.attempt = message.attempt;
                row.error = message.error.clone();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub message_type: String,
    pub message_id: Uuid,
    pub body: Vec<u8>,
}

impl Published {
    pub fn decode<E: IntegrationEvent>(&self) -> E {
        serde_json::from_slice(&self.body).unwrap_or_else(|e| {
            panic!("published {} body does not decode: {e}", self.message_type)
        })
    }
}

/// Publisher that records what it was asked to send and can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<Published>>>,
    failures: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<Published> {
        lock(&self.published).clone()
    }

    /// Makes the next `times` publishes of `message_id` fail.
    pub fn fail_times(&self, message_id: Uuid, times: usize) {
        lock(&self.failures).insert(message_id, times);
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(
        &self,
        exchange: &str,
        message_type: &str,
        message_id: Uuid,
        body: &[u8],
    ) -> Result<(), PublishError> {
        if let Some(left) = lock(&self.failures).get_mut(&message_id) {
            if *left > 0 {
                *left -= 1;
                return Err(PublishError::Rejected {
                    exchange: exchange.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }
        }

        lock(&self.published).push(Published {
            exchange: exchange.to_string(),
            message_type: message_type.to_string(),
            message_id,
            body: body.to_vec(),
        });
        Ok(())
    }
}

/// Inbox rows held by value, so a unit of work can copy them and commit by swapping back.
#[derive(Debug, Clone, Default)]
pub struct MemoryInbox {
    rows: Vec<InboxMessage>,
}

impl MemoryInbox {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn find(&self, message_id: &str) -> Option<&InboxMessage> {
        self.rows.iter().find(|r| r.message_id == message_id)
    }

    /// Applies the rows of a finished unit of work, enforcing message id uniqueness.
    /// Nothing is applied when a row collides.
    pub fn merge(&mut self, other: &MemoryInbox) -> Result<(), StoreError> {
        for row in &other.rows {
            let collides = self
                .rows
                .iter()
                .any(|r| r.message_id == row.message_id && r.id != row.id);
            if collides {
                return Err(StoreError::UniqueViolation("ix_inbox_messages_message_id".into()));
            }
        }
        for row in &other.rows {
            match self.rows.iter_mut().find(|r| r.id == row.id) {
                Some(existing) => *existing = row.clone(),
                None => self.rows.push(row.clone()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InboxStore for MemoryInbox {
    async fn find_inbox(&mut self, message_id: &str) -> Result<Option<InboxMessage>, StoreError> {
        Ok(self.find(message_id).cloned())
    }

    async fn record_inbox_seen(&mut self, message: NewInboxMessage) -> Result<InboxMessage, StoreError> {
        if let Some(existing) = self.find(&message.message_id) {
            return Ok(existing.clone());
        }
        let row = InboxMessage {
            id: message.id,
            message_id: message.message_id,
            message_type: message.message_type,
            payload: message.payload,
            received_at: message.received_at,
            processed_at: None,
            attempt: 0,
            error: None,
        };
        self.rows.push(row.clone());
        Ok(row)
    }

    async fn mark_inbox_processed(&mut self, message: &InboxMessage) -> Result<(), StoreError> {
        if let Some(row) = self.rows.iter_mut().find(|r| r.id == message.id) {
            row.processed_at = Some(Utc::now());
            row.attempt += 1;
        }
        Ok(())
    }
}

/// Outbox rows appended by a unit of work, held by value like [`MemoryInbox`].
#[derive(Debug, Clone, Default)]
pub struct MemoryOutbox {
    rows: Vec<NewOutboxMessage>,
}

impl MemoryOutbox {
    pub fn messages(&self) -> &[NewOutboxMessage] {
        &self.rows
    }

    pub fn decode<E: IntegrationEvent>(&self) -> Vec<E> {
        self.rows
            .iter()
            .filter(|r| r.message_type == E::TYPE)
            .map(|r| {
                serde_json::from_value(r.payload.clone())
                    .unwrap_or_else(|e| panic!("outbox {} payload does not decode: {e}", r.message_type))
            })
            .collect()
    }
}

#[async_trait]
impl OutboxSink for MemoryOutbox {
    async fn append_outbox(&mut self, message: NewOutboxMessage) -> Result<(), StoreError> {
        self.rows.push(message);
        Ok(())
    }
}
