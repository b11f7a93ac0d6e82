//! In-memory orders database; commits re-check order versions before applying.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use shared::inbox::{InboxMessage, InboxStore, NewInboxMessage};
use shared::outbox::{NewOutboxMessage, OutboxSink};
use shared::testing::{MemoryInbox, MemoryOutbox};
use shared::{IntegrationEvent, StoreError};
use uuid::Uuid;

use crate::models::{NewOrder, Order, OrderStatus};
use crate::orders::{OrderError, OrderStore};

#[derive(Default)]
struct OrdersState {
    orders: Vec<Order>,
    inbox: MemoryInbox,
    outbox: Vec<NewOutboxMessage>,
}

#[derive(Clone, Default)]
pub struct MemoryOrders {
    state: Arc<Mutex<OrdersState>>,
}

impl MemoryOrders {
    fn lock(&self) -> MutexGuard<'_, OrdersState> {
        self.state.lock().unwrap()
    }

    pub fn seed(&self, user_id: Uuid, status: OrderStatus, created_at: DateTime<Utc>) -> Uuid {
        let order = Order {
            id: Uuid::new_v4(),
            user_id,
            amount: BigDecimal::from(300),
            description: String::new(),
            status: status.as_str().to_string(),
            created_at,
            updated_at: None,
            version: 0,
        };
        let id = order.id;
        self.lock().orders.push(order);
        id
    }

    pub fn get(&self, order_id: Uuid) -> Option<Order> {
        self.lock().orders.iter().find(|o| o.id == order_id).cloned()
    }

    pub fn all(&self) -> Vec<Order> {
        self.lock().orders.clone()
    }

    pub fn inbox(&self) -> MemoryInbox {
        self.lock().inbox.clone()
    }

    pub fn outbox_events<E: IntegrationEvent>(&self) -> Vec<E> {
        self.lock()
            .outbox
            .iter()
            .filter(|m| m.message_type == E::TYPE)
            .map(|m| serde_json::from_value(m.payload.clone()).unwrap())
            .collect()
    }

    pub async fn transaction<T, F>(&self, work: F) -> Result<T, OrderError>
    where
        F: for<'u> FnOnce(&'u mut MemoryUnit) -> BoxFuture<'u, Result<T, OrderError>>,
    {
        let mut unit = MemoryUnit::begin(&self.lock());
        let value = work(&mut unit).await?;
        unit.commit(&mut self.lock())?;
        Ok(value)
    }
}

pub struct MemoryUnit {
    orders: Vec<Order>,
    inbox: MemoryInbox,
    outbox: MemoryOutbox,
    new_orders: Vec<Order>,
    // Version the committed row must still have.
    order_writes: HashMap<Uuid, i32>,
}

impl MemoryUnit {
    fn begin(state: &OrdersState) -> Self {
        Self {
            orders: state.orders.clone(),
            inbox: state.inbox.clone(),
            outbox: MemoryOutbox::default(),
            new_orders: Vec::new(),
            order_writes: HashMap::new(),
        }
    }

    fn commit(self, state: &mut OrdersState) -> Result<(), StoreError> {
        for (order_id, expected) in &self.order_writes {
            let current = state.orders.iter().find(|o| o.id == *order_id).map(|o| o.version);
            if current != Some(*expected) {
                return Err(StoreError::Conflict("orders"));
            }
        }
        let mut inbox = state.inbox.clone();
        inbox.merge(&self.inbox)?;

        for order_id in self.order_writes.keys() {
            let written = self.orders.iter().find(|o| o.id == *order_id);
            let stored = state.orders.iter_mut().find(|o| o.id == *order_id);
            if let (Some(written), Some(stored)) = (written, stored) {
                *stored = written.clone();
            }
        }
        state.orders.extend(self.new_orders);
        state.inbox = inbox;
        state.outbox.extend(self.outbox.messages().iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryUnit {
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError> {
        let order = Order {
            id: order.id,
            user_id: order.user_id,
            amount: order.amount,
            description: order.description,
            status: order.status,
            created_at: order.created_at,
            updated_at: None,
            version: 0,
        };
        self.orders.push(order.clone());
        self.new_orders.push(order.clone());
        Ok(order)
    }

    async fn find_order(&mut self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.iter().find(|o| o.id == order_id).cloned())
    }

    async fn orders_by_user(&mut self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self.orders.iter().filter(|o| o.user_id == user_id).cloned().collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        expected_version: i32,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        // Lets a concurrent unit of work interleave here, like a database round trip would.
        tokio::task::yield_now().await;

        let order = self
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.version == expected_version)
            .ok_or(StoreError::Conflict("orders"))?;
        self.order_writes.entry(order_id).or_insert(expected_version);
        order.status = status.as_str().to_string();
        order.updated_at = Some(updated_at);
        order.version += 1;
        Ok(order.clone())
    }
}

#[async_trait]
impl InboxStore for MemoryUnit {
    async fn find_inbox(&mut self, message_id: &str) -> Result<Option<InboxMessage>, StoreError> {
        self.inbox.find_inbox(message_id).await
    }

    async fn record_inbox_seen(&mut self, message: NewInboxMessage) -> Result<InboxMessage, StoreError> {
        self.inbox.record_inbox_seen(message).await
    }

    async fn mark_inbox_processed(&mut self, message: &InboxMessage) -> Result<(), StoreError> {
        self.inbox.mark_inbox_processed(message).await
    }
}

#[async_trait]
impl OutboxSink for MemoryUnit {
    async fn append_outbox(&mut self, message: NewOutboxMessage) -> Result<(), StoreError> {
        self.outbox.append_outbox(message).await
    }
}
