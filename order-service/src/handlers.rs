use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel_async::AsyncConnection;
use shared::broker::MessageHandler;
use shared::db::{retry_on_conflict, DbPool, PgUnitOfWork, MAX_CONFLICT_ATTEMPTS};
use shared::inbox::{self, InboxEntry, InboxStore};
use shared::OrderPaymentStatusChanged;
use tracing::{info, warn};

use crate::models::{Order, OrderStatus, OrderStatusNotification};
use crate::notifications::SubscriptionRegistry;
use crate::orders::{OrderError, OrderStore};

#[derive(Debug, Clone, PartialEq)]
pub enum StatusStep {
    /// The message was handled by an earlier delivery.
    Duplicate,
    OrderMissing,
    Updated(Order),
    /// The order already had the requested status.
    Unchanged(Order),
    /// The order is settled with the other terminal status.
    Rejected(Order),
}

impl StatusStep {
    /// What subscribers of the order are told once the step is committed.
    pub fn notification(&self) -> Option<OrderStatusNotification> {
        match self {
            StatusStep::Updated(order) | StatusStep::Unchanged(order) => Some(OrderStatusNotification {
                id: order.id,
                status: order.status.clone(),
            }),
            _ => None,
        }
    }
}

/// Moves the order to the status implied by a payment result inside the caller's unit of work.
pub async fn apply_payment_status<U>(uow: &mut U, event: &OrderPaymentStatusChanged) -> Result<StatusStep, OrderError>
where
    U: OrderStore + InboxStore + ?Sized,
{
    let record = match inbox::admit(uow, event).await? {
        InboxEntry::AlreadyProcessed(_) => {
            info!(message_id = %event.message_id, "Payment status message already processed");
            return Ok(StatusStep::Duplicate);
        }
        InboxEntry::Pending(record) => record,
    };

    let step = match uow.find_order(event.order_id).await? {
        None => {
            warn!(order_id = %event.order_id, status = ?event.status, "Order not found for payment status");
            StatusStep::OrderMissing
        }
        Some(order) => {
            let target = OrderStatus::for_payment(event.status);
            match order.status() {
                Some(current) if current == target => StatusStep::Unchanged(order),
                Some(OrderStatus::New) => {
                    let updated = uow
                        .update_order_status(order.id, order.version, target, Utc::now())
                        .await?;
                    StatusStep::Updated(updated)
                }
                _ => {
                    warn!(
                        order_id = %order.id,
                        current = %order.status,
                        target = %target,
                        "Invalid order status transition, ignoring"
                    );
                    StatusStep::Rejected(order)
                }
            }
        }
    };

    uow.mark_inbox_processed(&record).await?;
    Ok(step)
}

pub struct PaymentStatusHandler {
    pool: DbPool,
    notifications: SubscriptionRegistry,
}

impl PaymentStatusHandler {
    pub fn new(pool: DbPool, notifications: SubscriptionRegistry) -> Self {
        Self { pool, notifications }
    }

    async fn process_once(&self, event: &OrderPaymentStatusChanged) -> Result<StatusStep, OrderError> {
        let event = event.clone();
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, OrderError, _>(|conn| {
            Box::pin(async move {
                let mut uow = PgUnitOfWork::new(conn);
                apply_payment_status(&mut uow, &event).await
            })
        })
        .await
    }
}

#[async_trait]
impl MessageHandler<OrderPaymentStatusChanged> for PaymentStatusHandler {
    async fn handle(&self, event: OrderPaymentStatusChanged) -> Result<()> {
        let step = retry_on_conflict("payment_status", MAX_CONFLICT_ATTEMPTS, |_| self.process_once(&event)).await?;

        if let Some(notification) = step.notification() {
            info!(order_id = %notification.id, status = %notification.status, "Order status set");
            let delivered = self.notifications.publish(notification);
            if delivered > 0 {
                info!(order_id = %event.order_id, subscribers = delivered, "Order status pushed to subscribers");
            }
        }
        Ok(())
    }
}
