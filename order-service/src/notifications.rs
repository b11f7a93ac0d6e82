use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::models::OrderStatusNotification;

type Sender = UnboundedSender<OrderStatusNotification>;

#[derive(Default)]
struct Groups {
    next_key: u64,
    by_order: HashMap<Uuid, Vec<(u64, Sender)>>,
}

impl Groups {
    fn remove(&mut self, order_id: Uuid, key: u64) {
        if let Some(subscribers) = self.by_order.get_mut(&order_id) {
            subscribers.retain(|(k, _)| *k != key);
            if subscribers.is_empty() {
                self.by_order.remove(&order_id);
            }
        }
    }
}

/// Live subscribers per order id. A subscriber leaves its group when its
/// [`Subscription`] is dropped.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    groups: Arc<Mutex<Groups>>,
}

impl SubscriptionRegistry {
    fn groups(&self) -> MutexGuard<'_, Groups> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, order_id: Uuid) -> Subscription {
        let (tx, rx) = unbounded_channel();
        let mut groups = self.groups();
        let key = groups.next_key;
        groups.next_key += 1;
        groups.by_order.entry(order_id).or_default().push((key, tx));
        drop(groups);

        debug!(%order_id, "Subscriber joined order");
        Subscription {
            order_id,
            key,
            registry: self.clone(),
            notifications: UnboundedReceiverStream::new(rx),
        }
    }

    /// Sends `notification` to every subscriber of its order. Returns how many received it.
    pub fn publish(&self, notification: OrderStatusNotification) -> usize {
        let mut groups = self.groups();
        let Some(subscribers) = groups.by_order.get_mut(&notification.id) else {
            return 0;
        };

        subscribers.retain(|(_, tx)| tx.send(notification.clone()).is_ok());
        let delivered = subscribers.len();
        if delivered == 0 {
            groups.by_order.remove(&notification.id);
        }
        delivered
    }

    pub fn subscriber_count(&self, order_id: Uuid) -> usize {
        self.groups().by_order.get(&order_id).map_or(0, Vec::len)
    }

    /// Number of orders with at least one subscriber.
    pub fn order_count(&self) -> usize {
        self.groups().by_order.len()
    }
}

/// Status changes of one order, in publish order.
pub struct Subscription {
    order_id: Uuid,
    key: u64,
    registry: SubscriptionRegistry,
    notifications: UnboundedReceiverStream<OrderStatusNotification>,
}

impl Stream for Subscription {
    type Item = OrderStatusNotification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.notifications).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.groups().remove(self.order_id, self.key);
        debug!(order_id = %self.order_id, "Subscriber left order");
    }
}
