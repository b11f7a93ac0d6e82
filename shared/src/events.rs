use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// An event exchanged between services through an outbox and a broker exchange.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Tag carried as the broker message type and stored on outbox/inbox rows.
    const TYPE: &'static str;

    /// Identifier assigned by the producer; consumers deduplicate on it.
    fn message_id(&self) -> Uuid;
}

/// Sent by Orders when an order needs to be paid from the user's balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaymentRequested {
    pub message_id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub created_at_utc: DateTime<Utc>,
}

impl OrderPaymentRequested {
    pub fn new(order_id: Uuid, user_id: Uuid, amount: BigDecimal) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            order_id,
            user_id,
            amount,
            created_at_utc: Utc::now(),
        }
    }
}

impl IntegrationEvent for OrderPaymentRequested {
    const TYPE: &'static str = "OrderPaymentRequested";

    fn message_id(&self) -> Uuid {
        self.message_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Success,
    Failed,
}

/// Sent by Payments with the result of a payment attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaymentStatusChanged {
    pub message_id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub status: PaymentStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub occurred_at_utc: DateTime<Utc>,
}

impl OrderPaymentStatusChanged {
    pub fn success(request: &OrderPaymentRequested) -> Self {
        Self::new(request, PaymentStatus::Success, None)
    }

    pub fn failed(request: &OrderPaymentRequested, reason: impl Into<String>) -> Self {
        Self::new(request, PaymentStatus::Failed, Some(reason.into()))
    }

    fn new(request: &OrderPaymentRequested, status: PaymentStatus, reason: Option<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            order_id: request.order_id,
            user_id: request.user_id,
            status,
            reason,
            occurred_at_utc: Utc::now(),
        }
    }
}

impl IntegrationEvent for OrderPaymentStatusChanged {
    const TYPE: &'static str = "OrderPaymentStatusChanged";

    fn message_id(&self) -> Uuid {
        self.message_id
    }
}
