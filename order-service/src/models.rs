use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::PaymentStatus;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    Finished,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "New",
            OrderStatus::Finished => "Finished",
            OrderStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "New" => Some(OrderStatus::New),
            "Finished" => Some(OrderStatus::Finished),
            "Cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn for_payment(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Success => OrderStatus::Finished,
            PaymentStatus::Failed => OrderStatus::Cancelled,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub description: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

impl Order {
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub description: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Order as returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub description: String,
    pub status: String,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: Option<DateTime<Utc>>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            amount: order.amount,
            description: order.description,
            status: order.status,
            created_at_utc: order.created_at,
            updated_at_utc: order.updated_at,
        }
    }
}

/// Pushed to subscribers of an order when its status is settled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderStatusNotification {
    pub id: Uuid,
    pub status: String,
}
