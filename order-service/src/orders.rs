use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::db::{DbPool, PgUnitOfWork};
use shared::error::PoolError;
use shared::money::{check_amount, AmountError};
use shared::outbox::{self, OutboxSink};
use shared::{OrderPaymentRequested, Retryable, StoreError};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::*;
use crate::schema::orders;

pub const MAX_DESCRIPTION_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    InvalidAmount(#[from] AmountError),

    #[error("Description must be at most {MAX_DESCRIPTION_LEN} characters")]
    DescriptionTooLong,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DieselError> for OrderError {
    fn from(err: DieselError) -> Self {
        OrderError::Store(err.into())
    }
}

impl From<PoolError> for OrderError {
    fn from(err: PoolError) -> Self {
        OrderError::Store(err.into())
    }
}

impl Retryable for OrderError {
    fn is_conflict(&self) -> bool {
        matches!(self, OrderError::Store(e) if e.is_conflict())
    }
}

/// Order rows as seen from inside one open transaction.
#[async_trait]
pub trait OrderStore: Send {
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError>;

    async fn find_order(&mut self, order_id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Newest first.
    async fn orders_by_user(&mut self, user_id: Uuid) -> Result<Vec<Order>, StoreError>;

    /// Sets the status if the row still carries `expected_version`, bumping the
    /// version. A row that moved on fails with [`StoreError::Conflict`].
    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        expected_version: i32,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<Order, StoreError>;
}

/// A validated request to place an order.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    user_id: Uuid,
    amount: BigDecimal,
    description: String,
}

impl PlaceOrder {
    pub fn new(user_id: Uuid, amount: BigDecimal, description: String) -> Result<Self, OrderError> {
        check_amount(&amount)?;
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(OrderError::DescriptionTooLong);
        }
        Ok(Self {
            user_id,
            amount,
            description,
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

/// Stores a new order and queues its payment request in the same unit of work.
pub async fn place_order<U>(uow: &mut U, command: PlaceOrder) -> Result<Order, OrderError>
where
    U: OrderStore + OutboxSink + ?Sized,
{
    let order = uow
        .insert_order(NewOrder {
            id: Uuid::new_v4(),
            user_id: command.user_id,
            amount: command.amount,
            description: command.description,
            status: OrderStatus::New.as_str().to_string(),
            created_at: Utc::now(),
        })
        .await?;

    let request = OrderPaymentRequested::new(order.id, order.user_id, order.amount.clone());
    outbox::append(uow, &request).await?;

    Ok(order)
}

#[derive(Clone)]
pub struct PgOrders {
    pool: DbPool,
}

impl PgOrders {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn place(&self, command: PlaceOrder) -> Result<Order, OrderError> {
        let mut conn = self.pool.get().await?;
        let order = conn
            .transaction::<_, OrderError, _>(|conn| {
                Box::pin(async move { place_order(&mut PgUnitOfWork::new(conn), command).await })
            })
            .await?;

        info!(order_id = %order.id, amount = %order.amount, user_id = %order.user_id, "Order created");
        Ok(order)
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Option<Order>, OrderError> {
        let mut conn = self.pool.get().await?;
        let order = PgUnitOfWork::new(&mut conn).find_order(order_id).await?;
        Ok(order)
    }

    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Order>, OrderError> {
        let mut conn = self.pool.get().await?;
        let orders = PgUnitOfWork::new(&mut conn).orders_by_user(user_id).await?;
        Ok(orders)
    }
}

#[async_trait]
impl<'c> OrderStore for PgUnitOfWork<'c> {
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError> {
        let order = diesel::insert_into(orders::table)
            .values(&order)
            .returning(Order::as_returning())
            .get_result(self.conn())
            .await?;
        Ok(order)
    }

    async fn find_order(&mut self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let order = orders::table
            .find(order_id)
            .select(Order::as_select())
            .first(self.conn())
            .await
            .optional()?;
        Ok(order)
    }

    async fn orders_by_user(&mut self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let orders = orders::table
            .filter(orders::user_id.eq(user_id))
            .order(orders::created_at.desc())
            .select(Order::as_select())
            .load(self.conn())
            .await?;
        Ok(orders)
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        expected_version: i32,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let updated = diesel::update(
            orders::table
                .filter(orders::id.eq(order_id))
                .filter(orders::version.eq(expected_version)),
        )
        .set((
            orders::status.eq(status.as_str()),
            orders::updated_at.eq(Some(updated_at)),
            orders::version.eq(expected_version + 1),
        ))
        .returning(Order::as_returning())
        .get_result(self.conn())
        .await
        .optional()?;

        updated.ok_or(StoreError::Conflict("orders"))
    }
}
