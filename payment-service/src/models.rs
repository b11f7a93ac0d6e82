use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = crate::schema::accounts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::accounts)]
pub struct NewAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl NewAccount {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::account_balances)]
#[diesel(primary_key(account_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AccountBalance {
    pub account_id: Uuid,
    pub balance: BigDecimal,
    pub version: i32,
}

impl AccountBalance {
    pub fn zero(account_id: Uuid) -> Self {
        Self {
            account_id,
            balance: BigDecimal::from(0),
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = crate::schema::account_transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AccountTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub order_id: Option<Uuid>,
    pub delta: BigDecimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::account_transactions)]
pub struct NewAccountTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub order_id: Option<Uuid>,
    pub delta: BigDecimal,
    pub created_at: DateTime<Utc>,
}

impl NewAccountTransaction {
    pub fn top_up(account_id: Uuid, amount: &BigDecimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            order_id: None,
            delta: amount.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn debit(account_id: Uuid, order_id: Uuid, amount: &BigDecimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            order_id: Some(order_id),
            delta: -amount.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Balance as returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub account_id: Uuid,
    pub user_id: Uuid,
    pub balance: BigDecimal,
}

impl BalanceView {
    pub fn new(account: &Account, balance: &AccountBalance) -> Self {
        Self {
            account_id: account.id,
            user_id: account.user_id,
            balance: balance.balance.clone(),
        }
    }
}
