use async_trait::async_trait;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::db::{retry_on_conflict, DbPool, PgUnitOfWork, MAX_CONFLICT_ATTEMPTS};
use shared::error::PoolError;
use shared::money::{check_amount, AmountError};
use shared::{Retryable, StoreError};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::*;
use crate::schema::{account_balances, account_transactions, accounts};

pub const ACCOUNT_NOT_FOUND: &str = "Account not found";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Account not found")]
    AccountNotFound,

    #[error(transparent)]
    InvalidAmount(#[from] AmountError),

    #[error("balance update lost {attempts} concurrency races")]
    ConcurrencyExhausted { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Business outcomes are final and reported to the caller; everything else is infrastructure.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientFunds | LedgerError::AccountNotFound | LedgerError::InvalidAmount(_)
        )
    }
}

impl From<DieselError> for LedgerError {
    fn from(err: DieselError) -> Self {
        LedgerError::Store(err.into())
    }
}

impl From<PoolError> for LedgerError {
    fn from(err: PoolError) -> Self {
        LedgerError::Store(err.into())
    }
}

impl Retryable for LedgerError {
    fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Store(e) if e.is_conflict())
    }
}

/// Ledger rows as seen from inside one open transaction.
#[async_trait]
pub trait LedgerStore: Send {
    async fn find_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn find_account_by_user(&mut self, user_id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn insert_account(&mut self, account: NewAccount) -> Result<Account, StoreError>;

    async fn find_balance(&mut self, account_id: Uuid) -> Result<Option<AccountBalance>, StoreError>;

    async fn insert_balance_if_absent(&mut self, balance: AccountBalance) -> Result<(), StoreError>;

    async fn find_order_transaction(&mut self, order_id: Uuid) -> Result<Option<AccountTransaction>, StoreError>;

    async fn insert_transaction(&mut self, transaction: NewAccountTransaction) -> Result<(), StoreError>;

    /// Writes `balance` if the row still carries `expected_version`, bumping the
    /// version. A row that moved on fails with [`StoreError::Conflict`].
    async fn update_balance(
        &mut self,
        account_id: Uuid,
        expected_version: i32,
        balance: BigDecimal,
    ) -> Result<AccountBalance, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    Applied(AccountBalance),
    /// A debit for the same order is already on the books.
    AlreadyApplied,
}

pub async fn get_or_create_balance<S>(store: &mut S, account_id: Uuid) -> Result<AccountBalance, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    if let Some(balance) = store.find_balance(account_id).await? {
        return Ok(balance);
    }

    store.insert_balance_if_absent(AccountBalance::zero(account_id)).await?;
    store
        .find_balance(account_id)
        .await?
        .ok_or(LedgerError::AccountNotFound)
}

/// One read-modify-write of a top-up. Does not commit; `amount` is checked by [`Ledger::top_up`].
pub async fn apply_top_up<S>(store: &mut S, account_id: Uuid, amount: &BigDecimal) -> Result<BalanceView, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    let account = store
        .find_account(account_id)
        .await?
        .ok_or(LedgerError::AccountNotFound)?;

    let current = get_or_create_balance(store, account_id).await?;
    store
        .insert_transaction(NewAccountTransaction::top_up(account_id, amount))
        .await?;
    let updated = store
        .update_balance(account_id, current.version, &current.balance + amount)
        .await?;

    Ok(BalanceView::new(&account, &updated))
}

/// One read-modify-write of a debit for `order_id`. Does not commit.
pub async fn apply_debit<S>(
    store: &mut S,
    account_id: Uuid,
    order_id: Uuid,
    amount: &BigDecimal,
) -> Result<DebitOutcome, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    if store.find_order_transaction(order_id).await?.is_some() {
        debug!(%order_id, "Debit already applied");
        return Ok(DebitOutcome::AlreadyApplied);
    }
    check_amount(amount)?;

    let current = get_or_create_balance(store, account_id).await?;
    if current.balance < *amount {
        return Err(LedgerError::InsufficientFunds);
    }

    store
        .insert_transaction(NewAccountTransaction::debit(account_id, order_id, amount))
        .await?;
    let updated = store
        .update_balance(account_id, current.version, &current.balance - amount)
        .await?;

    Ok(DebitOutcome::Applied(updated))
}

/// Runs single ledger operations, each in its own committed transaction.
#[async_trait]
pub trait LedgerTransactions: Send + Sync {
    async fn top_up_once(&self, account_id: Uuid, amount: &BigDecimal) -> Result<BalanceView, LedgerError>;

    async fn debit_once(&self, account_id: Uuid, order_id: Uuid, amount: &BigDecimal)
        -> Result<DebitOutcome, LedgerError>;
}

/// Balance mutations with bounded retry on lost concurrency races.
pub struct Ledger<T> {
    transactions: T,
    max_attempts: u32,
}

impl<T: LedgerTransactions> Ledger<T> {
    pub fn new(transactions: T) -> Self {
        Self {
            transactions,
            max_attempts: MAX_CONFLICT_ATTEMPTS,
        }
    }

    pub async fn top_up(&self, account_id: Uuid, amount: &BigDecimal) -> Result<BalanceView, LedgerError> {
        check_amount(amount)?;

        let result = retry_on_conflict("top_up", self.max_attempts, |_| {
            self.transactions.top_up_once(account_id, amount)
        })
        .await;

        let view = self.settle(result)?;
        info!(%account_id, %amount, balance = %view.balance, "Account topped up");
        Ok(view)
    }

    pub async fn try_debit(
        &self,
        account_id: Uuid,
        order_id: Uuid,
        amount: &BigDecimal,
    ) -> Result<DebitOutcome, LedgerError> {
        let result = retry_on_conflict("debit", self.max_attempts, |_| {
            self.transactions.debit_once(account_id, order_id, amount)
        })
        .await;

        self.settle(result)
    }

    fn settle<V>(&self, result: Result<V, LedgerError>) -> Result<V, LedgerError> {
        result.map_err(|e| {
            if e.is_conflict() {
                LedgerError::ConcurrencyExhausted {
                    attempts: self.max_attempts,
                }
            } else {
                e
            }
        })
    }
}

#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerTransactions for PgLedger {
    async fn top_up_once(&self, account_id: Uuid, amount: &BigDecimal) -> Result<BalanceView, LedgerError> {
        let amount = amount.clone();
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                let mut uow = PgUnitOfWork::new(conn);
                apply_top_up(&mut uow, account_id, &amount).await
            })
        })
        .await
    }

    async fn debit_once(
        &self,
        account_id: Uuid,
        order_id: Uuid,
        amount: &BigDecimal,
    ) -> Result<DebitOutcome, LedgerError> {
        let amount = amount.clone();
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                let mut uow = PgUnitOfWork::new(conn);
                apply_debit(&mut uow, account_id, order_id, &amount).await
            })
        })
        .await
    }
}

#[async_trait]
impl<'c> LedgerStore for PgUnitOfWork<'c> {
    async fn find_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        let account = accounts::table
            .find(account_id)
            .select(Account::as_select())
            .first(self.conn())
            .await
            .optional()?;
        Ok(account)
    }

    async fn find_account_by_user(&mut self, user_id: Uuid) -> Result<Option<Account>, StoreError> {
        let account = accounts::table
            .filter(accounts::user_id.eq(user_id))
            .select(Account::as_select())
            .first(self.conn())
            .await
            .optional()?;
        Ok(account)
    }

    async fn insert_account(&mut self, account: NewAccount) -> Result<Account, StoreError> {
        let account = diesel::insert_into(accounts::table)
            .values(&account)
            .returning(Account::as_returning())
            .get_result(self.conn())
            .await?;
        Ok(account)
    }

    async fn find_balance(&mut self, account_id: Uuid) -> Result<Option<AccountBalance>, StoreError> {
        let balance = account_balances::table
            .find(account_id)
            .select(AccountBalance::as_select())
            .first(self.conn())
            .await
            .optional()?;
        Ok(balance)
    }

    async fn insert_balance_if_absent(&mut self, balance: AccountBalance) -> Result<(), StoreError> {
        diesel::insert_into(account_balances::table)
            .values(&balance)
            .on_conflict(account_balances::account_id)
            .do_nothing()
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn find_order_transaction(&mut self, order_id: Uuid) -> Result<Option<AccountTransaction>, StoreError> {
        let transaction = account_transactions::table
            .filter(account_transactions::order_id.eq(order_id))
            .select(AccountTransaction::as_select())
            .first(self.conn())
            .await
            .optional()?;
        Ok(transaction)
    }

    async fn insert_transaction(&mut self, transaction: NewAccountTransaction) -> Result<(), StoreError> {
        diesel::insert_into(account_transactions::table)
            .values(&transaction)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn update_balance(
        &mut self,
        account_id: Uuid,
        expected_version: i32,
        balance: BigDecimal,
    ) -> Result<AccountBalance, StoreError> {
        let updated = diesel::update(
            account_balances::table
                .filter(account_balances::account_id.eq(account_id))
                .filter(account_balances::version.eq(expected_version)),
        )
        .set((
            account_balances::balance.eq(balance),
            account_balances::version.eq(expected_version + 1),
        ))
        .returning(AccountBalance::as_returning())
        .get_result(self.conn())
        .await
        .optional()?;

        updated.ok_or(StoreError::Conflict("account_balances"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryPayments;
    use std::str::FromStr;

    fn dec(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    #[tokio::test]
    async fn top_up_adds_amount_and_records_transaction() {
        let payments = MemoryPayments::default();
        let account = payments.seed_account(Uuid::new_v4(), dec("100.00"));
        let ledger = Ledger::new(payments.clone());

        let view = ledger.top_up(account, &dec("25.50")).await.unwrap();

        assert_eq!(view.balance, dec("125.50"));
        let transactions = payments.transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].delta, dec("25.50"));
        assert_eq!(transactions[0].order_id, None);
    }

    #[tokio::test]
    async fn top_up_rejects_non_positive_amounts() {
        let payments = MemoryPayments::default();
        let account = payments.seed_account(Uuid::new_v4(), dec("10"));
        let ledger = Ledger::new(payments.clone());

        for amount in ["0", "-5", "0.005", "10000000000000000"] {
            let err = ledger.top_up(account, &dec(amount)).await.unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)), "{amount}");
        }
        assert!(payments.transactions().is_empty());
        assert_eq!(payments.balance(account).unwrap().balance, dec("10"));
    }

    #[tokio::test]
    async fn top_up_of_unknown_account_fails() {
        let ledger = Ledger::new(MemoryPayments::default());

        let err = ledger.top_up(Uuid::new_v4(), &dec("1")).await.unwrap_err();

        assert!(matches!(err, LedgerError::AccountNotFound));
    }

    #[tokio::test]
    async fn concurrent_top_ups_are_both_applied() {
        let payments = MemoryPayments::default();
        let account = payments.seed_account(Uuid::new_v4(), dec("100"));
        let ledger = Ledger::new(payments.clone());

        let amount = dec("50");
        let (first, second) = tokio::join!(ledger.top_up(account, &amount), ledger.top_up(account, &amount));
        first.unwrap();
        second.unwrap();

        let balance = payments.balance(account).unwrap();
        assert_eq!(balance.balance, dec("200"));
        assert_eq!(balance.version, 2);
        assert_eq!(payments.transactions().len(), 2);
        assert!(payments.commit_conflicts() >= 1);
    }

    #[tokio::test]
    async fn debit_is_applied_once_per_order() {
        let payments = MemoryPayments::default();
        let account = payments.seed_account(Uuid::new_v4(), dec("1000"));
        let ledger = Ledger::new(payments.clone());
        let order_id = Uuid::new_v4();

        let first = ledger.try_debit(account, order_id, &dec("300")).await.unwrap();
        let second = ledger.try_debit(account, order_id, &dec("300")).await.unwrap();

        assert!(matches!(first, DebitOutcome::Applied(ref b) if b.balance == dec("700")));
        assert_eq!(second, DebitOutcome::AlreadyApplied);
        assert_eq!(payments.balance(account).unwrap().balance, dec("700"));
        let transactions = payments.transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].order_id, Some(order_id));
        assert_eq!(transactions[0].delta, dec("-300"));
    }

    #[tokio::test]
    async fn concurrent_debits_for_one_order_write_one_transaction() {
        let payments = MemoryPayments::default();
        let account = payments.seed_account(Uuid::new_v4(), dec("1000"));
        let ledger = Ledger::new(payments.clone());
        let order_id = Uuid::new_v4();

        let amount = dec("300");
        let (first, second) = tokio::join!(
            ledger.try_debit(account, order_id, &amount),
            ledger.try_debit(account, order_id, &amount)
        );
        let outcomes = [first.unwrap(), second.unwrap()];

        assert_eq!(
            outcomes.iter().filter(|o| **o == DebitOutcome::AlreadyApplied).count(),
            1
        );
        assert_eq!(payments.transactions().len(), 1);
        assert_eq!(payments.balance(account).unwrap().balance, dec("700"));
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_balance_untouched() {
        let payments = MemoryPayments::default();
        let account = payments.seed_account(Uuid::new_v4(), dec("100"));
        let ledger = Ledger::new(payments.clone());

        let err = ledger
            .try_debit(account, Uuid::new_v4(), &dec("300"))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds));
        assert_eq!(err.to_string(), "Insufficient funds");
        assert_eq!(payments.balance(account).unwrap().balance, dec("100"));
        assert!(payments.transactions().is_empty());
    }

    #[tokio::test]
    async fn persistent_conflicts_exhaust_the_retry_budget() {
        let payments = MemoryPayments::default();
        let account = payments.seed_account(Uuid::new_v4(), dec("100"));
        payments.fail_commits(MAX_CONFLICT_ATTEMPTS as usize);
        let ledger = Ledger::new(payments.clone());

        let err = ledger.top_up(account, &dec("5")).await.unwrap_err();

        assert!(matches!(err, LedgerError::ConcurrencyExhausted { attempts: 3 }));
        assert_eq!(payments.balance(account).unwrap().balance, dec("100"));
    }

    #[tokio::test]
    async fn balance_row_is_created_on_first_access() {
        let payments = MemoryPayments::default();
        let account = payments.seed_account_without_balance(Uuid::new_v4());
        let ledger = Ledger::new(payments.clone());

        let view = ledger.top_up(account, &dec("40")).await.unwrap();

        assert_eq!(view.balance, dec("40"));
        assert_eq!(payments.balance(account).unwrap().version, 1);
    }
}
