use diesel_async::AsyncConnection;
use shared::db::{retry_on_conflict, PgUnitOfWork, MAX_CONFLICT_ATTEMPTS};
use tracing::info;
use uuid::Uuid;

use crate::ledger::{get_or_create_balance, LedgerError, LedgerStore, PgLedger};
use crate::models::{BalanceView, NewAccount};

#[derive(Debug, Clone, PartialEq)]
pub enum AccountOpening {
    Opened(BalanceView),
    /// The user already had an account; its current balance is returned.
    Existing(BalanceView),
}

/// Opens the single account of `user_id` with a zero balance.
pub async fn open_account<S>(store: &mut S, user_id: Uuid) -> Result<AccountOpening, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    if let Some(account) = store.find_account_by_user(user_id).await? {
        let balance = get_or_create_balance(store, account.id).await?;
        return Ok(AccountOpening::Existing(BalanceView::new(&account, &balance)));
    }

    let account = store.insert_account(NewAccount::for_user(user_id)).await?;
    let balance = get_or_create_balance(store, account.id).await?;
    Ok(AccountOpening::Opened(BalanceView::new(&account, &balance)))
}

pub async fn balance_of<S>(store: &mut S, account_id: Uuid) -> Result<Option<BalanceView>, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    match store.find_account(account_id).await? {
        Some(account) => {
            let balance = get_or_create_balance(store, account.id).await?;
            Ok(Some(BalanceView::new(&account, &balance)))
        }
        None => Ok(None),
    }
}

pub async fn balance_of_user<S>(store: &mut S, user_id: Uuid) -> Result<Option<BalanceView>, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    match store.find_account_by_user(user_id).await? {
        Some(account) => {
            let balance = get_or_create_balance(store, account.id).await?;
            Ok(Some(BalanceView::new(&account, &balance)))
        }
        None => Ok(None),
    }
}

impl PgLedger {
    pub async fn open_account(&self, user_id: Uuid) -> Result<AccountOpening, LedgerError> {
        // A lost race on the user_id index re-runs and finds the winner's account.
        let opening = retry_on_conflict("open_account", MAX_CONFLICT_ATTEMPTS, |_| async move {
            let mut conn = self.pool().get().await?;
            conn.transaction::<_, LedgerError, _>(|conn| {
                Box::pin(async move { open_account(&mut PgUnitOfWork::new(conn), user_id).await })
            })
            .await
        })
        .await?;

        if let AccountOpening::Opened(view) = &opening {
            info!(account_id = %view.account_id, %user_id, "Account opened");
        }
        Ok(opening)
    }

    pub async fn balance(&self, account_id: Uuid) -> Result<Option<BalanceView>, LedgerError> {
        let mut conn = self.pool().get().await?;
        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move { balance_of(&mut PgUnitOfWork::new(conn), account_id).await })
        })
        .await
    }

    pub async fn balance_by_user(&self, user_id: Uuid) -> Result<Option<BalanceView>, LedgerError> {
        let mut conn = self.pool().get().await?;
        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move { balance_of_user(&mut PgUnitOfWork::new(conn), user_id).await })
        })
        .await
    }
}
