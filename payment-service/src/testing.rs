//! In-memory payments database with optimistic commits.
//!
//! A unit of work reads from a snapshot and keeps its writes local. Commit
//! re-checks balance versions and the unique indexes against the shared state
//! and applies everything or nothing, the way the Postgres transaction would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use futures::future::BoxFuture;
use shared::inbox::{InboxMessage, InboxStore, NewInboxMessage};
use shared::outbox::{NewOutboxMessage, OutboxSink};
use shared::testing::{MemoryInbox, MemoryOutbox};
use shared::{IntegrationEvent, StoreError};
use uuid::Uuid;

use crate::ledger::{apply_debit, apply_top_up, DebitOutcome, LedgerError, LedgerStore, LedgerTransactions};
use crate::models::*;

#[derive(Default)]
struct PaymentsState {
    accounts: Vec<Account>,
    balances: HashMap<Uuid, AccountBalance>,
    transactions: Vec<AccountTransaction>,
    inbox: MemoryInbox,
    outbox: Vec<NewOutboxMessage>,
    failing_commits: usize,
    commit_conflicts: usize,
}

#[derive(Clone, Default)]
pub struct MemoryPayments {
    state: Arc<Mutex<PaymentsState>>,
}

impl MemoryPayments {
    fn lock(&self) -> MutexGuard<'_, PaymentsState> {
        self.state.lock().unwrap()
    }

    pub fn seed_account(&self, user_id: Uuid, balance: BigDecimal) -> Uuid {
        let account_id = self.seed_account_without_balance(user_id);
        self.lock().balances.insert(
            account_id,
            AccountBalance {
                account_id,
                balance,
                version: 0,
            },
        );
        account_id
    }

    pub fn seed_account_without_balance(&self, user_id: Uuid) -> Uuid {
        let account = Account {
            id: Uuid::new_v4(),
            user_id,
            created_at: Utc::now(),
        };
        let id = account.id;
        self.lock().accounts.push(account);
        id
    }

    pub fn balance(&self, account_id: Uuid) -> Option<AccountBalance> {
        self.lock().balances.get(&account_id).cloned()
    }

    pub fn transactions(&self) -> Vec<AccountTransaction> {
        self.lock().transactions.clone()
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

    /// Makes the next `count` commits fail as if another writer got there first.
    pub fn fail_commits(&self, count: usize) {
        self.lock().failing_commits = count;
    }

    pub fn commit_conflicts(&self) -> usize {
        self.lock().commit_conflicts
    }

    pub async fn transaction<T, F>(&self, work: F) -> Result<T, LedgerError>
    where
        F: for<'u> FnOnce(&'u mut MemoryUnit) -> BoxFuture<'u, Result<T, LedgerError>>,
    {
        let mut unit = MemoryUnit::begin(&self.lock());
        let value = work(&mut unit).await?;
        unit.commit(&mut self.lock())?;
        Ok(value)
    }
}

#[async_trait]
impl LedgerTransactions for MemoryPayments {
    async fn top_up_once(&self, account_id: Uuid, amount: &BigDecimal) -> Result<BalanceView, LedgerError> {
        let amount = amount.clone();
        self.transaction(|unit| Box::pin(async move { apply_top_up(unit, account_id, &amount).await }))
            .await
    }

    async fn debit_once(
        &self,
        account_id: Uuid,
        order_id: Uuid,
        amount: &BigDecimal,
    ) -> Result<DebitOutcome, LedgerError> {
        let amount = amount.clone();
        self.transaction(|unit| {
            Box::pin(async move { apply_debit(unit, account_id, order_id, &amount).await })
        })
        .await
    }
}

pub struct MemoryUnit {
    accounts: Vec<Account>,
    balances: HashMap<Uuid, AccountBalance>,
    transactions: Vec<AccountTransaction>,
    inbox: MemoryInbox,
    outbox: MemoryOutbox,
    new_accounts: Vec<Account>,
    new_transactions: Vec<AccountTransaction>,
    // Version the committed row must still have; `None` for rows this unit created.
    balance_writes: HashMap<Uuid, Option<i32>>,
}

impl MemoryUnit {
    fn begin(state: &PaymentsState) -> Self {
        Self {
            accounts: state.accounts.clone(),
            balances: state.balances.clone(),
            transactions: state.transactions.clone(),
            inbox: state.inbox.clone(),
            outbox: MemoryOutbox::default(),
            new_accounts: Vec::new(),
            new_transactions: Vec::new(),
            balance_writes: HashMap::new(),
        }
    }

    fn commit(self, state: &mut PaymentsState) -> Result<(), StoreError> {
        let result = self.check(state);
        if let Err(StoreError::Conflict(_) | StoreError::UniqueViolation(_)) = &result {
            state.commit_conflicts += 1;
        }
        let inbox = result?;

        state.accounts.extend(self.new_accounts);
        state.transactions.extend(self.new_transactions);
        for account_id in self.balance_writes.keys() {
            if let Some(row) = self.balances.get(account_id) {
                state.balances.insert(*account_id, row.clone());
            }
        }
        state.inbox = inbox;
        state.outbox.extend(self.outbox.messages().iter().cloned());
        Ok(())
    }

    fn check(&self, state: &mut PaymentsState) -> Result<MemoryInbox, StoreError> {
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::Conflict("account_balances"));
        }

        for (account_id, expected) in &self.balance_writes {
            let current = state.balances.get(account_id).map(|b| b.version);
            if current != *expected {
                return Err(StoreError::Conflict("account_balances"));
            }
        }
        for transaction in &self.new_transactions {
            let taken = transaction.order_id.is_some()
                && state.transactions.iter().any(|t| t.order_id == transaction.order_id);
            if taken {
                return Err(StoreError::UniqueViolation("ix_account_transactions_order_id".into()));
            }
        }
        for account in &self.new_accounts {
            if state.accounts.iter().any(|a| a.user_id == account.user_id) {
                return Err(StoreError::UniqueViolation("ix_accounts_user_id".into()));
            }
        }

        let mut inbox = state.inbox.clone();
        inbox.merge(&self.inbox)?;
        Ok(inbox)
    }
}

#[async_trait]
impl LedgerStore for MemoryUnit {
    async fn find_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.iter().find(|a| a.id == account_id).cloned())
    }

    async fn find_account_by_user(&mut self, user_id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.iter().find(|a| a.user_id == user_id).cloned())
    }

    async fn insert_account(&mut self, account: NewAccount) -> Result<Account, StoreError> {
        if self.accounts.iter().any(|a| a.user_id == account.user_id) {
            return Err(StoreError::UniqueViolation("ix_accounts_user_id".into()));
        }
        let account = Account {
            id: account.id,
            user_id: account.user_id,
            created_at: account.created_at,
        };
        self.accounts.push(account.clone());
        self.new_accounts.push(account.clone());
        Ok(account)
    }

    async fn find_balance(&mut self, account_id: Uuid) -> Result<Option<AccountBalance>, StoreError> {
        Ok(self.balances.get(&account_id).cloned())
    }

    async fn insert_balance_if_absent(&mut self, balance: AccountBalance) -> Result<(), StoreError> {
        if !self.balances.contains_key(&balance.account_id) {
            self.balance_writes.entry(balance.account_id).or_insert(None);
            self.balances.insert(balance.account_id, balance);
        }
        Ok(())
    }

    async fn find_order_transaction(&mut self, order_id: Uuid) -> Result<Option<AccountTransaction>, StoreError> {
        Ok(self
            .transactions
            .iter()
            .find(|t| t.order_id == Some(order_id))
            .cloned())
    }

    async fn insert_transaction(&mut self, transaction: NewAccountTransaction) -> Result<(), StoreError> {
        if transaction.order_id.is_some()
            && self.transactions.iter().any(|t| t.order_id == transaction.order_id)
        {
            return Err(StoreError::UniqueViolation("ix_account_transactions_order_id".into()));
        }
        let row = AccountTransaction {
            id: transaction.id,
            account_id: transaction.account_id,
            order_id: transaction.order_id,
            delta: transaction.delta,
            created_at: transaction.created_at,
        };
        self.transactions.push(row.clone());
        self.new_transactions.push(row);
        Ok(())
    }

    async fn update_balance(
        &mut self,
        account_id: Uuid,
        expected_version: i32,
        balance: BigDecimal,
    ) -> Result<AccountBalance, StoreError> {
        // Lets a concurrent unit of work interleave here, like a database round trip would.
        tokio::task::yield_now().await;

        let row = self
            .balances
            .get_mut(&account_id)
            .filter(|row| row.version == expected_version)
            .ok_or(StoreError::Conflict("account_balances"))?;
        self.balance_writes.entry(account_id).or_insert(Some(expected_version));
        row.balance = balance;
        row.version += 1;
        Ok(row.clone())
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
