use std::fmt::Display;
use std::future::Future;

use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use tracing::warn;

use crate::error::Retryable;

pub type DbPool = Pool<AsyncPgConnection>;

/// Attempts for a read-modify-write against a versioned row before giving up.
pub const MAX_CONFLICT_ATTEMPTS: u32 = 3;

pub async fn connect_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().build(config).await?;
    Ok(pool)
}

/// The connection of one open transaction.
///
/// Storage traits are implemented on this type so that every read and write of a
/// single step goes through the same commit. It is created inside
/// `AsyncConnection::transaction` and dropped with it, so it never outlives the
/// transaction scope.
pub struct PgUnitOfWork<'c> {
    conn: &'c mut AsyncPgConnection,
}

impl<'c> PgUnitOfWork<'c> {
    pub fn new(conn: &'c mut AsyncPgConnection) -> Self {
        Self { conn }
    }

    pub fn conn(&mut self) -> &mut AsyncPgConnection {
        &mut *self.conn
    }
}

/// Runs `attempt` until it succeeds, fails with a non-conflict error, or
/// `max_attempts` runs have all lost a concurrency race. The last result is
/// returned as is. Each run must start from a fresh read; nothing is carried
/// over between attempts except the attempt number.
pub async fn retry_on_conflict<T, E, F, Fut>(
    operation: &str,
    max_attempts: u32,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut current = 1;
    loop {
        match attempt(current).await {
            Err(err) if err.is_conflict() && current < max_attempts => {
                warn!(operation, attempt = current, error = %err, "Concurrency conflict, retrying");
                current += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::cell::Cell;

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = Cell::new(0);

        let result = retry_on_conflict("test", 3, |attempt| {
            calls.set(calls.get() + 1);
            async move {
                if attempt < 3 {
                    Err(StoreError::Conflict("account_balances"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_with_last_conflict() {
        let calls = Cell::new(0);

        let result: Result<(), StoreError> = retry_on_conflict("test", 3, |_| {
            calls.set(calls.get() + 1);
            async { Err(StoreError::UniqueViolation("ix_account_transactions_order_id".into())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::UniqueViolation(_))));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn does_not_retry_other_errors() {
        let calls = Cell::new(0);

        let result: Result<(), StoreError> = retry_on_conflict("test", 3, |_| {
            calls.set(calls.get() + 1);
            async {
                Err(StoreError::Serialization(
                    serde_json::from_str::<u32>("nope").unwrap_err(),
                ))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Serialization(_))));
        assert_eq!(calls.get(), 1);
    }
}
