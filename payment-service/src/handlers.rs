use anyhow::Result;
use async_trait::async_trait;
use diesel_async::AsyncConnection;
use shared::broker::MessageHandler;
use shared::db::{retry_on_conflict, DbPool, PgUnitOfWork, MAX_CONFLICT_ATTEMPTS};
use shared::inbox::{self, InboxEntry, InboxStore};
use shared::outbox::{self, OutboxSink};
use shared::{OrderPaymentRequested, OrderPaymentStatusChanged};
use tracing::{info, warn};

use crate::ledger::{apply_debit, DebitOutcome, LedgerError, LedgerStore, ACCOUNT_NOT_FOUND};

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentStep {
    /// The request was handled by an earlier delivery.
    Duplicate,
    Completed(OrderPaymentStatusChanged),
}

/// Settles one payment request inside the caller's unit of work: records the
/// inbox entry, debits the user's account, and queues the result event.
pub async fn process_payment_request<U>(uow: &mut U, request: &OrderPaymentRequested) -> Result<PaymentStep, LedgerError>
where
    U: LedgerStore + InboxStore + OutboxSink + ?Sized,
{
    let record = match inbox::admit(uow, request).await? {
        InboxEntry::AlreadyProcessed(_) => {
            info!(message_id = %request.message_id, "Payment message already processed");
            return Ok(PaymentStep::Duplicate);
        }
        InboxEntry::Pending(record) => record,
    };

    let result = match uow.find_account_by_user(request.user_id).await? {
        None => OrderPaymentStatusChanged::failed(request, ACCOUNT_NOT_FOUND),
        Some(account) => match apply_debit(uow, account.id, request.order_id, &request.amount).await {
            Ok(DebitOutcome::Applied(_)) | Ok(DebitOutcome::AlreadyApplied) => OrderPaymentStatusChanged::success(request),
            Err(e) if e.is_business() => OrderPaymentStatusChanged::failed(request, e.to_string()),
            Err(e) => return Err(e),
        },
    };

    outbox::append(uow, &result).await?;
    uow.mark_inbox_processed(&record).await?;

    Ok(PaymentStep::Completed(result))
}

pub struct PaymentRequestHandler {
    pool: DbPool,
}

impl PaymentRequestHandler {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn process_once(&self, request: &OrderPaymentRequested) -> Result<PaymentStep, LedgerError> {
        let request = request.clone();
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                let mut uow = PgUnitOfWork::new(conn);
                process_payment_request(&mut uow, &request).await
            })
        })
        .await
    }
}

#[async_trait]
impl MessageHandler<OrderPaymentRequested> for PaymentRequestHandler {
    async fn handle(&self, request: OrderPaymentRequested) -> Result<()> {
        let step = retry_on_conflict("payment_request", MAX_CONFLICT_ATTEMPTS, |attempt| {
            if attempt > 1 {
                warn!(message_id = %request.message_id, attempt, "Retrying payment request");
            }
            self.process_once(&request)
        })
        .await?;

        if let PaymentStep::Completed(result) = step {
            info!(
                order_id = %result.order_id,
                status = ?result.status,
                reason = result.reason.as_deref().unwrap_or(""),
                "Payment result recorded"
            );
        }
        Ok(())
    }
}
