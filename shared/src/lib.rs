pub mod broker;
pub mod db;
pub mod error;
pub mod events;
pub mod inbox;
pub mod money;
pub mod outbox;
pub mod schema;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{PublishError, Retryable, StoreError};
pub use events::{IntegrationEvent, OrderPaymentRequested, OrderPaymentStatusChanged, PaymentStatus};
