pub mod api;
pub mod handlers;
pub mod models;
pub mod notifications;
pub mod orders;
pub mod schema;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
