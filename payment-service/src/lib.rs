pub mod accounts;
pub mod api;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod schema;
#[cfg(test)]
mod testing;
