pub mod applications;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod limits;
pub mod notifications;
pub mod routes;
pub mod services;
pub mod store;

pub use services::{BillingServices, BillingSettings};
