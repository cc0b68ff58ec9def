//! Sehaty Orders - pharmacy order, payment and inventory reconciliation
//!
//! ## Features
//! - Checkout against pharmacy-scoped stock and prices
//! - Hosted-page payments with signed webhooks and redirects
//! - Idempotent payment confirmation: stock, delivery and cart effects apply once
//! - Cancellation with stock restoration and refund bookkeeping
//! - Staff status progression with delivery tracking

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod payment;
pub mod service;
pub mod store;

pub use error::{OrderError, Result};
pub use service::{OrderService, Principal, Role, ServiceSettings};
