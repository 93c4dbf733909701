// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! SupplyMatch API Library
//!
//! The HTTP surface over the payment core: webhook endpoint, checkout
//! creation, reconciliation sync, and report access routes.

pub mod config;
pub mod error;
pub mod routes;
pub mod scoring;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use scoring::CategoryScorer;
pub use state::AppState;
