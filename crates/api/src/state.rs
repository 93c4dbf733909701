//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use supplymatch_billing::{MatchScorer, PaymentService};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub payments: Arc<PaymentService>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Config,
        scorer: Arc<dyn MatchScorer>,
    ) -> anyhow::Result<Self> {
        let payments = PaymentService::from_env(pool.clone(), scorer)
            .map_err(|e| anyhow::anyhow!("payment service initialization failed: {e}"))?;
        tracing::info!("Payment service initialized");

        Ok(Self {
            pool,
            config,
            payments: Arc::new(payments),
        })
    }
}
