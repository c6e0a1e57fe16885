//! Short-TTL collateral balance cache.
//!
//! Quote attempts read the balance on every tick; the cache keeps that
//! off the network. It is invalidated immediately before any order
//! placement, since placing an order changes available balance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use crate::router::{BalanceKind, OrderRouter, RouterError};

/// Default cache TTL.
pub const BALANCE_TTL: Duration = Duration::from_secs(5);

struct Cached {
    value: Decimal,
    fetched_at: Instant,
}

pub struct BalanceCache {
    router: Arc<dyn OrderRouter>,
    ttl: Duration,
    cached: Mutex<Option<Cached>>,
}

impl BalanceCache {
    pub fn new(router: Arc<dyn OrderRouter>) -> Self {
        Self {
            router,
            ttl: BALANCE_TTL,
            cached: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_ttl(router: Arc<dyn OrderRouter>, ttl: Duration) -> Self {
        Self {
            router,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Collateral balance, served from cache within the TTL.
    pub async fn collateral(&self) -> Result<Decimal, RouterError> {
        let mut guard = self.cached.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.value);
            }
        }

        let value = self.router.balance(&BalanceKind::Collateral).await?;
        debug!(balance = %value, "refreshed collateral balance");
        *guard = Some(Cached {
            value,
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    /// Drop the cached value. Called before every order placement.
    pub async fn invalidate(&self) {
        let mut guard = self.cached.lock().await;
        *guard = None;
    }
}
