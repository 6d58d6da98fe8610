//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tradeloop::application::LoopContext;
use tradeloop::domain::entities::order::{ExchangePosition, OrderRequest, OrderResult};
use tradeloop::domain::entities::user_config::{RiskParams, UserConfig, RISK_SCHEMA_VERSION};
use tradeloop::domain::errors::GatewayError;
use tradeloop::domain::repositories::{ExchangeGateway, GatewayResult};
use tradeloop::domain::services::retry::RetryPolicy;
use tradeloop::persistence::{
    init_database, AuditLogRepository, DbPool, SqliteSettingsStore, SqliteTradeLedger,
};

/// Exchange double: one settable price for every symbol, orders fill at that
/// price unless an error is queued or a permanent failure is set.
#[derive(Default)]
pub struct MockExchange {
    price: Mutex<f64>,
    queued_errors: Mutex<VecDeque<GatewayError>>,
    failure: Mutex<Option<GatewayError>>,
    orders: AtomicU32,
}

impl MockExchange {
    pub fn at_price(price: f64) -> Self {
        let exchange = Self::default();
        exchange.set_price(price);
        exchange
    }

    pub fn set_price(&self, price: f64) {
        *self.price.lock().unwrap() = price;
    }

    pub fn queue_error(&self, err: GatewayError) {
        self.queued_errors.lock().unwrap().push_back(err);
    }

    pub fn fail_orders_with(&self, err: GatewayError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn orders_placed(&self) -> u32 {
        self.orders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeGateway for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn place_order(&self, _order: &OrderRequest) -> GatewayResult<OrderResult> {
        let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some(err) = self.queued_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(OrderResult::Confirmed {
            order_id: format!("mock-{}", n),
            fill_price: *self.price.lock().unwrap(),
        })
    }

    async fn get_price(&self, _symbol: &str) -> GatewayResult<f64> {
        Ok(*self.price.lock().unwrap())
    }

    async fn get_position(
        &self,
        _user_id: &str,
        _symbol: &str,
    ) -> GatewayResult<Option<ExchangePosition>> {
        Ok(None)
    }
}

pub struct Harness {
    pub pool: DbPool,
    pub settings: Arc<SqliteSettingsStore>,
    pub ledger: Arc<SqliteTradeLedger>,
    pub audit: Arc<AuditLogRepository>,
}

impl Harness {
    pub async fn in_memory() -> Self {
        Self::on(init_database("sqlite::memory:").await.unwrap())
    }

    pub fn on(pool: DbPool) -> Self {
        Self {
            settings: Arc::new(SqliteSettingsStore::new(pool.clone())),
            ledger: Arc::new(SqliteTradeLedger::new(pool.clone())),
            audit: Arc::new(AuditLogRepository::new(pool.clone())),
            pool,
        }
    }

    pub fn context(&self, gateway: Arc<dyn ExchangeGateway>) -> LoopContext {
        LoopContext {
            settings: self.settings.clone(),
            ledger: self.ledger.clone(),
            gateway,
            audit: self.audit.clone(),
            poll_interval: Duration::from_millis(5),
            retry: fast_retry(),
        }
    }

    pub async fn add_user(&self, user_id: &str, risk_params: &str, expiry: Option<DateTime<Utc>>) {
        let config = UserConfig::new(
            user_id,
            "BTCUSDT",
            RiskParams::from_json(risk_params, RISK_SCHEMA_VERSION).unwrap(),
            true,
            expiry,
        )
        .unwrap();
        self.settings.upsert(&config).await.unwrap();
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        call_timeout: Duration::from_millis(200),
    }
}

pub fn in_days(days: i64) -> Option<DateTime<Utc>> {
    Some(Utc::now() + chrono::Duration::days(days))
}

/// Poll `check` every 10ms until it returns true or `limit` elapses
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
