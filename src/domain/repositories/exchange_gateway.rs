//! Exchange Gateway Trait
//!
//! The capability a user loop consumes to talk to the exchange: place a market
//! order, read the last price of a symbol, and read a user's open position.
//! Transport, authentication and rate limiting live behind this trait.
//!
//! ## Retry safety
//! Implementations must make `place_order` idempotent per
//! `OrderRequest::client_order_id`; callers retry only on
//! `OrderResult::Pending` and on transient `GatewayError`s.

use crate::domain::entities::order::{ExchangePosition, OrderRequest, OrderResult};
use crate::domain::errors::GatewayError;
use async_trait::async_trait;

/// Common result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Name used in logs and audit records
    fn name(&self) -> &str;

    /// Submit a market order
    ///
    /// # Returns
    /// `Confirmed` with the exchange order id and fill price, `Rejected` when
    /// the exchange refused the order, `Pending` when the outcome is not yet known
    async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderResult>;

    /// Last traded price of `symbol`
    async fn get_price(&self, symbol: &str) -> GatewayResult<f64>;

    /// The user's open position on `symbol`, if any
    async fn get_position(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> GatewayResult<Option<ExchangePosition>>;
}
