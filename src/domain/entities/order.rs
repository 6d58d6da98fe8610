use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::entities::trade::{TradeRecord, TradeSide};
use crate::domain::errors::ValidationError;

/// Gateway-specific order parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    pub leverage: f64,
    /// Exit orders only reduce an existing position
    pub reduce_only: bool,
}

/// A market order submitted through the exchange gateway.
///
/// `client_order_id` is generated once per logical order and reused for every
/// retry of that order, so the exchange can deduplicate resubmissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub params: OrderParams,
}

impl OrderRequest {
    /// Order opening a new position
    pub fn entry(
        user_id: &str,
        symbol: &str,
        side: TradeSide,
        quantity: f64,
        leverage: f64,
    ) -> Result<Self, ValidationError> {
        Self::build(
            Uuid::new_v4().to_string(),
            user_id,
            symbol,
            side,
            quantity,
            OrderParams {
                leverage,
                reduce_only: false,
            },
        )
    }

    /// Order closing the position recorded by `trade`. An exit still pending
    /// for the trade is resubmitted under its original client order id.
    pub fn exit(trade: &TradeRecord) -> Result<Self, ValidationError> {
        let client_order_id = trade
            .exit_client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self::build(
            client_order_id,
            &trade.user_id,
            &trade.symbol,
            trade.side.opposite(),
            trade.quantity,
            OrderParams {
                leverage: trade.leverage,
                reduce_only: true,
            },
        )
    }

    fn build(
        client_order_id: String,
        user_id: &str,
        symbol: &str,
        side: TradeSide,
        quantity: f64,
        params: OrderParams,
    ) -> Result<Self, ValidationError> {
        if !quantity.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if quantity <= 0.0 {
            return Err(ValidationError::MustBePositive);
        }
        Ok(OrderRequest {
            client_order_id,
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            params,
        })
    }
}

/// Outcome of `ExchangeGateway::place_order`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OrderResult {
    Confirmed { order_id: String, fill_price: f64 },
    Rejected { reason: String },
    Pending { order_id: Option<String> },
}

/// A position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_price: f64,
}
