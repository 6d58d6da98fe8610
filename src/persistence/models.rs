//! Database Models
//!
//! Row structs for user configs, trades and audit logs, plus their conversion
//! into domain entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::entities::trade::{TradeRecord, TradeSide, TradeStatus};
use crate::domain::entities::user_config::{RiskParams, UserConfig};
use crate::domain::errors::{LedgerError, ValidationError};

/// User config row in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserConfigRow {
    pub user_id: String,
    pub symbol: String,
    pub risk_params: String, // JSON object
    pub schema_version: i64,
    pub active: bool,
    pub subscription_expiry: Option<DateTime<Utc>>,
    pub config_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserConfigRow {
    pub fn is_subscribed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.subscription_expiry, Some(expiry) if now < expiry)
    }

    /// Parse and validate into a domain config
    pub fn to_config(&self) -> Result<UserConfig, ValidationError> {
        let risk_params = RiskParams::from_json(&self.risk_params, self.schema_version)?;
        UserConfig::new(
            &self.user_id,
            &self.symbol,
            risk_params,
            self.active,
            self.subscription_expiry,
        )
    }
}

/// Trade row in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRow {
    pub trade_id: i64,
    pub user_id: String,
    pub symbol: String,
    pub side: String, // "buy" or "sell"
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub leverage: f64,
    pub status: String, // "OPEN", "CLOSED" or "FAILED"
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub pnl: Option<f64>,
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub exit_client_order_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl TryFrom<TradeRow> for TradeRecord {
    type Error = LedgerError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let side: TradeSide = row.side.parse().map_err(|reason| LedgerError::Corrupt {
            trade_id: row.trade_id,
            reason,
        })?;
        let status: TradeStatus = row.status.parse().map_err(|reason| LedgerError::Corrupt {
            trade_id: row.trade_id,
            reason,
        })?;

        Ok(TradeRecord {
            trade_id: row.trade_id,
            user_id: row.user_id,
            symbol: row.symbol,
            side,
            entry_price: row.entry_price,
            exit_price: row.exit_price,
            quantity: row.quantity,
            leverage: row.leverage,
            status,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            pnl: row.pnl,
            entry_order_id: row.entry_order_id,
            exit_order_id: row.exit_order_id,
            exit_client_order_id: row.exit_client_order_id,
            failure_reason: row.failure_reason,
        })
    }
}

/// Audit log record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLogRecord {
    pub id: i64,
    pub event_type: String,
    pub user_id: String,
    pub symbol: Option<String>,
    pub details: String, // JSON string
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_row(side: &str, status: &str) -> TradeRow {
        TradeRow {
            trade_id: 9,
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: side.into(),
            entry_price: 100.0,
            exit_price: None,
            quantity: 1.0,
            leverage: 1.0,
            status: status.into(),
            opened_at: Utc::now(),
            closed_at: None,
            pnl: None,
            entry_order_id: None,
            exit_order_id: None,
            exit_client_order_id: None,
            failure_reason: None,
        }
    }

    #[test]
    fn test_trade_row_conversion() {
        let record = TradeRecord::try_from(trade_row("sell", "OPEN")).unwrap();
        assert_eq!(record.side, TradeSide::Sell);
        assert!(record.is_open());
    }

    #[test]
    fn test_corrupt_trade_row() {
        let err = TradeRecord::try_from(trade_row("sideways", "OPEN")).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { trade_id: 9, .. }));
    }

    #[test]
    fn test_config_row_validation() {
        let now = Utc::now();
        let mut row = UserConfigRow {
            user_id: "u1".into(),
            symbol: "ethusdt".into(),
            risk_params: r#"{"entry_threshold": 2000}"#.into(),
            schema_version: 1,
            active: true,
            subscription_expiry: Some(now + chrono::Duration::hours(1)),
            config_error: None,
            created_at: now,
            updated_at: now,
        };
        let config = row.to_config().unwrap();
        assert_eq!(config.symbol, "ETHUSDT");
        assert!(row.is_subscribed(now));

        row.risk_params = "{}".into();
        assert!(row.to_config().is_err());
    }
}
