use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Ledger-assigned trade identifier. Monotonic, never reused.
pub type TradeId = i64;

/// Side of an order. The side of a trade's entry order determines its
/// direction: `Buy` opens a long, `Sell` opens a short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    /// The side that closes a position opened on `self`
    pub fn opposite(&self) -> TradeSide {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "long" => Ok(TradeSide::Buy),
            "sell" | "short" => Ok(TradeSide::Sell),
            other => Err(format!("Unknown trade side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            "FAILED" => Ok(TradeStatus::Failed),
            other => Err(format!("Unknown trade status: {}", other)),
        }
    }
}

/// A confirmed entry, ready to be written to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrade {
    pub user_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub entry_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// Fields written when a position is closed
#[derive(Debug, Clone, PartialEq)]
pub struct ClosePosition {
    pub exit_price: f64,
    pub pnl: f64,
    pub closed_at: DateTime<Utc>,
    pub exit_order_id: Option<String>,
}

/// One trade as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: TradeId,
    pub user_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub leverage: f64,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub pnl: Option<f64>,
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    /// Set while an exit order has been submitted but not settled
    pub exit_client_order_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl TradeRecord {
    /// Record as it exists right after `TradeLedger::open` returned `trade_id`
    pub fn opened(trade_id: TradeId, trade: NewTrade) -> Self {
        TradeRecord {
            trade_id,
            user_id: trade.user_id,
            symbol: trade.symbol,
            side: trade.side,
            entry_price: trade.entry_price,
            exit_price: None,
            quantity: trade.quantity,
            leverage: trade.leverage,
            status: TradeStatus::Open,
            opened_at: trade.opened_at,
            closed_at: None,
            pnl: None,
            entry_order_id: trade.entry_order_id,
            exit_order_id: None,
            exit_client_order_id: None,
            failure_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parsing() {
        assert_eq!("buy".parse::<TradeSide>().unwrap(), TradeSide::Buy);
        assert_eq!("SELL".parse::<TradeSide>().unwrap(), TradeSide::Sell);
        assert_eq!("long".parse::<TradeSide>().unwrap(), TradeSide::Buy);
        assert!("hold".parse::<TradeSide>().is_err());
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(TradeSide::Buy.opposite(), TradeSide::Sell);
        assert_eq!(TradeSide::Sell.opposite(), TradeSide::Buy);
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [TradeStatus::Open, TradeStatus::Closed, TradeStatus::Failed] {
            assert_eq!(status.as_str().parse::<TradeStatus>().unwrap(), status);
        }
        assert!("open".parse::<TradeStatus>().is_err());
    }

    #[test]
    fn test_opened_record() {
        let record = TradeRecord::opened(
            42,
            NewTrade {
                user_id: "u1".into(),
                symbol: "BTCUSDT".into(),
                side: TradeSide::Buy,
                entry_price: 100.0,
                quantity: 0.5,
                leverage: 3.0,
                entry_order_id: Some("ord-1".into()),
                opened_at: Utc::now(),
            },
        );
        assert_eq!(record.trade_id, 42);
        assert!(record.is_open());
        assert!(record.pnl.is_none());
        assert!(record.exit_price.is_none());
        assert!(record.exit_client_order_id.is_none());
        assert_eq!(record.entry_order_id.as_deref(), Some("ord-1"));
    }
}
