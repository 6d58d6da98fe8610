//! Threshold entry / target-stop exit rule driven by a user's risk params.
//!
//! Entry: a long entry is signalled once price is at or above
//! `entry_threshold`, a short entry once it is at or below it. Exit: take
//! profit or stop loss measured in percent from the recorded entry price, or an
//! external `force_exit`.

use crate::domain::entities::trade::{TradeRecord, TradeSide};
use crate::domain::entities::user_config::RiskParams;
use crate::domain::value_objects::Price;

#[derive(Debug, Clone, PartialEq)]
pub enum EntrySignal {
    /// Threshold not crossed, or entries are blocked
    Wait,
    Enter { side: TradeSide, quantity: f64 },
    /// Crossed, but the sized order is below the minimum notional
    BelowMinNotional { quantity: f64, notional: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    ForcedExit,
    /// An earlier exit order whose outcome never came back
    Unsettled,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::ForcedExit => "force_exit",
            ExitReason::Unsettled => "unsettled_exit",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn evaluate_entry(params: &RiskParams, price: Price) -> EntrySignal {
    if params.force_exit {
        return EntrySignal::Wait;
    }

    let crossed = match params.direction {
        TradeSide::Buy => price.value() >= params.entry_threshold,
        TradeSide::Sell => price.value() <= params.entry_threshold,
    };
    if !crossed {
        return EntrySignal::Wait;
    }

    let quantity = order_quantity(params, price);
    let notional = quantity * price.value();
    if quantity <= 0.0 || notional < params.min_notional {
        return EntrySignal::BelowMinNotional { quantity, notional };
    }

    EntrySignal::Enter {
        side: params.direction,
        quantity,
    }
}

pub fn evaluate_exit(params: &RiskParams, trade: &TradeRecord, price: Price) -> Option<ExitReason> {
    if params.force_exit {
        return Some(ExitReason::ForcedExit);
    }

    // A corrupt entry price cannot be measured against; hold until forced out.
    let entry = Price::new(trade.entry_price).ok()?;
    let favourable_pct = match trade.side {
        TradeSide::Buy => entry.pct_change_to(price),
        TradeSide::Sell => -entry.pct_change_to(price),
    };

    if favourable_pct >= params.take_profit_pct {
        Some(ExitReason::TakeProfit)
    } else if favourable_pct <= -params.stop_loss_pct {
        Some(ExitReason::StopLoss)
    } else {
        None
    }
}

/// Fixed `quantity`, or `order_size_usd / price` floored to `qty_precision`
pub fn order_quantity(params: &RiskParams, price: Price) -> f64 {
    match params.order_size_usd {
        Some(usd) => floor_to_precision(usd / price.value(), params.qty_precision),
        None => floor_to_precision(params.quantity, params.qty_precision),
    }
}

pub fn floor_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    // Nudge so representation error (0.3 * 10 = 2.9999..) does not drop a unit.
    ((value * factor) + 1e-9).floor() / factor
}
