//! Per-user trading configuration.
//!
//! `risk_params` are stored as a flat JSON object of numeric values so new
//! parameters can be added without a schema migration. Parsing produces a
//! typed [`RiskParams`]; a config that fails parsing never reaches a loop.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::entities::trade::TradeSide;
use crate::domain::errors::ValidationError;

/// Highest `risk_params` schema version this engine understands
pub const RISK_SCHEMA_VERSION: i64 = 1;

pub const KEY_ENTRY_THRESHOLD: &str = "entry_threshold";
pub const KEY_DIRECTION: &str = "direction";
pub const KEY_QUANTITY: &str = "quantity";
pub const KEY_ORDER_SIZE_USD: &str = "order_size_usd";
pub const KEY_QTY_PRECISION: &str = "qty_precision";
pub const KEY_MIN_NOTIONAL: &str = "min_notional";
pub const KEY_TAKE_PROFIT_PCT: &str = "take_profit_pct";
pub const KEY_STOP_LOSS_PCT: &str = "stop_loss_pct";
pub const KEY_LEVERAGE: &str = "leverage";
pub const KEY_FORCE_EXIT: &str = "force_exit";

const RECOGNISED_KEYS: [&str; 10] = [
    KEY_ENTRY_THRESHOLD,
    KEY_DIRECTION,
    KEY_QUANTITY,
    KEY_ORDER_SIZE_USD,
    KEY_QTY_PRECISION,
    KEY_MIN_NOTIONAL,
    KEY_TAKE_PROFIT_PCT,
    KEY_STOP_LOSS_PCT,
    KEY_LEVERAGE,
    KEY_FORCE_EXIT,
];

const DEFAULT_QUANTITY: f64 = 1.0;
const DEFAULT_QTY_PRECISION: u32 = 6;
const DEFAULT_MIN_NOTIONAL: f64 = 5.0;
const DEFAULT_TAKE_PROFIT_PCT: f64 = 1.0;
const DEFAULT_STOP_LOSS_PCT: f64 = 0.5;
const DEFAULT_LEVERAGE: f64 = 1.0;
const MAX_QTY_PRECISION: u32 = 12;

/// Validated strategy parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RiskParams {
    /// Numeric entries as supplied, unknown keys included
    values: BTreeMap<String, f64>,
    pub entry_threshold: f64,
    /// Side of the entry order (`Buy` = long, `Sell` = short)
    pub direction: TradeSide,
    pub quantity: f64,
    pub order_size_usd: Option<f64>,
    pub qty_precision: u32,
    pub min_notional: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub leverage: f64,
    pub force_exit: bool,
}

impl RiskParams {
    /// Parse the stored JSON form.
    ///
    /// Non-numeric values under recognised keys are errors; unknown keys are
    /// carried along if numeric and dropped otherwise.
    pub fn from_json(raw: &str, schema_version: i64) -> Result<Self, ValidationError> {
        if !(1..=RISK_SCHEMA_VERSION).contains(&schema_version) {
            return Err(ValidationError::UnsupportedSchema {
                found: schema_version,
                supported: RISK_SCHEMA_VERSION,
            });
        }

        let parsed: Value =
            serde_json::from_str(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let object = parsed
            .as_object()
            .ok_or_else(|| ValidationError::Malformed("expected a JSON object".to_string()))?;

        let mut values = BTreeMap::new();
        for (key, value) in object {
            match value.as_f64() {
                Some(number) => {
                    values.insert(key.clone(), number);
                }
                None if RECOGNISED_KEYS.contains(&key.as_str()) => {
                    return Err(ValidationError::NotNumeric { key: key.clone() });
                }
                None => {}
            }
        }

        Self::from_values(values)
    }

    /// Validate a numeric parameter map
    pub fn from_values(values: BTreeMap<String, f64>) -> Result<Self, ValidationError> {
        let entry_threshold = required(&values, KEY_ENTRY_THRESHOLD)?;
        ensure(KEY_ENTRY_THRESHOLD, entry_threshold, entry_threshold > 0.0, "must be > 0")?;

        let direction = match optional(&values, KEY_DIRECTION)? {
            None => TradeSide::Buy,
            Some(d) if d == 1.0 => TradeSide::Buy,
            Some(d) if d == -1.0 => TradeSide::Sell,
            Some(d) => {
                return Err(ValidationError::OutOfRange {
                    key: KEY_DIRECTION.to_string(),
                    value: d,
                    reason: "must be 1 (long) or -1 (short)",
                })
            }
        };

        let quantity = optional(&values, KEY_QUANTITY)?.unwrap_or(DEFAULT_QUANTITY);
        ensure(KEY_QUANTITY, quantity, quantity > 0.0, "must be > 0")?;

        let order_size_usd = optional(&values, KEY_ORDER_SIZE_USD)?.filter(|usd| *usd > 0.0);

        let qty_precision = match optional(&values, KEY_QTY_PRECISION)? {
            None => DEFAULT_QTY_PRECISION,
            Some(p) => {
                ensure(
                    KEY_QTY_PRECISION,
                    p,
                    p.fract() == 0.0 && (0.0..=MAX_QTY_PRECISION as f64).contains(&p),
                    "must be a whole number between 0 and 12",
                )?;
                p as u32
            }
        };

        let min_notional = optional(&values, KEY_MIN_NOTIONAL)?.unwrap_or(DEFAULT_MIN_NOTIONAL);
        ensure(KEY_MIN_NOTIONAL, min_notional, min_notional >= 0.0, "must be >= 0")?;

        let take_profit_pct =
            optional(&values, KEY_TAKE_PROFIT_PCT)?.unwrap_or(DEFAULT_TAKE_PROFIT_PCT);
        ensure(KEY_TAKE_PROFIT_PCT, take_profit_pct, take_profit_pct > 0.0, "must be > 0")?;

        let stop_loss_pct = optional(&values, KEY_STOP_LOSS_PCT)?.unwrap_or(DEFAULT_STOP_LOSS_PCT);
        ensure(
            KEY_STOP_LOSS_PCT,
            stop_loss_pct,
            stop_loss_pct > 0.0 && stop_loss_pct < 100.0,
            "must be between 0 and 100 (exclusive)",
        )?;

        let leverage = optional(&values, KEY_LEVERAGE)?.unwrap_or(DEFAULT_LEVERAGE);
        ensure(KEY_LEVERAGE, leverage, leverage >= 1.0, "must be >= 1")?;

        let force_exit = optional(&values, KEY_FORCE_EXIT)?.unwrap_or(0.0) >= 1.0;

        Ok(RiskParams {
            values,
            entry_threshold,
            direction,
            quantity,
            order_size_usd,
            qty_precision,
            min_notional,
            take_profit_pct,
            stop_loss_pct,
            leverage,
            force_exit,
        })
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    /// JSON form written to storage
    pub fn to_json(&self) -> Result<String, ValidationError> {
        serde_json::to_string(&self.values).map_err(|e| ValidationError::Malformed(e.to_string()))
    }
}

fn required(values: &BTreeMap<String, f64>, key: &str) -> Result<f64, ValidationError> {
    optional(values, key)?.ok_or_else(|| ValidationError::MissingParam(key.to_string()))
}

fn optional(values: &BTreeMap<String, f64>, key: &str) -> Result<Option<f64>, ValidationError> {
    match values.get(key) {
        Some(v) if !v.is_finite() => Err(ValidationError::OutOfRange {
            key: key.to_string(),
            value: *v,
            reason: "must be finite",
        }),
        other => Ok(other.copied()),
    }
}

fn ensure(key: &str, value: f64, ok: bool, reason: &'static str) -> Result<(), ValidationError> {
    if ok {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            key: key.to_string(),
            value,
            reason,
        })
    }
}

/// Normalize an instrument identifier (`btcusdt` -> `BTCUSDT`)
pub fn normalize_symbol(symbol: &str) -> Result<String, ValidationError> {
    let trimmed = symbol.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= 32
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/'));
    if !valid {
        return Err(ValidationError::InvalidSymbol(symbol.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// A user's trading configuration
#[derive(Debug, Clone, PartialEq)]
pub struct UserConfig {
    pub user_id: String,
    pub symbol: String,
    pub risk_params: RiskParams,
    pub active: bool,
    /// `None` when the user never subscribed
    pub subscription_expiry: Option<DateTime<Utc>>,
}

impl UserConfig {
    pub fn new(
        user_id: &str,
        symbol: &str,
        risk_params: RiskParams,
        active: bool,
        subscription_expiry: Option<DateTime<Utc>>,
    ) -> Result<Self, ValidationError> {
        if user_id.trim().is_empty() {
            return Err(ValidationError::InvalidUserId(user_id.to_string()));
        }
        Ok(UserConfig {
            user_id: user_id.to_string(),
            symbol: normalize_symbol(symbol)?,
            risk_params,
            active,
            subscription_expiry,
        })
    }

    pub fn is_subscribed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.subscription_expiry, Some(expiry) if now < expiry)
    }

    /// Active and subscribed: the only configs a loop may run for
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.active && self.is_subscribed(now)
    }
}
