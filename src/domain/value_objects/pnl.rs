use crate::domain::entities::trade::TradeSide;
use crate::domain::errors::ValidationError;

/// Profit and Loss value object
///
/// Unlike Price, PnL can be negative to represent losses.
/// This type ensures PnL values are valid (finite) but allows negative values.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct PnL(f64);

impl PnL {
    /// Create a new PnL value
    ///
    /// # Errors
    /// Returns ValidationError::MustBeFinite if the value is NaN or infinite
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Ok(PnL(value))
    }

    /// Realized PnL of a closed position.
    ///
    /// A long (`Buy`) entry earns `(exit - entry) * quantity`, a short (`Sell`)
    /// entry earns `(entry - exit) * quantity`.
    pub fn realized(
        entry_side: TradeSide,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
    ) -> Result<Self, ValidationError> {
        let per_unit = match entry_side {
            TradeSide::Buy => exit_price - entry_price,
            TradeSide::Sell => entry_price - exit_price,
        };
        PnL::new(per_unit * quantity)
    }

    /// Create a zero PnL (breakeven)
    pub fn zero() -> Self {
        PnL(0.0)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for PnL {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 0.0 {
            write!(f, "+${:.2}", self.0)
        } else {
            write!(f, "-${:.2}", self.0.abs())
        }
    }
}
