use std::time::Duration;
use thiserror::Error;

/// Validation errors for user configuration and domain values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required risk parameter: {0}")]
    MissingParam(String),

    #[error("Risk parameter {key} must be numeric")]
    NotNumeric { key: String },

    #[error("Risk parameter {key} out of range ({value}): {reason}")]
    OutOfRange {
        key: String,
        value: f64,
        reason: &'static str,
    },

    #[error("Malformed risk parameters: {0}")]
    Malformed(String),

    #[error("Unsupported risk schema version {found} (engine supports up to {supported})")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Value must be positive")]
    MustBePositive,

    #[error("Value must be finite")]
    MustBeFinite,
}

/// Errors returned by an exchange gateway call.
///
/// Every variant is either transient (safe to retry with backoff) or fatal
/// (never retried). `RetriesExhausted` wraps the last transient error once
/// the retry limit is reached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited by exchange: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    #[error("Order still pending: {0}")]
    Pending(String),

    #[error("Malformed gateway response: {0}")]
    MalformedResponse(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Symbol rejected by exchange: {0}")]
    SymbolRejected(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<GatewayError> },
}

impl GatewayError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::RateLimited(_)
                | GatewayError::Network(_)
                | GatewayError::Unavailable(_)
                | GatewayError::Pending(_)
                | GatewayError::MalformedResponse(_)
        )
    }

    /// Errors that will not go away by themselves and are never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidCredentials(_) | GatewayError::SymbolRejected(_)
        )
    }

    /// Short error code for audit records
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Timeout(_) => "GW_TIMEOUT",
            GatewayError::RateLimited(_) => "GW_RATE_LIMITED",
            GatewayError::Network(_) => "GW_NETWORK",
            GatewayError::Unavailable(_) => "GW_UNAVAILABLE",
            GatewayError::Pending(_) => "GW_PENDING",
            GatewayError::MalformedResponse(_) => "GW_MALFORMED",
            GatewayError::InvalidCredentials(_) => "GW_CREDENTIALS",
            GatewayError::SymbolRejected(_) => "GW_SYMBOL",
            GatewayError::RetriesExhausted { .. } => "GW_EXHAUSTED",
        }
    }
}

/// Trade ledger errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("User {user_id} already has an open position (trade {existing_trade_id})")]
    DuplicateOpenPosition {
        user_id: String,
        existing_trade_id: i64,
    },

    #[error("Trade not found: {0}")]
    NotFound(i64),

    #[error("Trade {0} is no longer open")]
    AlreadyClosed(i64),

    #[error("Corrupt trade record {trade_id}: {reason}")]
    Corrupt { trade_id: i64, reason: String },

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

/// Settings store errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("No configuration for user {0}")]
    NotFound(String),

    #[error("Invalid configuration for user {user_id}: {source}")]
    Validation {
        user_id: String,
        #[source]
        source: ValidationError,
    },

    #[error("Settings storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_classification() {
        assert!(GatewayError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(GatewayError::RateLimited("slow down".into()).is_transient());
        assert!(GatewayError::Pending("abc".into()).is_transient());
        assert!(!GatewayError::Pending("abc".into()).is_fatal());

        assert!(GatewayError::InvalidCredentials("bad key".into()).is_fatal());
        assert!(GatewayError::SymbolRejected("FOO".into()).is_fatal());
        assert!(!GatewayError::SymbolRejected("FOO".into()).is_transient());
    }

    #[test]
    fn test_exhausted_is_neither_transient_nor_fatal() {
        let err = GatewayError::RetriesExhausted {
            attempts: 3,
            last: Box::new(GatewayError::Network("reset".into())),
        };
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
        assert_eq!(err.error_code(), "GW_EXHAUSTED");
        assert_eq!(err.to_string(), "Gave up after 3 attempts: Network error: reset");
    }

    #[test]
    fn test_ledger_error_display() {
        let err = LedgerError::DuplicateOpenPosition {
            user_id: "u1".into(),
            existing_trade_id: 7,
        };
        assert_eq!(
            err.to_string(),
            "User u1 already has an open position (trade 7)"
        );
    }

    #[test]
    fn test_settings_validation_error_display() {
        let err = SettingsError::Validation {
            user_id: "u1".into(),
            source: ValidationError::MissingParam("entry_threshold".into()),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration for user u1: Missing required risk parameter: entry_threshold"
        );
    }
}
