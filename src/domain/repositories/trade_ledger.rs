use crate::domain::entities::trade::{ClosePosition, NewTrade, TradeId, TradeRecord};
use crate::domain::errors::LedgerError;
use async_trait::async_trait;

/// Durable record of every trade.
///
/// Holds at most one OPEN record per user. Writes for the same user or the
/// same trade are serialized and atomic; readers never observe a partial record.
#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Record a confirmed entry as OPEN.
    ///
    /// # Errors
    /// `LedgerError::DuplicateOpenPosition` if the user already has an OPEN record
    async fn open(&self, trade: NewTrade) -> Result<TradeId, LedgerError>;

    /// Move an OPEN record to CLOSED with its exit price and pnl.
    ///
    /// # Errors
    /// `LedgerError::NotFound` or `LedgerError::AlreadyClosed`
    async fn close(&self, trade_id: TradeId, close: ClosePosition) -> Result<(), LedgerError>;

    /// Remember (or forget, with `None`) the client order id of an exit that
    /// was submitted for an OPEN record but has not settled
    ///
    /// # Errors
    /// `LedgerError::NotFound` or `LedgerError::AlreadyClosed`
    async fn set_pending_exit(
        &self,
        trade_id: TradeId,
        client_order_id: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Move an OPEN record to FAILED
    async fn mark_failed(&self, trade_id: TradeId, reason: &str) -> Result<(), LedgerError>;

    /// The user's OPEN record, if any
    async fn get_open(&self, user_id: &str) -> Result<Option<TradeRecord>, LedgerError>;

    async fn get(&self, trade_id: TradeId) -> Result<Option<TradeRecord>, LedgerError>;

    /// Most recent records first
    async fn history(&self, user_id: &str, limit: i64) -> Result<Vec<TradeRecord>, LedgerError>;
}
