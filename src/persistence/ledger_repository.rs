//! SQLite-backed trade ledger.
//!
//! Writes take the user's key lock and then run as a single statement, so a
//! record is either fully written or not at all. The partial unique index on
//! `trades(user_id) WHERE status = 'OPEN'` backs the one-open-trade rule even
//! against writers outside this process.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::key_lock::KeyedLocks;
use super::models::TradeRow;
use super::DbPool;
use crate::domain::entities::trade::{ClosePosition, NewTrade, TradeId, TradeRecord};
use crate::domain::errors::LedgerError;
use crate::domain::repositories::TradeLedger;

pub struct SqliteTradeLedger {
    pool: DbPool,
    locks: Arc<KeyedLocks>,
}

impl SqliteTradeLedger {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    async fn open_trade_id(&self, user_id: &str) -> Result<Option<TradeId>, LedgerError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT trade_id FROM trades WHERE user_id = ?1 AND status = 'OPEN'")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error(&format!("look up open trade for {}", user_id), e))?;
        Ok(row.map(|(id,)| id))
    }

    async fn duplicate(&self, user_id: &str) -> LedgerError {
        let existing_trade_id = self.open_trade_id(user_id).await.ok().flatten().unwrap_or(0);
        LedgerError::DuplicateOpenPosition {
            user_id: user_id.to_string(),
            existing_trade_id,
        }
    }

    async fn owner_of(&self, trade_id: TradeId) -> Result<String, LedgerError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM trades WHERE trade_id = ?1")
                .bind(trade_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error(&format!("look up trade {}", trade_id), e))?;
        row.map(|(user_id,)| user_id)
            .ok_or(LedgerError::NotFound(trade_id))
    }
}

#[async_trait]
impl TradeLedger for SqliteTradeLedger {
    async fn open(&self, trade: NewTrade) -> Result<TradeId, LedgerError> {
        let _guard = self.locks.lock(&trade.user_id).await;

        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                user_id, symbol, side, entry_price, quantity, leverage,
                status, opened_at, entry_order_id
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, 'OPEN', ?7, ?8
            WHERE NOT EXISTS (
                SELECT 1 FROM trades WHERE user_id = ?1 AND status = 'OPEN'
            )
            "#,
        )
        .bind(&trade.user_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.entry_price)
        .bind(trade.quantity)
        .bind(trade.leverage)
        .bind(trade.opened_at)
        .bind(&trade.entry_order_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                let trade_id = done.last_insert_rowid();
                info!(
                    "Opened trade {} for user {}: {} {} {} @ {}",
                    trade_id,
                    trade.user_id,
                    trade.side,
                    trade.quantity,
                    trade.symbol,
                    trade.entry_price
                );
                Ok(trade_id)
            }
            Ok(_) => Err(self.duplicate(&trade.user_id).await),
            Err(e) if is_unique_violation(&e) => Err(self.duplicate(&trade.user_id).await),
            Err(e) => Err(storage_error(
                &format!("open trade for {}", trade.user_id),
                e,
            )),
        }
    }

    async fn close(&self, trade_id: TradeId, close: ClosePosition) -> Result<(), LedgerError> {
        let user_id = self.owner_of(trade_id).await?;
        let _guard = self.locks.lock(&user_id).await;

        let rows_affected = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'CLOSED', exit_price = ?1, pnl = ?2, closed_at = ?3, exit_order_id = ?4
            WHERE trade_id = ?5 AND status = 'OPEN'
            "#,
        )
        .bind(close.exit_price)
        .bind(close.pnl)
        .bind(close.closed_at)
        .bind(&close.exit_order_id)
        .bind(trade_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("close trade {}", trade_id), e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(LedgerError::AlreadyClosed(trade_id));
        }

        info!(
            "Closed trade {} for user {} @ {} (pnl {})",
            trade_id, user_id, close.exit_price, close.pnl
        );
        Ok(())
    }

    async fn set_pending_exit(
        &self,
        trade_id: TradeId,
        client_order_id: Option<&str>,
    ) -> Result<(), LedgerError> {
        let user_id = self.owner_of(trade_id).await?;
        let _guard = self.locks.lock(&user_id).await;

        let rows_affected = sqlx::query(
            "UPDATE trades SET exit_client_order_id = ?1 WHERE trade_id = ?2 AND status = 'OPEN'",
        )
        .bind(client_order_id)
        .bind(trade_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("record pending exit for trade {}", trade_id), e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(LedgerError::AlreadyClosed(trade_id));
        }

        debug!(
            "Trade {} for user {} pending exit: {:?}",
            trade_id, user_id, client_order_id
        );
        Ok(())
    }

    async fn mark_failed(&self, trade_id: TradeId, reason: &str) -> Result<(), LedgerError> {
        let user_id = self.owner_of(trade_id).await?;
        let _guard = self.locks.lock(&user_id).await;

        let rows_affected = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'FAILED', failure_reason = ?1, closed_at = ?2
            WHERE trade_id = ?3 AND status = 'OPEN'
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(trade_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("mark trade {} failed", trade_id), e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(LedgerError::AlreadyClosed(trade_id));
        }

        info!("Marked trade {} for user {} FAILED: {}", trade_id, user_id, reason);
        Ok(())
    }

    async fn get_open(&self, user_id: &str) -> Result<Option<TradeRecord>, LedgerError> {
        let row = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE user_id = ?1 AND status = 'OPEN'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("get open trade for {}", user_id), e))?;

        row.map(TradeRecord::try_from).transpose()
    }

    async fn get(&self, trade_id: TradeId) -> Result<Option<TradeRecord>, LedgerError> {
        let row = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades WHERE trade_id = ?1")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error(&format!("get trade {}", trade_id), e))?;

        row.map(TradeRecord::try_from).transpose()
    }

    async fn history(&self, user_id: &str, limit: i64) -> Result<Vec<TradeRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE user_id = ?1 ORDER BY trade_id DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("get trade history for {}", user_id), e))?;

        debug!("Loaded {} trades for user {}", rows.len(), user_id);
        rows.into_iter().map(TradeRecord::try_from).collect()
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn storage_error(context: &str, e: sqlx::Error) -> LedgerError {
    error!("Failed to {}: {}", context, e);
    LedgerError::Storage(format!("Failed to {}: {}", context, e))
}
