//! User Loop
//!
//! One async task per active, subscribed user. Every `poll_interval` the loop
//! re-reads the user's config, prices the symbol, and drives the state machine
//!
//! `Idle -> AwaitingEntry -> Holding -> AwaitingExit -> Idle`
//!
//! writing confirmed entries and exits to the trade ledger. Nothing but the
//! ledger's OPEN record survives between ticks: on start the loop resumes in
//! `Holding` if the user has an OPEN trade and in `Idle` otherwise.
//!
//! Error handling stays inside the loop:
//! - transient gateway errors are retried with backoff, then deferred to the next tick
//! - a rejected symbol deactivates the user and stops the loop
//! - rejected credentials are shared by every loop, so they are logged and
//!   audited but never deactivate anyone
//! - an exit whose outcome is unknown is resubmitted under the same client
//!   order id on later ticks, also after a restart
//! - a ledger conflict after a confirmed entry stops the loop without deactivating

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::domain::entities::order::{ExchangePosition, OrderRequest, OrderResult};
use crate::domain::entities::trade::{ClosePosition, NewTrade, TradeRecord};
use crate::domain::entities::user_config::UserConfig;
use crate::domain::errors::{GatewayError, LedgerError, SettingsError};
use crate::domain::repositories::{
    AuditEntry, AuditEventType, AuditTrail, ExchangeGateway, SettingsStore, TradeLedger,
};
use crate::domain::services::retry::{call_with_retry, RetryPolicy};
use crate::domain::services::strategy::{self, EntrySignal, ExitReason};
use crate::domain::value_objects::{PnL, Price};

/// Reason recorded when an exit is rejected and the exchange has no position
pub const POSITION_MISSING: &str = "position missing on exchange";

/// Collaborators and timing shared by every user loop
#[derive(Clone)]
pub struct LoopContext {
    pub settings: Arc<dyn SettingsStore>,
    pub ledger: Arc<dyn TradeLedger>,
    pub gateway: Arc<dyn ExchangeGateway>,
    pub audit: Arc<dyn AuditTrail>,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Idle,
    AwaitingEntry,
    Holding(TradeRecord),
    AwaitingExit(TradeRecord),
    Stopped,
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Idle => "IDLE",
            LoopState::AwaitingEntry => "AWAITING_ENTRY",
            LoopState::Holding(_) => "HOLDING",
            LoopState::AwaitingExit(_) => "AWAITING_EXIT",
            LoopState::Stopped => "STOPPED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The scheduler withdrew the loop
    Signalled,
    /// Config missing, inactive or expired at the start of a cycle
    Ineligible(String),
    InvalidConfig(String),
    /// The user was deactivated
    FatalGateway(String),
    /// Ledger refused a confirmed entry; the user stays active
    LedgerConflict(String),
    Storage(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Signalled => write!(f, "stop signalled"),
            StopReason::Ineligible(why) => write!(f, "no longer eligible: {}", why),
            StopReason::InvalidConfig(why) => write!(f, "invalid config: {}", why),
            StopReason::FatalGateway(why) => write!(f, "fatal gateway error: {}", why),
            StopReason::LedgerConflict(why) => write!(f, "ledger conflict: {}", why),
            StopReason::Storage(why) => write!(f, "storage failure: {}", why),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Continue,
    Stop(StopReason),
}

/// Per-loop counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub cycles: u64,
    pub entries: u64,
    pub exits: u64,
    pub rejected_orders: u64,
    pub gateway_failures: u64,
}

/// What a finished loop reports back to the scheduler
#[derive(Debug, Clone)]
pub struct LoopExit {
    pub user_id: String,
    pub reason: StopReason,
    pub stats: LoopStats,
}

/// Handle the scheduler keeps for a spawned loop
pub struct LoopHandle {
    user_id: String,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<LoopExit>,
}

impl LoopHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Ask the loop to stop at the top of its next cycle or during its sleep
    pub fn signal_stop(&self) {
        // Fails only once the loop has already exited
        let _ = self.stop_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> Result<LoopExit, JoinError> {
        self.join.await
    }
}

pub struct UserLoop {
    user_id: String,
    ctx: LoopContext,
    state: LoopState,
    stats: LoopStats,
    last_gateway_response: Option<String>,
}

impl UserLoop {
    /// Build a loop for `user_id`, deriving its state from the ledger
    pub async fn resume(user_id: &str, ctx: LoopContext) -> Result<Self, LedgerError> {
        let state = match ctx.ledger.get_open(user_id).await? {
            Some(trade) => LoopState::Holding(trade),
            None => LoopState::Idle,
        };
        Ok(Self {
            user_id: user_id.to_string(),
            ctx,
            state,
            stats: LoopStats::default(),
            last_gateway_response: None,
        })
    }

    /// Spawn a loop task for `user_id`
    ///
    /// # Returns
    /// Handle used to signal stop and collect the loop's exit
    pub fn spawn(user_id: &str, ctx: LoopContext) -> LoopHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let owned_id = user_id.to_string();

        let join = tokio::spawn(async move {
            let resumed = UserLoop::resume(&owned_id, ctx).await;
            match resumed {
                Ok(user_loop) => user_loop.run(stop_rx).await,
                Err(e) => {
                    error!("UserLoop {} could not load its open trade: {}", owned_id, e);
                    LoopExit {
                        user_id: owned_id,
                        reason: StopReason::Storage(e.to_string()),
                        stats: LoopStats::default(),
                    }
                }
            }
        });

        info!("UserLoop spawned for user: {}", user_id);
        LoopHandle {
            user_id: user_id.to_string(),
            stop_tx,
            join,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Main loop: one cycle per tick until stopped
    pub async fn run(mut self, mut stop_rx: watch::Receiver<bool>) -> LoopExit {
        info!(
            "UserLoop {} started in state {}",
            self.user_id,
            self.state.name()
        );
        self.audit(
            AuditEventType::LoopStarted,
            None,
            json!({ "state": self.state.name() }),
        )
        .await;

        let reason = loop {
            if *stop_rx.borrow() {
                break StopReason::Signalled;
            }

            if let CycleOutcome::Stop(reason) = self.run_cycle().await {
                break reason;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.poll_interval) => {}
                // A value change or a dropped sender both mean stop
                _ = stop_rx.changed() => break StopReason::Signalled,
            }
        };

        let last_state = self.state.name();
        self.state = LoopState::Stopped;

        match &reason {
            StopReason::Signalled | StopReason::Ineligible(_) => {
                info!("UserLoop {} stopped: {}", self.user_id, reason)
            }
            StopReason::InvalidConfig(_) => warn!("UserLoop {} stopped: {}", self.user_id, reason),
            _ => error!(
                "UserLoop {} stopped in state {}: {} (last gateway response: {:?})",
                self.user_id, last_state, reason, self.last_gateway_response
            ),
        }
        self.audit(
            AuditEventType::LoopStopped,
            None,
            json!({ "reason": reason.to_string(), "state": last_state }),
        )
        .await;

        LoopExit {
            user_id: self.user_id,
            reason,
            stats: self.stats,
        }
    }

    /// One decision cycle
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;

        let config = match self.ctx.settings.get(&self.user_id).await {
            Ok(config) => config,
            Err(SettingsError::NotFound(_)) => {
                return CycleOutcome::Stop(StopReason::Ineligible("configuration removed".into()))
            }
            Err(SettingsError::Validation { source, .. }) => {
                return CycleOutcome::Stop(StopReason::InvalidConfig(source.to_string()))
            }
            Err(e) => {
                warn!(
                    "UserLoop {} could not read its config, skipping cycle: {}",
                    self.user_id, e
                );
                return CycleOutcome::Continue;
            }
        };

        if !config.active {
            return CycleOutcome::Stop(StopReason::Ineligible("deactivated".into()));
        }
        if !config.is_subscribed(Utc::now()) {
            return CycleOutcome::Stop(StopReason::Ineligible("subscription expired".into()));
        }

        match self.state.clone() {
            LoopState::Idle => self.try_enter(&config).await,
            LoopState::Holding(trade) => self.try_exit(&config, trade).await,
            LoopState::AwaitingEntry | LoopState::AwaitingExit(_) => self.restore_state().await,
            LoopState::Stopped => CycleOutcome::Stop(StopReason::Signalled),
        }
    }

    async fn try_enter(&mut self, config: &UserConfig) -> CycleOutcome {
        let symbol = config.symbol.as_str();

        let price = match self.fetch_price(symbol).await {
            Ok(price) => price,
            Err(e) => return self.handle_gateway_failure("price query", None, symbol, e).await,
        };

        let (side, quantity) = match strategy::evaluate_entry(&config.risk_params, price) {
            EntrySignal::Wait => {
                debug!("User {} waiting: {} @ {}", self.user_id, symbol, price);
                return CycleOutcome::Continue;
            }
            EntrySignal::BelowMinNotional { quantity, notional } => {
                info!(
                    "User {} entry skipped: notional {:.4} below minimum {}",
                    self.user_id, notional, config.risk_params.min_notional
                );
                self.audit(
                    AuditEventType::EntrySkipped,
                    Some(symbol),
                    json!({ "quantity": quantity, "notional": notional, "price": price.value() }),
                )
                .await;
                return CycleOutcome::Continue;
            }
            EntrySignal::Enter { side, quantity } => (side, quantity),
        };

        // Never stack an entry on a position the ledger does not know about
        match self.fetch_position(symbol).await {
            Ok(None) => {}
            Ok(Some(position)) => {
                warn!(
                    "User {} has an untracked {} position of {} {} on the exchange; entry skipped",
                    self.user_id, position.side, position.quantity, symbol
                );
                self.audit(
                    AuditEventType::UntrackedPosition,
                    Some(symbol),
                    position_details(&position),
                )
                .await;
                return CycleOutcome::Continue;
            }
            Err(e) => return self.handle_gateway_failure("position query", None, symbol, e).await,
        }

        let order = match OrderRequest::entry(
            &self.user_id,
            symbol,
            side,
            quantity,
            config.risk_params.leverage,
        ) {
            Ok(order) => order,
            Err(e) => {
                warn!("User {} entry order invalid: {}", self.user_id, e);
                return CycleOutcome::Continue;
            }
        };

        self.state = LoopState::AwaitingEntry;
        info!(
            "User {} entering {} {} {} @ ~{} (client order {})",
            self.user_id, side, quantity, symbol, price, order.client_order_id
        );
        self.audit(
            AuditEventType::EntrySubmitted,
            Some(symbol),
            order_details(&order, price),
        )
        .await;

        match self.place(&order).await {
            Ok(OrderResult::Confirmed {
                order_id,
                fill_price,
            }) => self.record_entry(&order, order_id, fill_price, price).await,
            Ok(OrderResult::Rejected { reason }) => {
                self.state = LoopState::Idle;
                self.stats.rejected_orders += 1;
                warn!("User {} entry rejected: {}", self.user_id, reason);
                self.audit(
                    AuditEventType::EntryRejected,
                    Some(symbol),
                    json!({ "client_order_id": order.client_order_id, "reason": reason }),
                )
                .await;
                CycleOutcome::Continue
            }
            Ok(OrderResult::Pending { .. }) => {
                self.state = LoopState::Idle;
                let err = GatewayError::Pending(order.client_order_id.clone());
                self.handle_gateway_failure(
                    "entry order",
                    Some(AuditEventType::EntryFailed),
                    symbol,
                    err,
                )
                .await
            }
            Err(e) => {
                self.state = LoopState::Idle;
                self.handle_gateway_failure(
                    "entry order",
                    Some(AuditEventType::EntryFailed),
                    symbol,
                    e,
                )
                .await
            }
        }
    }

    async fn record_entry(
        &mut self,
        order: &OrderRequest,
        exchange_order_id: String,
        fill_price: f64,
        quoted: Price,
    ) -> CycleOutcome {
        let entry_price = self.checked_fill(fill_price, quoted);
        let trade = NewTrade {
            user_id: self.user_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            entry_price,
            quantity: order.quantity,
            leverage: order.params.leverage,
            entry_order_id: Some(exchange_order_id.clone()),
            opened_at: Utc::now(),
        };

        match self.ctx.ledger.open(trade.clone()).await {
            Ok(trade_id) => {
                self.stats.entries += 1;
                info!(
                    "User {} entry confirmed: trade {} {} {} {} @ {}",
                    self.user_id, trade_id, trade.side, trade.quantity, trade.symbol, entry_price
                );
                self.audit(
                    AuditEventType::EntryConfirmed,
                    Some(&order.symbol),
                    json!({
                        "trade_id": trade_id,
                        "order_id": exchange_order_id,
                        "client_order_id": order.client_order_id,
                        "fill_price": entry_price,
                        "quantity": trade.quantity,
                    }),
                )
                .await;
                self.state = LoopState::Holding(TradeRecord::opened(trade_id, trade));
                CycleOutcome::Continue
            }
            Err(e @ LedgerError::DuplicateOpenPosition { .. }) => {
                error!(
                    "User {} ledger conflict after confirmed entry {} ({} {} {} @ {}): {}; last gateway response: {:?}",
                    self.user_id,
                    exchange_order_id,
                    trade.side,
                    trade.quantity,
                    trade.symbol,
                    entry_price,
                    e,
                    self.last_gateway_response
                );
                self.audit(
                    AuditEventType::LedgerConflict,
                    Some(&order.symbol),
                    json!({
                        "order_id": exchange_order_id,
                        "client_order_id": order.client_order_id,
                        "fill_price": entry_price,
                        "error": e.to_string(),
                    }),
                )
                .await;
                CycleOutcome::Stop(StopReason::LedgerConflict(e.to_string()))
            }
            Err(e) => {
                error!(
                    "User {} entry {} confirmed on the exchange but not recorded: {}",
                    self.user_id, exchange_order_id, e
                );
                self.audit(
                    AuditEventType::EntryFailed,
                    Some(&order.symbol),
                    json!({
                        "order_id": exchange_order_id,
                        "client_order_id": order.client_order_id,
                        "error": e.to_string(),
                    }),
                )
                .await;
                CycleOutcome::Stop(StopReason::Storage(e.to_string()))
            }
        }
    }

    async fn try_exit(&mut self, config: &UserConfig, mut trade: TradeRecord) -> CycleOutcome {
        let price = match self.fetch_price(&trade.symbol).await {
            Ok(price) => price,
            Err(e) => {
                return self
                    .handle_gateway_failure("price query", None, &trade.symbol, e)
                    .await
            }
        };

        let resubmission = trade.exit_client_order_id.is_some();
        let reason = match strategy::evaluate_exit(&config.risk_params, &trade, price) {
            Some(reason) => reason,
            // The earlier exit may already have filled; settle it first
            None if resubmission => ExitReason::Unsettled,
            None => {
                debug!(
                    "User {} holding trade {}: {} @ {}",
                    self.user_id, trade.trade_id, trade.symbol, price
                );
                return CycleOutcome::Continue;
            }
        };

        let order = match OrderRequest::exit(&trade) {
            Ok(order) => order,
            Err(e) => {
                error!(
                    "User {} cannot build exit order for trade {}: {}",
                    self.user_id, trade.trade_id, e
                );
                return CycleOutcome::Continue;
            }
        };

        // Persisted before submitting so a restart resubmits the same order
        if !resubmission {
            let pending = Some(order.client_order_id.as_str());
            match self.ctx.ledger.set_pending_exit(trade.trade_id, pending).await {
                Ok(()) => trade.exit_client_order_id = Some(order.client_order_id.clone()),
                Err(e @ (LedgerError::NotFound(_) | LedgerError::AlreadyClosed(_))) => {
                    warn!(
                        "User {} trade {} was no longer open before exiting: {}",
                        self.user_id, trade.trade_id, e
                    );
                    return self.restore_state().await;
                }
                Err(e) => {
                    warn!(
                        "User {} could not record exit for trade {}, deferring: {}",
                        self.user_id, trade.trade_id, e
                    );
                    return CycleOutcome::Continue;
                }
            }
        }

        self.state = LoopState::AwaitingExit(trade.clone());
        info!(
            "User {} exiting trade {} ({}) @ ~{} (client order {})",
            self.user_id, trade.trade_id, reason, price, order.client_order_id
        );
        let mut details = order_details(&order, price);
        details["trade_id"] = json!(trade.trade_id);
        details["exit_reason"] = json!(reason.as_str());
        details["resubmission"] = json!(resubmission);
        self.audit(AuditEventType::ExitSubmitted, Some(&trade.symbol), details)
            .await;

        match self.place(&order).await {
            Ok(OrderResult::Confirmed {
                order_id,
                fill_price,
            }) => {
                self.record_exit(&trade, order_id, fill_price, price, reason)
                    .await
            }
            Ok(OrderResult::Rejected { reason: why }) => {
                self.stats.rejected_orders += 1;
                warn!(
                    "User {} exit for trade {} rejected: {}",
                    self.user_id, trade.trade_id, why
                );
                self.audit(
                    AuditEventType::ExitRejected,
                    Some(&trade.symbol),
                    json!({ "trade_id": trade.trade_id, "reason": why }),
                )
                .await;

                // Settled: the next exit goes out under a fresh client order id
                if let Err(e) = self.ctx.ledger.set_pending_exit(trade.trade_id, None).await {
                    warn!(
                        "User {} could not clear pending exit of trade {}: {}",
                        self.user_id, trade.trade_id, e
                    );
                }
                trade.exit_client_order_id = None;
                self.state = LoopState::Holding(trade.clone());
                self.check_position_vanished(&trade).await
            }
            Ok(OrderResult::Pending { .. }) => {
                self.state = LoopState::Holding(trade.clone());
                let err = GatewayError::Pending(order.client_order_id.clone());
                self.handle_gateway_failure(
                    "exit order",
                    Some(AuditEventType::ExitFailed),
                    &trade.symbol,
                    err,
                )
                .await
            }
            Err(e) => {
                self.state = LoopState::Holding(trade.clone());
                self.handle_gateway_failure(
                    "exit order",
                    Some(AuditEventType::ExitFailed),
                    &trade.symbol,
                    e,
                )
                .await
            }
        }
    }

    async fn record_exit(
        &mut self,
        trade: &TradeRecord,
        exchange_order_id: String,
        fill_price: f64,
        quoted: Price,
        reason: ExitReason,
    ) -> CycleOutcome {
        let exit_price = self.checked_fill(fill_price, quoted);
        let (pnl, pnl_error) =
            match PnL::realized(trade.side, trade.entry_price, exit_price, trade.quantity) {
                Ok(pnl) => (pnl, None),
                Err(e) => {
                    warn!(
                        "User {} trade {}: pnl for {} {} @ {} -> {} is {}; recording 0",
                        self.user_id,
                        trade.trade_id,
                        trade.side,
                        trade.quantity,
                        trade.entry_price,
                        exit_price,
                        e
                    );
                    (PnL::zero(), Some(e.to_string()))
                }
            };

        let close = ClosePosition {
            exit_price,
            pnl: pnl.value(),
            closed_at: Utc::now(),
            exit_order_id: Some(exchange_order_id.clone()),
        };

        match self.ctx.ledger.close(trade.trade_id, close).await {
            Ok(()) => {
                self.stats.exits += 1;
                info!(
                    "User {} closed trade {} ({}) @ {}: {}",
                    self.user_id, trade.trade_id, reason, exit_price, pnl
                );
                let mut details = json!({
                    "trade_id": trade.trade_id,
                    "order_id": exchange_order_id,
                    "exit_price": exit_price,
                    "pnl": pnl.value(),
                    "exit_reason": reason.as_str(),
                });
                if let Some(why) = pnl_error {
                    details["pnl_error"] = json!(why);
                }
                self.audit(AuditEventType::ExitConfirmed, Some(&trade.symbol), details)
                    .await;
                self.state = LoopState::Idle;
                CycleOutcome::Continue
            }
            Err(e @ (LedgerError::NotFound(_) | LedgerError::AlreadyClosed(_))) => {
                warn!(
                    "User {} trade {} was no longer open when closing: {}",
                    self.user_id, trade.trade_id, e
                );
                self.restore_state().await
            }
            Err(e) => {
                error!(
                    "User {} exit {} confirmed on the exchange but trade {} not closed: {}",
                    self.user_id, exchange_order_id, trade.trade_id, e
                );
                CycleOutcome::Stop(StopReason::Storage(e.to_string()))
            }
        }
    }

    /// After a rejected exit: if the exchange has no position, the OPEN record
    /// can never be closed and is marked FAILED.
    async fn check_position_vanished(&mut self, trade: &TradeRecord) -> CycleOutcome {
        match self.fetch_position(&trade.symbol).await {
            Ok(Some(_)) => CycleOutcome::Continue,
            Ok(None) => match self.ctx.ledger.mark_failed(trade.trade_id, POSITION_MISSING).await {
                Ok(()) => {
                    warn!(
                        "User {} trade {} marked FAILED: {}",
                        self.user_id, trade.trade_id, POSITION_MISSING
                    );
                    self.audit(
                        AuditEventType::PositionVanished,
                        Some(&trade.symbol),
                        json!({ "trade_id": trade.trade_id }),
                    )
                    .await;
                    self.state = LoopState::Idle;
                    CycleOutcome::Continue
                }
                Err(e) => {
                    warn!(
                        "User {} could not mark trade {} failed: {}",
                        self.user_id, trade.trade_id, e
                    );
                    self.restore_state().await
                }
            },
            Err(e) => {
                self.handle_gateway_failure("position query", None, &trade.symbol, e)
                    .await
            }
        }
    }

    /// Re-derive state from the ledger's OPEN record
    async fn restore_state(&mut self) -> CycleOutcome {
        match self.ctx.ledger.get_open(&self.user_id).await {
            Ok(Some(trade)) => {
                self.state = LoopState::Holding(trade);
                CycleOutcome::Continue
            }
            Ok(None) => {
                self.state = LoopState::Idle;
                CycleOutcome::Continue
            }
            Err(e) => CycleOutcome::Stop(StopReason::Storage(e.to_string())),
        }
    }

    async fn handle_gateway_failure(
        &mut self,
        context: &str,
        event: Option<AuditEventType>,
        symbol: &str,
        err: GatewayError,
    ) -> CycleOutcome {
        self.stats.gateway_failures += 1;
        let details = json!({
            "context": context,
            "error": err.to_string(),
            "code": err.error_code(),
        });

        // One key serves every loop, so a rejected key is never this user's fault
        if let GatewayError::InvalidCredentials(_) = err {
            error!(
                "User {} {} rejected the gateway credentials in state {}: {}; user stays active",
                self.user_id,
                context,
                self.state.name(),
                err
            );
            self.audit(AuditEventType::CredentialsRejected, Some(symbol), details)
                .await;
            return CycleOutcome::Continue;
        }

        if err.is_fatal() {
            error!(
                "User {} {} failed fatally in state {}: {}; deactivating (last gateway response: {:?})",
                self.user_id,
                context,
                self.state.name(),
                err,
                self.last_gateway_response
            );
            if let Err(e) = self.ctx.settings.set_active(&self.user_id, false).await {
                error!("Failed to deactivate user {}: {}", self.user_id, e);
            }
            self.audit(AuditEventType::UserDeactivated, Some(symbol), details)
                .await;
            return CycleOutcome::Stop(StopReason::FatalGateway(err.to_string()));
        }

        warn!(
            "User {} {} failed, deferring to next tick: {}",
            self.user_id, context, err
        );
        if let Some(event) = event {
            self.audit(event, Some(symbol), details).await;
        }
        CycleOutcome::Continue
    }

    async fn fetch_price(&mut self, symbol: &str) -> Result<Price, GatewayError> {
        let gateway = Arc::clone(&self.ctx.gateway);
        let result = call_with_retry("get_price", &self.ctx.retry, || {
            let gateway = gateway.clone();
            let symbol = symbol.to_string();
            async move { gateway.get_price(&symbol).await }
        })
        .await;

        let raw = self.note_response(result)?;
        Price::new(raw).map_err(|e| {
            GatewayError::MalformedResponse(format!("price {} for {}: {}", raw, symbol, e))
        })
    }

    async fn fetch_position(
        &mut self,
        symbol: &str,
    ) -> Result<Option<ExchangePosition>, GatewayError> {
        let gateway = Arc::clone(&self.ctx.gateway);
        let user_id = self.user_id.clone();
        let result = call_with_retry("get_position", &self.ctx.retry, || {
            let gateway = gateway.clone();
            let user_id = user_id.clone();
            let symbol = symbol.to_string();
            async move { gateway.get_position(&user_id, &symbol).await }
        })
        .await;

        self.note_response(result)
    }

    /// Place `order`, retrying transient failures and `Pending` results with
    /// the same client order id
    async fn place(&mut self, order: &OrderRequest) -> Result<OrderResult, GatewayError> {
        let gateway = Arc::clone(&self.ctx.gateway);
        let result = call_with_retry("place_order", &self.ctx.retry, || {
            let gateway = gateway.clone();
            let order = order.clone();
            async move {
                match gateway.place_order(&order).await? {
                    OrderResult::Pending { order_id } => Err(GatewayError::Pending(
                        order_id.unwrap_or(order.client_order_id),
                    )),
                    settled => Ok(settled),
                }
            }
        })
        .await;

        self.note_response(result)
    }

    fn note_response<T: std::fmt::Debug>(
        &mut self,
        result: Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        self.last_gateway_response = Some(match &result {
            Ok(value) => format!("{:?}", value),
            Err(e) => e.to_string(),
        });
        result
    }

    fn checked_fill(&self, fill_price: f64, quoted: Price) -> f64 {
        match Price::new(fill_price) {
            Ok(fill) => fill.value(),
            Err(e) => {
                warn!(
                    "User {} got unusable fill price {} ({}); using quote {}",
                    self.user_id, fill_price, e, quoted
                );
                quoted.value()
            }
        }
    }

    async fn audit(&self, event: AuditEventType, symbol: Option<&str>, details: Value) {
        let mut entry = AuditEntry::new(event, &self.user_id).details(details);
        if let Some(symbol) = symbol {
            entry = entry.symbol(symbol);
        }
        if let Err(e) = self.ctx.audit.record(entry).await {
            warn!(
                "Failed to write audit entry {} for user {}: {}",
                event, self.user_id, e
            );
        }
    }
}

fn order_details(order: &OrderRequest, price: Price) -> Value {
    json!({
        "client_order_id": order.client_order_id,
        "side": order.side.as_str(),
        "quantity": order.quantity,
        "leverage": order.params.leverage,
        "reduce_only": order.params.reduce_only,
        "quoted_price": price.value(),
    })
}

fn position_details(position: &ExchangePosition) -> Value {
    json!({
        "side": position.side.as_str(),
        "quantity": position.quantity,
        "entry_price": position.entry_price,
    })
}
