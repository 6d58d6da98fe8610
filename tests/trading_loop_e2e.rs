//! End-to-end scenarios: user loops and the scheduler running against real
//! SQLite stores and a mock exchange.

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use common::{in_days, wait_until, Harness, MockExchange};
use tradeloop::application::actors::{CycleOutcome, LoopState, StopReason, UserLoop};
use tradeloop::application::TradingScheduler;
use tradeloop::domain::entities::order::{ExchangePosition, OrderRequest, OrderResult};
use tradeloop::domain::entities::trade::{NewTrade, TradeSide, TradeStatus};
use tradeloop::domain::errors::{GatewayError, LedgerError};
use tradeloop::domain::repositories::{ExchangeGateway, GatewayResult, SettingsStore, TradeLedger};
use tradeloop::infrastructure::PaperGateway;
use tradeloop::persistence::init_database;

const THRESHOLD_100: &str = r#"{"entry_threshold": 100, "quantity": 1}"#;

fn new_trade(user_id: &str) -> NewTrade {
    NewTrade {
        user_id: user_id.to_string(),
        symbol: "BTCUSDT".to_string(),
        side: TradeSide::Buy,
        entry_price: 100.0,
        quantity: 1.0,
        leverage: 1.0,
        entry_order_id: None,
        opened_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn threshold_entry_then_take_profit_exit() {
    let h = Harness::in_memory().await;
    h.add_user("alice", THRESHOLD_100, in_days(30)).await;
    let exchange = Arc::new(MockExchange::at_price(99.0));
    let mut user_loop = UserLoop::resume("alice", h.context(exchange.clone()))
        .await
        .unwrap();

    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    assert_eq!(user_loop.state(), &LoopState::Idle);

    exchange.set_price(101.0);
    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    let open = h.ledger.get_open("alice").await.unwrap().unwrap();
    assert_eq!(open.entry_price, 101.0);
    assert_eq!(open.side, TradeSide::Buy);
    assert!(matches!(user_loop.state(), LoopState::Holding(t) if t.trade_id == open.trade_id));

    // Inside the take-profit band: keep holding
    exchange.set_price(101.5);
    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    assert!(matches!(user_loop.state(), LoopState::Holding(_)));

    exchange.set_price(102.5);
    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    assert_eq!(user_loop.state(), &LoopState::Idle);

    let closed = h.ledger.get(open.trade_id).await.unwrap().unwrap();
    assert_eq!(closed.status, TradeStatus::Closed);
    assert_eq!(closed.exit_price, Some(102.5));
    assert!((closed.pnl.unwrap() - 1.5).abs() < 1e-9);
    assert!(h.ledger.get_open("alice").await.unwrap().is_none());

    let stats = user_loop.stats();
    assert_eq!((stats.entries, stats.exits), (1, 1));
    assert_eq!(exchange.orders_placed(), 2);
}

#[tokio::test]
async fn concurrent_opens_leave_one_open_record() {
    let h = Harness::in_memory().await;
    let ledger: Arc<dyn TradeLedger> = h.ledger.clone();

    let attempts = (0..20).map(|_| {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.open(new_trade("alice")).await })
    });
    let results = futures_util::future::join_all(attempts).await;

    let mut opened = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => opened += 1,
            Err(LedgerError::DuplicateOpenPosition { .. }) => {}
            Err(e) => panic!("unexpected ledger error: {}", e),
        }
    }
    assert_eq!(opened, 1);
    assert_eq!(h.ledger.history("alice", 100).await.unwrap().len(), 1);
}

#[tokio::test]
async fn restart_resumes_holding_from_the_ledger() {
    let path = std::env::temp_dir().join(format!("tradeloop-e2e-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());

    let trade_id = {
        let h = Harness::on(init_database(&url).await.unwrap());
        h.add_user("alice", THRESHOLD_100, in_days(30)).await;
        let exchange = Arc::new(MockExchange::at_price(101.0));
        let mut user_loop = UserLoop::resume("alice", h.context(exchange)).await.unwrap();
        user_loop.run_cycle().await;
        let trade_id = h.ledger.get_open("alice").await.unwrap().unwrap().trade_id;
        h.pool.close().await;
        trade_id
    };

    let h = Harness::on(init_database(&url).await.unwrap());
    let exchange = Arc::new(MockExchange::at_price(101.0));
    let user_loop = UserLoop::resume("alice", h.context(exchange.clone()))
        .await
        .unwrap();
    assert!(matches!(user_loop.state(), LoopState::Holding(t) if t.trade_id == trade_id));

    // A user without an open trade resumes idle
    let idle = UserLoop::resume("bob", h.context(exchange)).await.unwrap();
    assert_eq!(idle.state(), &LoopState::Idle);

    h.pool.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

#[tokio::test]
async fn transient_entry_failure_leaves_no_record() {
    let h = Harness::in_memory().await;
    h.add_user("alice", THRESHOLD_100, in_days(30)).await;
    let exchange = Arc::new(MockExchange::at_price(101.0));
    for _ in 0..3 {
        exchange.queue_error(GatewayError::Network("connection reset".into()));
    }
    let mut user_loop = UserLoop::resume("alice", h.context(exchange.clone()))
        .await
        .unwrap();

    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    assert_eq!(user_loop.state(), &LoopState::Idle);
    assert_eq!(exchange.orders_placed(), 3);
    assert!(h.ledger.get_open("alice").await.unwrap().is_none());
    assert!(h.settings.get("alice").await.unwrap().active);

    // Next tick goes through
    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    assert!(matches!(user_loop.state(), LoopState::Holding(_)));
}

#[tokio::test]
async fn fatal_gateway_error_deactivates_user() {
    let h = Harness::in_memory().await;
    h.add_user("alice", THRESHOLD_100, in_days(30)).await;
    let exchange = Arc::new(MockExchange::at_price(101.0));
    exchange.fail_orders_with(GatewayError::SymbolRejected("BTCUSDT delisted".into()));
    let mut user_loop = UserLoop::resume("alice", h.context(exchange.clone()))
        .await
        .unwrap();

    let outcome = user_loop.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Stop(StopReason::FatalGateway(_))));
    assert_eq!(exchange.orders_placed(), 1);
    assert!(!h.settings.get("alice").await.unwrap().active);
    assert!(h.ledger.get_open("alice").await.unwrap().is_none());

    // The scheduler does not bring the user back
    let mut scheduler = TradingScheduler::new(h.context(exchange), Duration::from_millis(20));
    scheduler.reconcile().await;
    assert!(scheduler.running_users().is_empty());

    let deactivations = h
        .audit
        .get_by_event_type("user_deactivated", 10)
        .await
        .unwrap();
    assert_eq!(deactivations.len(), 1);
}

#[tokio::test]
async fn revoked_shared_key_deactivates_nobody() {
    let h = Harness::in_memory().await;
    for user in ["alice", "bob", "carol"] {
        h.add_user(user, THRESHOLD_100, in_days(30)).await;
    }
    let exchange = Arc::new(MockExchange::at_price(101.0));
    exchange.fail_orders_with(GatewayError::InvalidCredentials("key revoked".into()));

    for user in ["alice", "bob", "carol"] {
        let mut user_loop = UserLoop::resume(user, h.context(exchange.clone()))
            .await
            .unwrap();
        assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
        assert_eq!(user_loop.state(), &LoopState::Idle);
    }

    assert_eq!(exchange.orders_placed(), 3);
    assert_eq!(h.settings.list_active_subscribed().await.unwrap().len(), 3);
    assert!(h
        .audit
        .get_by_event_type("user_deactivated", 10)
        .await
        .unwrap()
        .is_empty());
}

/// Paper exchange whose first few exit replies come back pending even though
/// the exit filled
struct PendingExitReplies {
    paper: PaperGateway,
    pending_replies: AtomicU32,
}

#[async_trait]
impl ExchangeGateway for PendingExitReplies {
    fn name(&self) -> &str {
        "pending-exit-replies"
    }

    async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderResult> {
        let result = self.paper.place_order(order).await?;
        let hide = order.params.reduce_only
            && self
                .pending_replies
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if hide {
            return Ok(OrderResult::Pending { order_id: None });
        }
        Ok(result)
    }

    async fn get_price(&self, symbol: &str) -> GatewayResult<f64> {
        self.paper.get_price(symbol).await
    }

    async fn get_position(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> GatewayResult<Option<ExchangePosition>> {
        self.paper.get_position(user_id, symbol).await
    }
}

#[tokio::test]
async fn exit_filled_behind_pending_replies_is_closed_with_its_fill() {
    let h = Harness::in_memory().await;
    h.add_user("alice", THRESHOLD_100, in_days(30)).await;
    let prices = Arc::new(MockExchange::at_price(101.0));
    let exchange = Arc::new(PendingExitReplies {
        paper: PaperGateway::new(prices.clone()),
        pending_replies: AtomicU32::new(3),
    });
    let mut user_loop = UserLoop::resume("alice", h.context(exchange.clone()))
        .await
        .unwrap();

    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    let trade_id = h.ledger.get_open("alice").await.unwrap().unwrap().trade_id;

    prices.set_price(103.0);
    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    assert!(matches!(user_loop.state(), LoopState::Holding(_)));
    assert!(exchange
        .get_position("alice", "BTCUSDT")
        .await
        .unwrap()
        .is_none());

    // The price moves on; the exit is settled at its real fill
    prices.set_price(101.5);
    assert_eq!(user_loop.run_cycle().await, CycleOutcome::Continue);
    assert_eq!(user_loop.state(), &LoopState::Idle);

    let record = h.ledger.get(trade_id).await.unwrap().unwrap();
    assert_eq!(record.status, TradeStatus::Closed);
    assert_eq!(record.exit_price, Some(103.0));
    assert!((record.pnl.unwrap() - 2.0).abs() < 1e-9);
    assert!(record.failure_reason.is_none());
}

#[tokio::test]
async fn expired_users_are_not_started_and_running_ones_are_stopped() {
    let h = Harness::in_memory().await;
    h.add_user("alice", THRESHOLD_100, in_days(30)).await;
    h.add_user("bob", THRESHOLD_100, in_days(-1)).await;
    let exchange = Arc::new(MockExchange::at_price(90.0));

    let mut scheduler = TradingScheduler::new(h.context(exchange), Duration::from_millis(20));
    scheduler.reconcile().await;
    assert_eq!(scheduler.running_users(), vec!["alice"]);

    // alice's subscription lapses
    h.add_user("alice", THRESHOLD_100, in_days(-1)).await;
    scheduler.reconcile().await;
    assert!(scheduler.running_users().is_empty());

    let mut stopped = false;
    for _ in 0..50 {
        scheduler.reconcile().await;
        if scheduler.stats().stopped == 1 {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped);
    assert_eq!(scheduler.stats().started, 1);
}

#[tokio::test]
async fn two_users_trade_concurrently_through_paper_gateway() {
    let h = Harness::in_memory().await;
    h.add_user("alice", THRESHOLD_100, in_days(30)).await;
    h.add_user("bob", THRESHOLD_100, in_days(30)).await;
    let prices = Arc::new(MockExchange::at_price(101.0));
    let paper = Arc::new(PaperGateway::new(prices));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let scheduler = TradingScheduler::new(h.context(paper.clone()), Duration::from_millis(20));
    let task = tokio::spawn(scheduler.run_until(async {
        let _ = shutdown_rx.await;
    }));

    let ledger = h.ledger.clone();
    let both_open = wait_until(Duration::from_secs(5), || {
        let ledger = ledger.clone();
        async move {
            ledger.get_open("alice").await.ok().flatten().is_some()
                && ledger.get_open("bob").await.ok().flatten().is_some()
        }
    })
    .await;
    assert!(both_open);

    shutdown_tx.send(()).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.started, 2);
    assert_eq!(stats.panicked, 0);

    let alice = h.ledger.get_open("alice").await.unwrap().unwrap();
    let bob = h.ledger.get_open("bob").await.unwrap().unwrap();
    assert_ne!(alice.trade_id, bob.trade_id);
    assert_eq!(alice.user_id, "alice");
    assert_eq!(bob.user_id, "bob");

    assert!(paper.get_position("alice", "BTCUSDT").await.unwrap().is_some());
    assert!(paper.get_position("bob", "BTCUSDT").await.unwrap().is_some());
}
