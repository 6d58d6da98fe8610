//! Trading Scheduler
//!
//! Owns the set of running [`UserLoop`]s. Each reconciliation tick pulls the
//! active, subscribed users from the settings store, starts a loop for every
//! user without one and signals stop to loops whose user dropped out. It is
//! the only place loops are started or stopped from outside.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::user_loop::{LoopContext, LoopExit, LoopHandle, UserLoop};

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub running: usize,
    pub started: u64,
    pub stopped: u64,
    pub panicked: u64,
}

pub struct TradingScheduler {
    ctx: LoopContext,
    reconciliation_interval: Duration,
    running: HashMap<String, LoopHandle>,
    /// Loops told to stop that have not finished yet
    stopping: HashMap<String, LoopHandle>,
    started: u64,
    stopped: u64,
    panicked: u64,
}

impl TradingScheduler {
    pub fn new(ctx: LoopContext, reconciliation_interval: Duration) -> Self {
        Self {
            ctx,
            // tokio's interval panics on a zero period
            reconciliation_interval: reconciliation_interval.max(Duration::from_millis(1)),
            running: HashMap::new(),
            stopping: HashMap::new(),
            started: 0,
            stopped: 0,
            panicked: 0,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running.len(),
            started: self.started,
            stopped: self.stopped,
            panicked: self.panicked,
        }
    }

    /// Users with a live loop, sorted
    pub fn running_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.running.keys().cloned().collect();
        users.sort();
        users
    }

    /// Run reconciliation passes for the lifetime of the process
    pub async fn run(self) -> SchedulerStats {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run reconciliation passes until `shutdown` resolves, then stop every
    /// loop and wait for all of them
    pub async fn run_until<F>(mut self, shutdown: F) -> SchedulerStats
    where
        F: Future<Output = ()>,
    {
        info!(
            "TradingScheduler started (reconciliation every {:?}, poll every {:?})",
            self.reconciliation_interval, self.ctx.poll_interval
        );

        let mut ticker = interval(self.reconciliation_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("TradingScheduler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }

        self.shutdown().await;
        let stats = self.stats();
        info!(
            "TradingScheduler stopped: {} loops started, {} stopped, {} panicked",
            stats.started, stats.stopped, stats.panicked
        );
        stats
    }

    /// One reconciliation pass. Safe to call repeatedly.
    pub async fn reconcile(&mut self) {
        self.reap_finished().await;

        let configs = match self.ctx.settings.list_active_subscribed().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!("Reconciliation skipped, could not list users: {}", e);
                return;
            }
        };
        let wanted: HashSet<String> = configs.into_iter().map(|c| c.user_id).collect();

        let withdrawn: Vec<String> = self
            .running
            .keys()
            .filter(|user_id| !wanted.contains(*user_id))
            .cloned()
            .collect();
        for user_id in withdrawn {
            if let Some(handle) = self.running.remove(&user_id) {
                info!("Stopping loop for user {} (no longer eligible)", user_id);
                handle.signal_stop();
                self.stopping.insert(user_id, handle);
            }
        }

        for user_id in wanted {
            if self.running.contains_key(&user_id) {
                continue;
            }
            if self.stopping.contains_key(&user_id) {
                debug!(
                    "User {} still winding down its previous loop; start deferred",
                    user_id
                );
                continue;
            }
            let handle = UserLoop::spawn(&user_id, self.ctx.clone());
            self.started += 1;
            self.running.insert(user_id, handle);
        }

        debug!(
            "Reconciliation done: {} running, {} stopping",
            self.running.len(),
            self.stopping.len()
        );
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<LoopHandle> = drain_finished(&mut self.running)
            .into_iter()
            .chain(drain_finished(&mut self.stopping))
            .collect();

        for handle in finished {
            let user_id = handle.user_id().to_string();
            let outcome = handle.join().await;
            self.record_exit(&user_id, outcome);
        }
    }

    async fn shutdown(&mut self) {
        let handles: Vec<LoopHandle> = self
            .running
            .drain()
            .chain(self.stopping.drain())
            .map(|(_, handle)| handle)
            .collect();
        if handles.is_empty() {
            return;
        }

        info!("Stopping {} user loops", handles.len());
        for handle in &handles {
            handle.signal_stop();
        }

        let user_ids: Vec<String> = handles.iter().map(|h| h.user_id().to_string()).collect();
        let outcomes =
            futures_util::future::join_all(handles.into_iter().map(LoopHandle::join)).await;
        for (user_id, outcome) in user_ids.iter().zip(outcomes) {
            self.record_exit(user_id, outcome);
        }
    }

    fn record_exit(&mut self, user_id: &str, outcome: Result<LoopExit, JoinError>) {
        match outcome {
            Ok(exit) => {
                self.stopped += 1;
                info!(
                    "Loop for user {} exited: {} ({} cycles, {} entries, {} exits)",
                    exit.user_id,
                    exit.reason,
                    exit.stats.cycles,
                    exit.stats.entries,
                    exit.stats.exits
                );
            }
            Err(e) if e.is_panic() => {
                self.panicked += 1;
                error!("Loop for user {} panicked: {}", user_id, e);
            }
            Err(e) => {
                self.stopped += 1;
                warn!("Loop for user {} was cancelled: {}", user_id, e);
            }
        }
    }
}

fn drain_finished(handles: &mut HashMap<String, LoopHandle>) -> Vec<LoopHandle> {
    let done: Vec<String> = handles
        .iter()
        .filter(|(_, handle)| handle.is_finished())
        .map(|(user_id, _)| user_id.clone())
        .collect();
    done.iter().filter_map(|user_id| handles.remove(user_id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::{ExchangePosition, OrderRequest, OrderResult};
    use crate::domain::entities::user_config::{RiskParams, UserConfig, RISK_SCHEMA_VERSION};
    use crate::domain::repositories::{ExchangeGateway, GatewayResult, SettingsStore};
    use crate::domain::services::retry::RetryPolicy;
    use crate::persistence::{
        init_database, AuditLogRepository, DbPool, SqliteSettingsStore, SqliteTradeLedger,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    /// Quotes below every threshold so loops never trade
    struct QuietGateway;

    #[async_trait]
    impl ExchangeGateway for QuietGateway {
        fn name(&self) -> &str {
            "quiet"
        }

        async fn place_order(&self, _order: &OrderRequest) -> GatewayResult<OrderResult> {
            Ok(OrderResult::Rejected {
                reason: "not expected".into(),
            })
        }

        async fn get_price(&self, _symbol: &str) -> GatewayResult<f64> {
            Ok(50.0)
        }

        async fn get_position(
            &self,
            _user_id: &str,
            _symbol: &str,
        ) -> GatewayResult<Option<ExchangePosition>> {
            Ok(None)
        }
    }

    async fn setup() -> (DbPool, Arc<SqliteSettingsStore>, LoopContext) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let settings = Arc::new(SqliteSettingsStore::new(pool.clone()));
        let ctx = LoopContext {
            settings: settings.clone(),
            ledger: Arc::new(SqliteTradeLedger::new(pool.clone())),
            gateway: Arc::new(QuietGateway),
            audit: Arc::new(AuditLogRepository::new(pool.clone())),
            poll_interval: Duration::from_millis(10),
            retry: RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                call_timeout: Duration::from_millis(200),
            },
        };
        (pool, settings, ctx)
    }

    async fn add_user(settings: &SqliteSettingsStore, user_id: &str, active: bool, days_left: i64) {
        let config = UserConfig::new(
            user_id,
            "BTCUSDT",
            RiskParams::from_json(r#"{"entry_threshold": 100}"#, RISK_SCHEMA_VERSION).unwrap(),
            active,
            Some(Utc::now() + chrono::Duration::days(days_left)),
        )
        .unwrap();
        settings.upsert(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_starts_only_eligible_users() {
        let (_pool, settings, ctx) = setup().await;
        add_user(&settings, "alice", true, 30).await;
        add_user(&settings, "bob", true, 30).await;
        add_user(&settings, "carol", false, 30).await;
        add_user(&settings, "dave", true, -1).await;

        let mut scheduler = TradingScheduler::new(ctx, Duration::from_millis(50));
        scheduler.reconcile().await;

        assert_eq!(scheduler.running_users(), vec!["alice", "bob"]);
        assert_eq!(scheduler.stats().started, 2);

        // Idempotent
        scheduler.reconcile().await;
        assert_eq!(scheduler.stats().started, 2);
        assert_eq!(scheduler.stats().running, 2);

        scheduler.shutdown().await;
        assert_eq!(scheduler.stats().stopped, 2);
    }

    #[tokio::test]
    async fn test_deactivated_user_is_stopped_and_reaped() {
        let (_pool, settings, ctx) = setup().await;
        add_user(&settings, "alice", true, 30).await;

        let mut scheduler = TradingScheduler::new(ctx, Duration::from_millis(50));
        scheduler.reconcile().await;
        assert_eq!(scheduler.running_users(), vec!["alice"]);

        settings.set_active("alice", false).await.unwrap();
        scheduler.reconcile().await;
        assert!(scheduler.running_users().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.reconcile().await;
        assert_eq!(scheduler.stats().stopped, 1);
        assert!(scheduler.stopping.is_empty());
    }

    #[tokio::test]
    async fn test_reactivated_user_gets_exactly_one_new_loop() {
        let (_pool, settings, ctx) = setup().await;
        add_user(&settings, "alice", true, 30).await;

        let mut scheduler = TradingScheduler::new(ctx, Duration::from_millis(50));
        scheduler.reconcile().await;

        settings.set_active("alice", false).await.unwrap();
        scheduler.reconcile().await;
        settings.set_active("alice", true).await.unwrap();

        for _ in 0..20 {
            scheduler.reconcile().await;
            assert!(scheduler.running.len() + scheduler.stopping.len() <= 1);
            if scheduler.stats().started == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(scheduler.stats().started, 2);
        assert_eq!(scheduler.running_users(), vec!["alice"]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_listing_failure_leaves_loops_running() {
        let (pool, settings, ctx) = setup().await;
        add_user(&settings, "alice", true, 30).await;

        let mut scheduler = TradingScheduler::new(ctx, Duration::from_millis(50));
        scheduler.reconcile().await;

        pool.close().await;
        scheduler.reconcile().await;

        assert_eq!(scheduler.running_users(), vec!["alice"]);
        assert_eq!(scheduler.stats().started, 1);
        assert!(settings.list_active_subscribed().await.is_err());
    }

    #[tokio::test]
    async fn test_run_until_stops_every_loop() {
        let (_pool, settings, ctx) = setup().await;
        add_user(&settings, "alice", true, 30).await;
        add_user(&settings, "bob", true, 30).await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let scheduler = TradingScheduler::new(ctx, Duration::from_millis(20));
        let task = tokio::spawn(scheduler.run_until(async {
            let _ = shutdown_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.stopped, 2);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.panicked, 0);
    }
}
