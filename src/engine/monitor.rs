use crate::api::ExchangeApi;
use crate::config::{BotConfig, SizingConfig};
use crate::db::{FlowStore, NewPosition, PositionLedger};
use crate::engine::signal::evaluate_flow;
use crate::engine::sizing::{format_size, position_size};
use crate::error::Result;
use crate::models::{
    FlowSignal, LastSignal, MonitoringStats, RunState, TrackedAsset, TradingPosition,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// The slice of [`BotConfig`] the monitoring loop needs.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub min_flow_threshold: f64,
    pub max_position_notional: f64,
    pub sizing: SizingConfig,
    pub tracked_assets: Vec<TrackedAsset>,
}

impl From<&BotConfig> for MonitorConfig {
    fn from(config: &BotConfig) -> Self {
        Self {
            check_interval: config.check_interval,
            min_flow_threshold: config.min_flow_threshold,
            max_position_notional: config.max_position_notional,
            sizing: config.sizing.clone(),
            tracked_assets: config.tracked_assets.clone(),
        }
    }
}

/// Threshold-triggered monitoring loop: polls the flow store per tracked
/// asset, evaluates each new record exactly once, and drives the
/// size -> execute -> record pipeline for records that signal.
///
/// Lifecycle is `Stopped -> Running -> Stopped`; `start()` on a running
/// monitor and `stop()` on a stopped one are warning-logged no-ops.
/// Evaluation passes never overlap: the scheduler task awaits each pass
/// inline and skips ticks that elapse while a pass is still running.
pub struct FlowMonitor {
    inner: Arc<Inner>,
    runtime: tokio::sync::Mutex<Option<RunHandle>>,
}

struct Inner {
    config: MonitorConfig,
    store: Arc<dyn FlowStore>,
    exchange: Arc<dyn ExchangeApi>,
    ledger: Arc<dyn PositionLedger>,
    state: Mutex<MonitorState>,
}

/// Watermarks and stats are the only mutable shared state; both live behind
/// this one mutex and are written only from pass execution (plus the
/// lifecycle transitions). Readers always get a cloned snapshot.
#[derive(Default)]
struct MonitorState {
    is_running: bool,
    watermarks: HashMap<String, DateTime<Utc>>,
    stats: MonitoringStats,
}

struct RunHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FlowMonitor {
    pub fn new(
        config: MonitorConfig,
        store: Arc<dyn FlowStore>,
        exchange: Arc<dyn ExchangeApi>,
        ledger: Arc<dyn PositionLedger>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                exchange,
                ledger,
                state: Mutex::new(MonitorState::default()),
            }),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Probe the exchange, reset watermarks to now, and begin scheduling
    /// evaluation passes. Fails with `GatewayUnavailable` (and stays
    /// Stopped) if the authenticated probe does not succeed.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            tracing::warn!("Monitor already running, start() ignored");
            return Ok(());
        }

        self.inner.exchange.check_connection().await?;

        {
            let mut state = self.inner.state.lock().unwrap();
            let now = Utc::now();
            state.watermarks = self
                .inner
                .config
                .tracked_assets
                .iter()
                .map(|asset| (asset.symbol.clone(), now))
                .collect();
            state.is_running = true;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            // First pass right away, then on the fixed interval. Shutdown is
            // only observed between passes, so an in-flight pass always
            // completes before the task exits.
            inner.clone().run_pass().await;

            let period = inner.config.check_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => inner.clone().run_pass().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *runtime = Some(RunHandle {
            shutdown: shutdown_tx,
            task,
        });

        tracing::info!(
            "Flow monitoring started: {} assets, pass every {:?}",
            self.inner.config.tracked_assets.len(),
            self.inner.config.check_interval
        );
        Ok(())
    }

    /// Stop scheduling and wait for any in-flight pass to finish, so no trade
    /// can execute after the monitor reports Stopped. An order already
    /// submitted to the exchange is never cancelled.
    pub async fn stop(&self) {
        let handle = {
            let mut runtime = self.runtime.lock().await;
            runtime.take()
        };

        let Some(handle) = handle else {
            tracing::warn!("Monitor not running, stop() ignored");
            return;
        };

        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            tracing::error!("Monitor task failed: {}", e);
        }

        let mut state = self.inner.state.lock().unwrap();
        state.is_running = false;
        state.watermarks.clear();

        tracing::info!("Flow monitoring stopped");
    }

    /// Snapshot of the complete observable state. Always succeeds, running
    /// or not.
    pub fn status(&self) -> RunState {
        let state = self.inner.state.lock().unwrap();
        RunState {
            is_running: state.is_running,
            watermarks: state.watermarks.clone(),
            stats: state.stats.clone(),
        }
    }

    pub fn stats(&self) -> MonitoringStats {
        self.inner.state.lock().unwrap().stats.clone()
    }

    /// Zero the counters; run state and watermarks are untouched.
    pub fn reset_stats(&self) {
        self.inner.state.lock().unwrap().stats = MonitoringStats::default();
        tracing::info!("Monitoring stats reset");
    }

    #[cfg(test)]
    async fn run_pass_now(&self) {
        self.inner.clone().run_pass().await;
    }

    #[cfg(test)]
    fn seed_watermarks(&self, since: DateTime<Utc>) {
        let mut state = self.inner.state.lock().unwrap();
        state.watermarks = self
            .inner
            .config
            .tracked_assets
            .iter()
            .map(|asset| (asset.symbol.clone(), since))
            .collect();
    }
}

impl Inner {
    /// One evaluation pass. Assets are polled concurrently and fully
    /// independently: an error on one never aborts the others.
    async fn run_pass(self: Arc<Self>) {
        tracing::debug!("Checking for new flow records...");

        let watermarks = self.state.lock().unwrap().watermarks.clone();

        let mut handles = Vec::new();
        for asset in self.config.tracked_assets.clone() {
            let since = watermarks
                .get(&asset.symbol)
                .copied()
                .unwrap_or_else(Utc::now);
            let inner = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                inner.evaluate_asset(&asset, since).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Asset evaluation task failed: {}", e);
            }
        }
    }

    async fn evaluate_asset(&self, asset: &TrackedAsset, since: DateTime<Utc>) {
        let records = match self.store.list_new_records(&asset.symbol, since).await {
            Ok(records) => records,
            Err(e) => {
                // Watermark untouched: the same records are retried on the
                // next pass.
                tracing::error!("Failed to read {} flow records: {}", asset.symbol, e);
                return;
            }
        };

        if records.is_empty() {
            return;
        }

        tracing::info!("Found {} new {} flow records", records.len(), asset.symbol);

        let mut latest = since;
        for record in &records {
            match evaluate_flow(record, self.config.min_flow_threshold) {
                Some(signal) => {
                    tracing::info!(
                        "Signal {}: flow = {}, side = {}, strength = {:.2}",
                        asset.symbol,
                        signal.flow_value,
                        signal.side,
                        signal.strength
                    );
                    self.note_signal(&signal);

                    match self.execute_signal(asset, &signal).await {
                        Ok(position) => {
                            tracing::info!(
                                "Position {} created (order {})",
                                position.id,
                                position.exchange_order_id
                            );
                            self.state.lock().unwrap().stats.successful_trades += 1;
                        }
                        Err(e) => {
                            // A failed trade after a real signal is a
                            // business-significant miss: it is counted and
                            // logged, but the watermark still advances and
                            // the signal is not retried.
                            tracing::error!(
                                "Trade failed for {} signal ({} strength {:.2}, flow {}): {}",
                                asset.symbol,
                                signal.side,
                                signal.strength,
                                signal.flow_value,
                                e
                            );
                            self.state.lock().unwrap().stats.failed_trades += 1;
                        }
                    }
                }
                None => {
                    tracing::debug!(
                        "{} flow {} below threshold {}",
                        asset.symbol,
                        record.total_flow,
                        self.config.min_flow_threshold
                    );
                }
            }
            latest = latest.max(record.date);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(watermark) = state.watermarks.get_mut(&asset.symbol) {
            *watermark = latest;
        }
    }

    /// Full size -> execute -> record pipeline for one signal.
    async fn execute_signal(
        &self,
        asset: &TrackedAsset,
        signal: &FlowSignal,
    ) -> Result<TradingPosition> {
        let ticker = self.exchange.get_ticker(&asset.exchange_symbol).await?;
        let quantity = position_size(
            signal,
            ticker.price,
            self.config.max_position_notional,
            &self.config.sizing,
        )?;
        let size = format_size(quantity, &self.config.sizing);
        let order_side = signal.side.as_order_side();

        tracing::info!(
            "Executing trade: {} {} {} @ {}",
            asset.exchange_symbol,
            order_side,
            size,
            ticker.price
        );

        let receipt = self
            .exchange
            .place_market_order(&asset.exchange_symbol, order_side, &size)
            .await?;

        match self
            .ledger
            .record_open_position(NewPosition {
                symbol: &asset.exchange_symbol,
                side: signal.side,
                size: quantity,
                entry_price: ticker.price,
                total_flow: signal.flow_value,
                exchange_order_id: &receipt.order_id,
            })
            .await
        {
            Ok(position) => Ok(position),
            Err(e) => {
                // Money moved but the row did not land; this needs manual
                // reconciliation, so keep the order id in the log.
                tracing::error!(
                    "Order {} executed but position not recorded: {}",
                    receipt.order_id,
                    e
                );
                Err(e)
            }
        }
    }

    fn note_signal(&self, signal: &FlowSignal) {
        let mut state = self.state.lock().unwrap();
        state.stats.total_signals += 1;
        *state
            .stats
            .per_asset_signals
            .entry(signal.asset.clone())
            .or_insert(0) += 1;
        state.stats.last_signal = Some(LastSignal {
            asset: signal.asset.clone(),
            flow_value: signal.flow_value,
            side: signal.side,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderReceipt, Ticker};
    use crate::db::LedgerStats;
    use crate::error::BotError;
    use crate::models::{FlowRecord, PositionStatus, Side};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct MockStore {
        records: Mutex<HashMap<String, Vec<FlowRecord>>>,
        failing: Mutex<HashSet<String>>,
        delay: Option<Duration>,
    }

    impl MockStore {
        fn insert(&self, asset: &str, date: DateTime<Utc>, total_flow: f64) {
            self.records
                .lock()
                .unwrap()
                .entry(asset.to_string())
                .or_default()
                .push(FlowRecord {
                    asset: asset.to_string(),
                    date,
                    total_flow,
                    breakdown: None,
                });
        }

        fn fail_asset(&self, asset: &str) {
            self.failing.lock().unwrap().insert(asset.to_string());
        }
    }

    #[async_trait]
    impl FlowStore for MockStore {
        async fn list_new_records(
            &self,
            asset: &str,
            since: DateTime<Utc>,
        ) -> crate::error::Result<Vec<FlowRecord>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().unwrap().contains(asset) {
                return Err(BotError::StoreUnavailable("connection refused".to_string()));
            }
            let mut records: Vec<FlowRecord> = self
                .records
                .lock()
                .unwrap()
                .get(asset)
                .map(|all| all.iter().filter(|r| r.date > since).cloned().collect())
                .unwrap_or_default();
            records.sort_by_key(|r| r.date);
            Ok(records)
        }
    }

    struct MockExchange {
        price: f64,
        reachable: bool,
        fail_orders: bool,
        orders: Mutex<Vec<(String, String, String)>>,
        order_seq: AtomicU64,
    }

    impl MockExchange {
        fn new(price: f64) -> Self {
            Self {
                price,
                reachable: true,
                fail_orders: false,
                orders: Mutex::new(Vec::new()),
                order_seq: AtomicU64::new(0),
            }
        }

        fn orders(&self) -> Vec<(String, String, String)> {
            self.orders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExchangeApi for MockExchange {
        async fn check_connection(&self) -> crate::error::Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(BotError::GatewayUnavailable("probe failed".to_string()))
            }
        }

        async fn get_ticker(&self, symbol: &str) -> crate::error::Result<Ticker> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                price: self.price,
                bid: self.price,
                ask: self.price,
                volume: 0.0,
            })
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: &str,
            size: &str,
        ) -> crate::error::Result<OrderReceipt> {
            if self.fail_orders {
                return Err(BotError::Exchange {
                    code: "51008".to_string(),
                    message: "Insufficient balance".to_string(),
                });
            }
            self.orders.lock().unwrap().push((
                symbol.to_string(),
                side.to_string(),
                size.to_string(),
            ));
            let seq = self.order_seq.fetch_add(1, Ordering::SeqCst);
            Ok(OrderReceipt {
                order_id: format!("order-{}", seq),
                client_order_id: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct MockLedger {
        positions: Mutex<Vec<TradingPosition>>,
    }

    #[async_trait]
    impl PositionLedger for MockLedger {
        async fn record_open_position(
            &self,
            new: NewPosition<'_>,
        ) -> crate::error::Result<TradingPosition> {
            let now = Utc::now();
            let position = TradingPosition {
                id: uuid::Uuid::new_v4(),
                symbol: new.symbol.to_string(),
                side: new.side,
                size: new.size,
                entry_price: new.entry_price,
                total_flow: new.total_flow,
                exchange_order_id: new.exchange_order_id.to_string(),
                status: PositionStatus::Open,
                profit_loss: None,
                created_at: now,
                updated_at: now,
            };
            self.positions.lock().unwrap().push(position.clone());
            Ok(position)
        }

        async fn stats(&self) -> crate::error::Result<LedgerStats> {
            let positions = self.positions.lock().unwrap();
            Ok(LedgerStats {
                total_positions: positions.len() as i64,
                open_positions: positions.len() as i64,
                closed_positions: 0,
                aggregate_profit_loss: 0.0,
            })
        }
    }

    struct Harness {
        monitor: FlowMonitor,
        store: Arc<MockStore>,
        exchange: Arc<MockExchange>,
        ledger: Arc<MockLedger>,
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            check_interval: Duration::from_secs(3600),
            min_flow_threshold: 1_000_000.0,
            max_position_notional: 1_000.0,
            sizing: SizingConfig::default(),
            tracked_assets: vec![
                TrackedAsset::new("BTC", "BTC-USDT"),
                TrackedAsset::new("ETH", "ETH-USDT"),
            ],
        }
    }

    fn harness(store: MockStore, exchange: MockExchange) -> Harness {
        let store = Arc::new(store);
        let exchange = Arc::new(exchange);
        let ledger = Arc::new(MockLedger::default());
        let monitor = FlowMonitor::new(
            test_config(),
            store.clone(),
            exchange.clone(),
            ledger.clone(),
        );
        Harness {
            monitor,
            store,
            exchange,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_start_fails_when_gateway_unreachable() {
        let mut exchange = MockExchange::new(50_000.0);
        exchange.reachable = false;
        let h = harness(MockStore::default(), exchange);

        let result = h.monitor.start().await;
        assert!(matches!(result, Err(BotError::GatewayUnavailable(_))));
        assert!(!h.monitor.status().is_running);
        assert!(h.monitor.status().watermarks.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let h = harness(MockStore::default(), MockExchange::new(50_000.0));

        h.monitor.start().await.unwrap();
        assert!(h.monitor.status().is_running);
        assert_eq!(h.monitor.status().watermarks.len(), 2);

        // Second start is a no-op that resets nothing.
        let watermarks_before = h.monitor.status().watermarks;
        h.monitor.start().await.unwrap();
        assert_eq!(h.monitor.status().watermarks, watermarks_before);

        h.monitor.stop().await;
        assert!(!h.monitor.status().is_running);

        let stats_before = h.monitor.stats();
        h.monitor.stop().await;
        assert!(!h.monitor.status().is_running);
        assert_eq!(
            h.monitor.stats().total_signals,
            stats_before.total_signals
        );
    }

    #[tokio::test]
    async fn test_signal_executes_full_pipeline() {
        // Strong outflow: -2.5M against a 1M threshold at a 50k price.
        let store = MockStore::default();
        let since = Utc::now();
        let record_date = since + chrono::Duration::seconds(10);
        store.insert("BTC", record_date, -2_500_000.0);

        let h = harness(store, MockExchange::new(50_000.0));
        h.monitor.seed_watermarks(since);
        h.monitor.run_pass_now().await;

        let orders = h.exchange.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(
            orders[0],
            (
                "BTC-USDT".to_string(),
                "sell".to_string(),
                "0.04000".to_string()
            )
        );

        let positions = h.ledger.positions.lock().unwrap().clone();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Short);
        assert_eq!(positions[0].size, 0.04);
        assert_eq!(positions[0].entry_price, 50_000.0);
        assert_eq!(positions[0].status, PositionStatus::Open);

        let stats = h.monitor.stats();
        assert_eq!(stats.total_signals, 1);
        assert_eq!(stats.successful_trades, 1);
        assert_eq!(stats.failed_trades, 0);
        assert_eq!(stats.per_asset_signals.get("BTC"), Some(&1));
        let last = stats.last_signal.unwrap();
        assert_eq!(last.asset, "BTC");
        assert_eq!(last.side, Side::Short);

        // Watermark advanced to the record's date, not "now".
        assert_eq!(
            h.monitor.status().watermarks.get("BTC"),
            Some(&record_date)
        );
    }

    #[tokio::test]
    async fn test_below_threshold_advances_watermark_without_signal() {
        let store = MockStore::default();
        let since = Utc::now();
        let record_date = since + chrono::Duration::seconds(5);
        store.insert("BTC", record_date, 400_000.0);

        let h = harness(store, MockExchange::new(50_000.0));
        h.monitor.seed_watermarks(since);
        h.monitor.run_pass_now().await;

        assert!(h.exchange.orders().is_empty());
        assert_eq!(h.monitor.stats().total_signals, 0);
        assert_eq!(
            h.monitor.status().watermarks.get("BTC"),
            Some(&record_date)
        );
    }

    #[tokio::test]
    async fn test_records_are_never_replayed() {
        let store = MockStore::default();
        let since = Utc::now();
        store.insert("BTC", since + chrono::Duration::seconds(1), 1_500_000.0);
        store.insert("BTC", since + chrono::Duration::seconds(2), -3_000_000.0);

        let h = harness(store, MockExchange::new(50_000.0));
        h.monitor.seed_watermarks(since);

        h.monitor.run_pass_now().await;
        assert_eq!(h.exchange.orders().len(), 2);
        assert_eq!(h.monitor.stats().total_signals, 2);

        // Second pass sees nothing new: same records, watermark past them.
        h.monitor.run_pass_now().await;
        assert_eq!(h.exchange.orders().len(), 2);
        assert_eq!(h.monitor.stats().total_signals, 2);
    }

    #[tokio::test]
    async fn test_store_failure_is_isolated_per_asset() {
        let store = MockStore::default();
        let since = Utc::now();
        let eth_date = since + chrono::Duration::seconds(3);
        store.fail_asset("BTC");
        store.insert("ETH", eth_date, 2_000_000.0);

        let h = harness(store, MockExchange::new(2_500.0));
        h.monitor.seed_watermarks(since);
        h.monitor.run_pass_now().await;

        // ETH still trades and advances...
        let orders = h.exchange.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].0, "ETH-USDT");
        assert_eq!(orders[0].1, "buy");
        assert_eq!(
            h.monitor.status().watermarks.get("ETH"),
            Some(&eth_date)
        );

        // ...while BTC's watermark is untouched, so its records retry later.
        assert_eq!(h.monitor.status().watermarks.get("BTC"), Some(&since));

        // Once the store recovers, the same watermark picks the record up.
        h.store.failing.lock().unwrap().clear();
        h.store
            .insert("BTC", since + chrono::Duration::seconds(1), -1_200_000.0);
        h.monitor.run_pass_now().await;
        assert_eq!(h.exchange.orders().len(), 2);
    }

    #[tokio::test]
    async fn test_trade_failure_counts_and_still_advances() {
        let store = MockStore::default();
        let since = Utc::now();
        let record_date = since + chrono::Duration::seconds(7);
        store.insert("BTC", record_date, -2_000_000.0);

        let mut exchange = MockExchange::new(50_000.0);
        exchange.fail_orders = true;
        let h = harness(store, exchange);
        h.monitor.seed_watermarks(since);
        h.monitor.run_pass_now().await;

        let stats = h.monitor.stats();
        assert_eq!(stats.total_signals, 1);
        assert_eq!(stats.failed_trades, 1);
        assert_eq!(stats.successful_trades, 0);
        assert!(h.ledger.positions.lock().unwrap().is_empty());

        // No retry of the missed trade: the watermark moved past the record.
        assert_eq!(
            h.monitor.status().watermarks.get("BTC"),
            Some(&record_date)
        );
        h.monitor.run_pass_now().await;
        assert_eq!(h.monitor.stats().failed_trades, 1);
    }

    #[tokio::test]
    async fn test_reset_stats_keeps_run_state() {
        let store = MockStore::default();
        let since = Utc::now();
        store.insert("ETH", since + chrono::Duration::seconds(1), 5_000_000.0);

        let h = harness(store, MockExchange::new(2_500.0));
        h.monitor.seed_watermarks(since);
        h.monitor.run_pass_now().await;
        assert_eq!(h.monitor.stats().total_signals, 1);

        let watermarks = h.monitor.status().watermarks;
        h.monitor.reset_stats();

        let stats = h.monitor.stats();
        assert_eq!(stats.total_signals, 0);
        assert_eq!(stats.successful_trades, 0);
        assert!(stats.last_signal.is_none());
        assert_eq!(h.monitor.status().watermarks, watermarks);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_pass() {
        // The store stalls long enough that stop() is called mid-pass; the
        // trade from that pass must be fully recorded by the time stop()
        // returns.
        let mut store = MockStore::default();
        store.delay = Some(Duration::from_millis(200));
        let h = harness(store, MockExchange::new(50_000.0));

        h.monitor.start().await.unwrap();
        // Insert a record dated after the start-time watermark while the
        // initial pass is still sleeping in the store.
        let record_date = Utc::now() + chrono::Duration::milliseconds(50);
        h.store.insert("BTC", record_date, -2_500_000.0);

        h.monitor.stop().await;

        assert!(!h.monitor.status().is_running);
        assert_eq!(h.exchange.orders().len(), 1);
        assert_eq!(h.ledger.positions.lock().unwrap().len(), 1);
    }
}
