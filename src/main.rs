mod errors;
mod config;
mod signing;
mod rate_limiter;
mod model;
mod rest_client;
mod stream_client;
mod market_store;
mod filter;
mod account;
mod order_manager;
mod position_tracker;
mod risk;
mod strategy;
mod executor;
mod paper_executor;
mod persistence;
mod notifier;
mod health;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use config::{AgentConfig, Cli};
use errors::AgentResult;
use executor::{EntryTimeoutOutcome, ExecutionBackend, Executor, ExecutorState};
use health::HealthServer;
use model::{ExitReason, OrderPurpose, OrderStatus};
use notifier::{NotifyEvent, Notifier};
use paper_executor::PaperExecutor;
use persistence::{trade_record_from_position, Persistence};
use rest_client::{dollars_to_count, RestClient};
use risk::{RiskManager, StreamVerdict};
use signing::Signer;
use strategy::StrategyEngine;
use stream_client::{StreamClient, StreamEvent};

const STREAM_QUEUE_CAPACITY: usize = 4096;
const STRATEGY_TICK: Duration = Duration::from_secs(3);
const RISK_TICK: Duration = Duration::from_secs(10);
const SNAPSHOT_TICK: Duration = Duration::from_secs(300);

/// Wraps the live and paper backends behind one concrete type. A trait
/// object would lose the paper backend's `check_fills` polling hook, which
/// the core loop needs directly — an enum keeps that access without
/// downcasting.
enum Backend {
    Live(Executor),
    Paper(Arc<PaperExecutor>),
}

#[async_trait]
impl ExecutionBackend for Backend {
    async fn submit_entry(&self, ticker: &str, price: Decimal, size: Decimal) -> AgentResult<String> {
        match self {
            Backend::Live(e) => e.submit_entry(ticker, price, size).await,
            Backend::Paper(p) => p.submit_entry(ticker, price, size).await,
        }
    }
    async fn submit_exit_pair(&self, ticker: &str, size: Decimal, sl_price: Decimal, tp_price: Decimal) -> AgentResult<(String, String)> {
        match self {
            Backend::Live(e) => e.submit_exit_pair(ticker, size, sl_price, tp_price).await,
            Backend::Paper(p) => p.submit_exit_pair(ticker, size, sl_price, tp_price).await,
        }
    }
    async fn cancel(&self, venue_id: &str) -> AgentResult<()> {
        match self {
            Backend::Live(e) => e.cancel(venue_id).await,
            Backend::Paper(p) => p.cancel(venue_id).await,
        }
    }
    async fn emergency_exit(&self, ticker: &str, size: Decimal, floor_bid: Decimal) -> AgentResult<String> {
        match self {
            Backend::Live(e) => e.emergency_exit(ticker, size, floor_bid).await,
            Backend::Paper(p) => p.emergency_exit(ticker, size, floor_bid).await,
        }
    }
}

impl Backend {
    /// The venue's open orders, for startup/reconnect reconciliation
    /// (§4.11). Paper mode has no out-of-band venue state to reconcile.
    async fn active_orders(&self) -> AgentResult<Vec<model::Order>> {
        match self {
            Backend::Live(e) => e.active_orders().await,
            Backend::Paper(_) => Ok(Vec::new()),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match AgentConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level)).init();
    log::info!("threshold-agent starting (demo={})", cfg.use_demo);

    let persistence = Persistence::connect(&cfg.database_url).await;
    persistence.migrate().await;

    let notifier = Notifier::from_config(&cfg);

    let health = HealthServer::new();
    let status = health.status_handle();
    {
        let port = cfg.health_port;
        tokio::spawn(async move {
            health.serve(port).await;
        });
    }

    let signer = if cfg.private_key_path.is_empty() {
        log::warn!("no private_key_path configured; running with an ephemeral signer for demo traffic only");
        ephemeral_signer()
    } else {
        match Signer::load(cfg.access_key_id.clone(), &cfg.private_key_path) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to load signer: {}", e);
                std::process::exit(1);
            }
        }
    };

    let rest = RestClient::new(cfg.rest_base_url.clone(), signer, cfg.read_rate, cfg.write_rate);

    let tickers = match discover_tickers(&rest, &cfg).await {
        Ok(t) => t,
        Err(e) => {
            log::error!("failed to discover market universe: {}; starting with an empty subscription set", e);
            HashSet::new()
        }
    };
    log::info!("subscribing to {} tickers", tickers.len());

    let starting_balance = match rest.get_balance().await {
        Ok(b) => b,
        Err(e) => {
            log::warn!("failed to fetch starting balance ({}); defaulting to 0", e);
            Decimal::ZERO
        }
    };

    let backend = if cfg.use_demo {
        Backend::Paper(Arc::new(PaperExecutor::new()))
    } else {
        Backend::Live(Executor::new(rest))
    };
    let paper_handle = match &backend {
        Backend::Paper(p) => Some(p.clone()),
        Backend::Live(_) => None,
    };

    let mut exec_state = ExecutorState::new(backend, starting_balance);
    let mut store = market_store::MarketStore::new();
    let mut risk = RiskManager::new();

    log::info!("reconciling venue orders before accepting signals");
    reconcile_orders(&mut exec_state, &persistence).await;

    let stream_signer = if cfg.private_key_path.is_empty() {
        Arc::new(ephemeral_signer())
    } else {
        match Signer::load(cfg.access_key_id.clone(), &cfg.private_key_path) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                log::error!("failed to load stream signer: {}", e);
                std::process::exit(1);
            }
        }
    };

    let stream = StreamClient::new(cfg.stream_url.clone(), stream_signer, tickers, Some(cfg.stream_silence_s));
    let watchdog = stream.watchdog();

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_QUEUE_CAPACITY);
    tokio::spawn(async move {
        stream.run(tx).await;
    });

    let mut strategy_interval = tokio::time::interval(STRATEGY_TICK);
    let mut risk_interval = tokio::time::interval(RISK_TICK);
    let mut snapshot_interval = tokio::time::interval(SNAPSHOT_TICK);
    let mut last_seen_date = chrono::Utc::now().date_naive();

    log::info!("entering core event loop");

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    log::error!("stream channel closed; shutting down");
                    break;
                };
                handle_stream_event(event, &mut store, &mut exec_state, &mut risk, &cfg, &notifier, &persistence, paper_handle.as_deref()).await;
            }
            _ = strategy_interval.tick() => {
                run_strategy_tick(&mut exec_state, &store, &cfg, &notifier, &persistence).await;
            }
            _ = risk_interval.tick() => {
                run_risk_tick(&mut exec_state, &mut risk, &cfg, &notifier, &persistence, watchdog.is_silent(), &mut last_seen_date).await;
            }
            _ = snapshot_interval.tick() => {
                persistence.snapshot_account(&exec_state.account).await;
                refresh_status(&status, &exec_state, &risk, !watchdog.is_silent()).await;
            }
        }
    }
}

fn ephemeral_signer() -> Signer {
    use rsa::pkcs8::EncodePrivateKey;
    let mut rng = rand::thread_rng();
    let key = rsa::RsaPrivateKey::new(&mut rng, 2048).expect("generating ephemeral key");
    let pem = key.to_pkcs8_pem(Default::default()).expect("encoding ephemeral key");
    let path = std::env::temp_dir().join(format!("threshold-agent-ephemeral-{}.pem", uuid::Uuid::new_v4()));
    std::fs::write(&path, pem.as_bytes()).expect("writing ephemeral key");
    let signer = Signer::load("ephemeral", path.to_str().unwrap()).expect("loading ephemeral key");
    std::fs::remove_file(&path).ok();
    signer
}

/// Fetches the active market universe so the stream client knows what to
/// subscribe to. Caps pagination defensively; the venue is expected to
/// return a handful of pages at most for the active-markets view.
async fn discover_tickers(rest: &RestClient, cfg: &AgentConfig) -> AgentResult<HashSet<String>> {
    let mut tickers = HashSet::new();
    let mut cursor: Option<String> = None;
    for _ in 0..10 {
        let page = rest.list_markets(cursor.as_deref()).await?;
        for market in &page.markets {
            if market.status == "active" {
                let bid = rest_client::cents_to_dollars(market.yes_bid);
                if bid >= cfg.entry_threshold.min(Decimal::new(1, 2)) {
                    tickers.insert(market.ticker.clone());
                }
            }
        }
        match page.next_cursor {
            Some(c) if !c.is_empty() => cursor = Some(c),
            _ => break,
        }
    }
    Ok(tickers)
}

/// Startup/reconnect recovery (§4.11): fetch the venue's view of open
/// orders and cancel any with no client-side record. There is no persisted
/// position loader in this crate, so every order the venue reports at
/// startup is by construction orphaned to a fresh OrderManager; the same
/// sweep runs again after each reconnect, by which point real positions
/// may be tracked and only genuine orphans get cancelled.
async fn reconcile_orders(exec_state: &mut ExecutorState<Backend>, persistence: &Persistence) {
    let orders = match exec_state.backend.active_orders().await {
        Ok(o) => o,
        Err(e) => {
            log::warn!("order reconciliation failed to fetch active orders: {}", e);
            return;
        }
    };
    let mut orphans = 0;
    for order in orders {
        let Some(venue_id) = &order.venue_id else { continue };
        if exec_state.orders.get_by_venue_id(venue_id).is_some() {
            continue;
        }
        orphans += 1;
        log::warn!("cancelling orphaned venue order {} ({})", venue_id, order.ticker);
        if let Err(e) = exec_state.backend.cancel(venue_id).await {
            log::warn!("failed to cancel orphaned order {}: {}", venue_id, e);
        }
    }
    if orphans > 0 {
        persistence.log_event("warn", &format!("cancelled {} orphaned venue orders during reconciliation", orphans)).await;
    }
}

async fn handle_stream_event(
    event: StreamEvent,
    store: &mut market_store::MarketStore,
    exec_state: &mut ExecutorState<Backend>,
    risk: &mut RiskManager,
    cfg: &AgentConfig,
    notifier: &Notifier,
    persistence: &Persistence,
    paper: Option<&PaperExecutor>,
) {
    match event {
        StreamEvent::TickerUpdate { .. } | StreamEvent::OrderBookDelta { .. } | StreamEvent::Trade { .. } => {
            if let Some(ticker) = store.apply(&event) {
                if let Some(paper) = paper {
                    for venue_id in paper.check_fills(&ticker, store) {
                        process_fill(&venue_id, None, exec_state, risk, notifier, persistence, cfg).await;
                    }
                }
                on_market_update(&ticker, store, exec_state, risk, cfg, notifier, persistence).await;
            }
        }
        StreamEvent::Fill { order_id, count, price } => {
            let _ = count;
            process_fill(&order_id, Some(price), exec_state, risk, notifier, persistence, cfg).await;
        }
        StreamEvent::OrderUpdate { order_id, status, remaining } => {
            let _ = remaining;
            if status.is_terminal() && status != OrderStatus::Filled {
                if let Some(order) = exec_state.orders.apply_status(&order_id, status) {
                    if order.purpose == OrderPurpose::Entry {
                        exec_state.account.release(order.size - order.filled_size);
                    }
                }
            }
        }
        StreamEvent::Disconnected => {
            log::warn!("stream disconnected");
            persistence.log_event("warn", "stream disconnected").await;
        }
        StreamEvent::Reconnected => {
            log::info!("stream reconnected; reconciling venue orders");
            persistence.log_event("info", "stream reconnected").await;
            reconcile_orders(exec_state, persistence).await;
            notifier.notify(NotifyEvent::StreamDisconnected { seconds: 0 }).await;
        }
    }
}

async fn on_market_update(
    ticker: &str,
    store: &market_store::MarketStore,
    exec_state: &mut ExecutorState<Backend>,
    risk: &RiskManager,
    cfg: &AgentConfig,
    notifier: &Notifier,
    persistence: &Persistence,
) {
    let Some(signal) = StrategyEngine::on_market_update(ticker, store, &exec_state.positions, &exec_state.orders, &exec_state.account, cfg) else {
        return;
    };
    log::debug!("signal generated for {}: entry={} size={}", ticker, signal.entry_price, signal.size);
    let best_ask = store.get(ticker).map(|m| m.best_ask).unwrap_or(signal.entry_price);
    let open_positions = exec_state.positions.open_positions().count();
    if let Err(reason) = risk.validate_signal(&signal, &exec_state.account, open_positions, best_ask, cfg) {
        log::debug!("signal for {} rejected by risk: {}", ticker, reason);
        persistence.log_event("debug", &format!("signal for {} rejected: {}", ticker, reason)).await;
        return;
    }
    match exec_state.handle_signal(signal.clone(), cfg).await {
        Ok(()) => {
            log::info!("entry submitted for {}: {} @ {}", ticker, signal.size, signal.entry_price);
            persistence.log_event("info", &format!("entry submitted for {} @ {}", ticker, signal.entry_price)).await;
            notifier
                .notify(NotifyEvent::PositionOpened {
                    ticker: signal.ticker.clone(),
                    entry_price: signal.entry_price.to_string(),
                    size: signal.size.to_string(),
                })
                .await;
        }
        Err(e) => log::warn!("failed to submit entry for {}: {}", ticker, e),
    }
}

async fn process_fill(
    venue_id: &str,
    fill_price: Option<Decimal>,
    exec_state: &mut ExecutorState<Backend>,
    risk: &mut RiskManager,
    notifier: &Notifier,
    persistence: &Persistence,
    cfg: &AgentConfig,
) {
    let Some(order) = exec_state.orders.get_by_venue_id(venue_id).cloned() else {
        return;
    };
    let price = fill_price.unwrap_or(order.price);
    let count = dollars_to_count(order.size - order.filled_size, price).0;
    let Some(terminal) = exec_state.orders.apply_fill(venue_id, count, price) else {
        return;
    };
    log::info!("order filled: {} {} @ {}", terminal.ticker, terminal.purpose.as_str(), price);

    match terminal.purpose {
        OrderPurpose::Entry => {
            if let Err(e) = exec_state.handle_entry_fill(terminal.client_id, price, terminal.filled_size, cfg).await {
                log::error!("failed to submit paired exits for {}: {}", terminal.ticker, e);
            }
        }
        OrderPurpose::StopLoss | OrderPurpose::TakeProfit => {
            match exec_state.handle_exit_fill(venue_id, price).await {
                Ok(true) => {
                    risk.evaluate_account_breakers(&exec_state.account, cfg);
                    if let Some(position) = exec_state.positions.get_by_ticker(&terminal.ticker) {
                        if let Some(trade) = trade_record_from_position(position) {
                            persistence.record_trade(&trade).await;
                            log::info!("position closed: {} pnl={} reason={}", trade.ticker, trade.realized_pnl, trade.exit_reason.as_str());
                            persistence
                                .log_event("info", &format!("position closed: {} pnl={} reason={}", trade.ticker, trade.realized_pnl, trade.exit_reason.as_str()))
                                .await;
                            notifier
                                .notify(NotifyEvent::PositionClosed {
                                    ticker: trade.ticker.clone(),
                                    realized_pnl: trade.realized_pnl.to_string(),
                                    reason: trade.exit_reason.as_str().to_string(),
                                })
                                .await;
                        }
                    }
                    if risk.is_tripped() {
                        let reasons = risk.active_reasons().join(",");
                        persistence.log_event("warn", &format!("breaker tripped: {}", reasons)).await;
                        notifier.notify(NotifyEvent::BreakerTripped { reason: reasons }).await;
                    }
                }
                Ok(false) => {}
                Err(e) => log::error!("failed resolving exit fill for {}: {}", terminal.ticker, e),
            }
        }
    }
}

async fn run_strategy_tick(
    exec_state: &mut ExecutorState<Backend>,
    store: &market_store::MarketStore,
    cfg: &AgentConfig,
    notifier: &Notifier,
    persistence: &Persistence,
) {
    for client_id in exec_state.expired_entries() {
        match exec_state.resolve_entry_timeout(client_id, cfg).await {
            Ok(EntryTimeoutOutcome::Discarded) => {
                log::info!("entry order {} timed out unfilled; cancelled and released reservation", client_id);
                persistence.log_event("info", &format!("entry {} timed out unfilled", client_id)).await;
            }
            Ok(EntryTimeoutOutcome::PartialFillAccepted) => {
                log::info!("entry order {} timed out partially filled; accepting fill and submitting exits", client_id);
                persistence.log_event("info", &format!("entry {} timed out partially filled", client_id)).await;
            }
            Ok(EntryTimeoutOutcome::NotFound | EntryTimeoutOutcome::AlreadyTerminal) => {}
            Err(e) => log::error!("failed resolving entry timeout for {}: {}", client_id, e),
        }
    }

    let intents = StrategyEngine::evaluate_exits(&exec_state.positions, store, cfg);
    for intent in intents {
        let position = match exec_state.positions.get(intent.position_id) {
            Some(p) => p.clone(),
            None => continue,
        };
        let current_bid = store.get(&position.ticker).map(|m| m.best_bid).unwrap_or(position.entry_price);
        if let Err(e) = exec_state.begin_strategy_exit(intent.position_id, current_bid).await {
            log::error!("strategy exit failed for {}: {}", position.ticker, e);
            continue;
        }
        let reason_str = match intent.reason {
            ExitReason::Timeout => "TIMEOUT",
            ExitReason::MarketClosed => "MARKET_CLOSED",
            _ => "EMERGENCY",
        };
        log::info!("strategy-driven exit for {}: {}", position.ticker, reason_str);
        notifier
            .notify(NotifyEvent::PositionClosed { ticker: position.ticker.clone(), realized_pnl: "pending".into(), reason: reason_str.into() })
            .await;
    }
}

async fn run_risk_tick(
    exec_state: &mut ExecutorState<Backend>,
    risk: &mut RiskManager,
    cfg: &AgentConfig,
    notifier: &Notifier,
    persistence: &Persistence,
    stream_silent: bool,
    last_seen_date: &mut chrono::NaiveDate,
) {
    let today = chrono::Utc::now().date_naive();
    if today != *last_seen_date {
        notifier
            .notify(NotifyEvent::DailySummary {
                daily_pnl: exec_state.account.daily_pnl.to_string(),
                trades: exec_state.account.daily_trades,
                wins: exec_state.account.daily_wins,
                losses: exec_state.account.daily_losses,
            })
            .await;
        risk.reset_daily_loss();
        *last_seen_date = today;
    }
    exec_state.account.maybe_reset_daily();
    risk.evaluate_account_breakers(&exec_state.account, cfg);

    if let Backend::Live(executor) = &exec_state.backend {
        let (errors, successes) = executor.error_rate();
        risk.evaluate_api_error_rate(errors, successes, cfg);
    }

    if risk.evaluate_stream(stream_silent, cfg) == StreamVerdict::ForceExit {
        log::error!("stream silent past force-exit threshold; closing all open positions");
        persistence.log_event("error", "stream silent past force-exit threshold; closing all open positions").await;
        let open_ids: Vec<_> = exec_state.positions.open_positions().map(|p| p.id).collect();
        for id in open_ids {
            if let Some(position) = exec_state.positions.get(id) {
                let bid = position.entry_price;
                let _ = exec_state.begin_strategy_exit(id, bid).await;
            }
        }
        notifier.notify(NotifyEvent::StreamDisconnected { seconds: cfg.stream_force_exit_s }).await;
    }

    if risk.is_tripped() {
        let reasons = risk.active_reasons().join(",");
        persistence.log_event("warn", &format!("breaker tripped: {}", reasons)).await;
        notifier.notify(NotifyEvent::BreakerTripped { reason: reasons }).await;
    }
}

async fn refresh_status(status: &health::SharedStatus, exec_state: &ExecutorState<Backend>, risk: &RiskManager, stream_connected: bool) {
    let mut guard = status.write().await;
    guard.current_balance = exec_state.account.current_balance;
    guard.available_balance = exec_state.account.available_balance();
    guard.open_positions = exec_state.positions.open_positions().count();
    guard.breaker_active = risk.is_tripped();
    guard.breaker_reasons = risk.active_reasons();
    guard.stream_connected = stream_connected;
}
