// =============================================================================
// Penumbra — perpetual-futures scalping engine
// =============================================================================
//
// Boot order: env + config -> instance lock -> brain resurrection -> oracle
// warm start -> market bootstrap -> task spawn (data, streams, entry, exit,
// reconcile, guardian) -> ctrl-c -> graceful shutdown with forced brain save.
//
// Fatal-only teardown: invalid config and instance-lock contention exit
// nonzero before any task is spawned. Everything after that recovers locally.
// =============================================================================

mod brain;
mod config;
mod data;
mod entry;
mod events;
mod exchange;
mod exit;
mod flow;
mod reconcile;
mod risk;
mod router;
mod slippage;
mod strategy;
mod supervisor;
mod util;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::brain::persistence::BrainStore;
use crate::brain::state::CORE_VERSION;
use crate::brain::{new_brain, BrainState};
use crate::config::Config;
use crate::data::oracle::{DataOracle, Timeframe};
use crate::data::stream::{StreamConfig, StreamKind, StreamManager};
use crate::data::poll;
use crate::entry::EntryEngine;
use crate::events::EventBus;
use crate::exchange::{BinanceFutures, Exchange};
use crate::exit::ExitMonitor;
use crate::flow::{FlowConfig, OrderFlowAnalyzer};
use crate::reconcile::Reconciler;
use crate::risk::{ApiStats, HeartbeatMonitor, KillSwitch, KillSwitchConfig, LockConfig, LockManager};
use crate::router::OrderRouter;
use crate::strategy::MlFilter;
use crate::supervisor::{guardian_loop, GuardianDeps, Supervisor};
use crate::util::now_ts;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("penumbra engine starting");

    // ── 2. Configuration (env > file > defaults), fatal on invalid ───────
    let config = Config::resolve("penumbra.json")?;

    // ── 3. Instance lock, fatal on contention ────────────────────────────
    let lock_config = LockConfig {
        enabled: config.lock_enabled,
        backend: config.lock_backend.clone(),
        path: Config::expand_path(&config.lock_path),
        redis_url: config.lock_redis_url.clone(),
        timeout_sec: config.lock_timeout_sec,
        stale_lock_sec: config.stale_lock_sec,
    };
    let locks = Arc::new(LockManager::from_config(&lock_config));
    if !locks.acquire_instance_lock().await {
        error!("another instance holds the lock, refusing to start");
        std::process::exit(1);
    }

    // Per-symbol locks: drop symbols another instance is already trading.
    let mut config = config;
    {
        let mut symbols = Vec::new();
        for symbol in &config.active_symbols {
            if locks.acquire_symbol_lock(symbol).await {
                symbols.push(symbol.clone());
            } else {
                warn!(symbol = %symbol, "symbol locked by another instance, skipping");
            }
        }
        if symbols.is_empty() {
            error!("no tradable symbols after lock acquisition, exiting");
            std::process::exit(1);
        }
        config.active_symbols = symbols;
    }

    // ── 4. Brain resurrection ────────────────────────────────────────────
    let store = Arc::new(BrainStore::new(Config::expand_path(&config.brain_path)));
    let state = match store.load(CORE_VERSION).await {
        Ok(Some(state)) => state,
        Ok(None) => BrainState::new(),
        Err(e) => {
            warn!(error = %e, "brain load failed, starting fresh");
            BrainState::new()
        }
    };
    info!(
        positions = state.positions.len(),
        total_trades = state.total_trades,
        equity = state.current_equity,
        "brain state ready"
    );
    let brain = new_brain(state);

    // ── 5. Exchange adapter & oracle ─────────────────────────────────────
    let api_key = std::env::var("PENUMBRA_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("PENUMBRA_API_SECRET").unwrap_or_default();
    let ex: Arc<dyn Exchange> = Arc::new(BinanceFutures::new(api_key, api_secret));

    let oracle = Arc::new(DataOracle::new());
    let cache_path = Config::expand_path(&config.cache_path);
    if config.cache_warm_start {
        match oracle.load_snapshot(&cache_path) {
            Ok(true) => info!("oracle warm-started from cache snapshot"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "cache snapshot load failed"),
        }
    }
    match ex.load_markets().await {
        Ok(markets) => oracle.bootstrap_markets(&markets),
        Err(e) => warn!(error = %e, "market bootstrap failed, raw symbols fall back to keys"),
    }

    // ── 6. Shared services ───────────────────────────────────────────────
    let api = Arc::new(ApiStats::new());
    let events = EventBus::new();
    let boot_ts = now_ts();

    let kill = Arc::new(KillSwitch::new(
        KillSwitchConfig {
            enabled: config.kill_switch_enabled,
            cooldown_sec: config.kill_switch_cooldown_sec,
            boot_grace_sec: config.kill_data_boot_grace_sec,
            max_api_error_rate: config.kill_max_api_error_rate,
            max_api_error_burst: config.kill_max_api_error_burst,
            min_req_window: config.kill_min_req_window,
            session_peak_protection_pct: config.session_equity_peak_protection_pct,
            velocity_drawdown_pct: config.velocity_drawdown_pct,
            velocity_minutes: config.velocity_minutes,
            max_daily_loss_pct: config.max_daily_loss_pct,
            emergency_flat: config.kill_switch_emergency_flat,
            escalate_flat_after_trips: config.kill_escalate_flat_after_trips,
            escalate_window_sec: config.kill_escalate_window_sec,
            trip_history_max: config.kill_switch_trip_history_max,
        },
        boot_ts,
    ));

    let heartbeat = Arc::new(HeartbeatMonitor::new(config.heartbeat_alert_after_miss));
    heartbeat.register_component("guardian", config.heartbeat_guardian_sec);
    heartbeat.register_component("data_loop", config.heartbeat_data_loop_sec);
    heartbeat.register_component("entry_loop", config.heartbeat_entry_loop_sec);
    heartbeat.register_component("signal_loop", config.heartbeat_signal_loop_sec);

    let flow = Arc::new(OrderFlowAnalyzer::new(FlowConfig {
        depth_levels: config.flow_depth_levels,
        imbalance_threshold: config.flow_imbalance_threshold,
        large_order_threshold_usdt: config.flow_large_order_threshold_usdt,
        absorption_threshold: config.flow_absorption_threshold,
        stale_threshold_sec: config.flow_stale_threshold_sec,
    }));

    let ml = if config.ml_enabled {
        let model_path = if config.ml_model_path.is_empty() {
            Config::expand_path("~/.penumbra.model.json")
        } else {
            Config::expand_path(&config.ml_model_path)
        };
        Some(Arc::new(MlFilter::new(
            config.ml_min_samples_for_training,
            config.ml_retrain_interval,
            Some(model_path),
        )))
    } else {
        None
    };

    let router = Arc::new(OrderRouter::new(
        ex.clone(),
        api.clone(),
        config.order_retry_sleep_sec,
    ));

    let monitor = Arc::new(ExitMonitor::new(
        config.clone(),
        brain.clone(),
        store.clone(),
        oracle.clone(),
        router.clone(),
        events.clone(),
        ml.clone(),
    ));

    let entry_engine = Arc::new(EntryEngine::new(
        config.clone(),
        brain.clone(),
        store.clone(),
        oracle.clone(),
        flow.clone(),
        ml.clone(),
        router.clone(),
        ex.clone(),
        kill.clone(),
        events.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        config.clone(),
        brain.clone(),
        store.clone(),
        oracle.clone(),
        ex.clone(),
        monitor.clone(),
        events.clone(),
    ));

    // ── 7. Spawn the task tree ───────────────────────────────────────────
    let symbols = config.active_symbols.clone();
    let mut sup = Supervisor::new();

    for symbol in &symbols {
        sup.spawn(
            format!("ticker:{symbol}"),
            poll::poll_ticker_loop(
                ex.clone(),
                oracle.clone(),
                brain.clone(),
                api.clone(),
                heartbeat.clone(),
                sup.cancel_token(),
                symbol.clone(),
            ),
        );
        for tf in Timeframe::ALL {
            sup.spawn(
                format!("ohlcv:{symbol}:{tf}"),
                poll::poll_ohlcv_loop(
                    ex.clone(),
                    oracle.clone(),
                    brain.clone(),
                    api.clone(),
                    heartbeat.clone(),
                    sup.cancel_token(),
                    symbol.clone(),
                    tf,
                ),
            );
        }
    }

    if config.ws_enabled {
        let stream_mgr = Arc::new(StreamManager::new(
            StreamConfig {
                reconnect_delay_sec: config.ws_reconnect_delay_sec,
                reconnect_max_delay_sec: config.ws_reconnect_max_delay_sec,
                reconnect_backoff_mult: config.ws_reconnect_backoff_mult,
                stale_threshold_sec: config.ws_stale_threshold_sec,
            },
            oracle.clone(),
            flow.clone(),
        ));
        for symbol in &symbols {
            for kind in [
                StreamKind::Ticker,
                StreamKind::Kline,
                StreamKind::Depth,
                StreamKind::Trades,
            ] {
                sup.spawn(
                    format!("stream:{kind:?}:{symbol}"),
                    StreamManager::run_stream(
                        stream_mgr.clone(),
                        sup.cancel_token(),
                        kind,
                        symbol.clone(),
                    ),
                );
            }
        }
        info!(symbols = symbols.len(), "websocket streams launched");
    }

    // Strategy + entry loop.
    {
        let engine = entry_engine.clone();
        let hb = heartbeat.clone();
        let cancel = sup.cancel_token();
        let poll_sec = config.entry_poll_sec.max(0.2);
        sup.spawn("entry_loop", async move {
            while !cancel.is_cancelled() {
                hb.beat("signal_loop");
                hb.beat("entry_loop");
                engine.tick().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(poll_sec)) => {}
                }
            }
        });
    }

    // Exit monitor loop.
    {
        let mon = monitor.clone();
        let cancel = sup.cancel_token();
        let poll_sec = config.exit_poll_sec.max(1.0);
        sup.spawn("exit_loop", async move {
            while !cancel.is_cancelled() {
                mon.tick().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(poll_sec)) => {}
                }
            }
        });
    }

    // Reconciliation loop.
    {
        let recon = reconciler.clone();
        let cancel = sup.cancel_token();
        let interval = config.reconcile_interval_sec.max(5.0);
        sup.spawn("reconcile_loop", async move {
            while !cancel.is_cancelled() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {}
                }
                if let Err(e) = recon.reconcile_once(now_ts()).await {
                    warn!(component = "reconcile", error = %e, "reconciliation pass failed");
                }
            }
        });
    }

    // Guardian.
    sup.spawn(
        "guardian",
        guardian_loop(
            GuardianDeps {
                config: config.clone(),
                brain: brain.clone(),
                store: store.clone(),
                oracle: oracle.clone(),
                ex: ex.clone(),
                kill: kill.clone(),
                api: api.clone(),
                heartbeat: heartbeat.clone(),
                monitor: monitor.clone(),
                events: events.clone(),
            },
            sup.cancel_token(),
        ),
    );

    info!(
        symbols = ?symbols,
        tasks = sup.task_count(),
        "all subsystems running, ctrl-c to stop"
    );

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    sup.shutdown().await;

    let snapshot = brain.lock().await.clone();
    if let Err(e) = store.save(&snapshot, true).await {
        error!(error = %e, "final brain save failed");
    }
    if let Err(e) = oracle.save_snapshot(&cache_path) {
        warn!(error = %e, "cache snapshot save failed");
    }
    locks.release_all().await;
    if let Err(e) = ex.close().await {
        warn!(error = %e, "exchange close failed");
    }

    info!("penumbra engine stopped");
    Ok(())
}
