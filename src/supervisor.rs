// =============================================================================
// Supervisor — single owner of task lifecycle and shutdown
// =============================================================================
//
// Every long-running loop is spawned here with the one cancellation token of
// the task tree. Graceful shutdown: cancel the token, await each task with a
// short timeout, abort stragglers, persist the Brain (forced), save the
// cache snapshot, release locks, close the exchange.
//
// The guardian loop lives here too: it beats its own heart, expires
// blacklists, records equity, drives the kill switch off the oracle's stale
// report, escalates to emergency flat, and emits status events.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::brain::persistence::BrainStore;
use crate::brain::Brain;
use crate::config::Config;
use crate::data::oracle::DataOracle;
use crate::events::{EngineEvent, EventBus, StatusSnapshot};
use crate::exchange::Exchange;
use crate::exit::ExitMonitor;
use crate::risk::kill_switch::EquityView;
use crate::risk::{ApiStats, HeartbeatMonitor, KillSwitch};
use crate::util::now_ts;

/// Per-task join timeout during shutdown.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
/// Cadence of periodic brain saves from the guardian.
const BRAIN_SAVE_INTERVAL_SEC: f64 = 60.0;

// =============================================================================
// Supervisor
// =============================================================================

pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// The root cancellation token; child tasks receive clones of it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a named task owned by this supervisor.
    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        info!(component = "supervisor", task = %name, "task spawned");
        self.tasks.push((name, tokio::spawn(fut)));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel all tasks, await each briefly, abort stragglers.
    pub async fn shutdown(mut self) {
        info!(component = "supervisor", tasks = self.tasks.len(), "shutdown started");
        self.cancel.cancel();

        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    warn!(component = "supervisor", task = %name, error = %e, "task ended abnormally");
                }
                Err(_) => {
                    warn!(component = "supervisor", task = %name, "task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!(component = "supervisor", "all tasks stopped");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Guardian loop
// =============================================================================

/// Everything the guardian tick needs a handle to.
pub struct GuardianDeps {
    pub config: Config,
    pub brain: Brain,
    pub store: Arc<BrainStore>,
    pub oracle: Arc<DataOracle>,
    pub ex: Arc<dyn Exchange>,
    pub kill: Arc<KillSwitch>,
    pub api: Arc<ApiStats>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub monitor: Arc<ExitMonitor>,
    pub events: EventBus,
}

/// The governor tick: liveness, equity, kill switch, escalation, status.
pub async fn guardian_loop(deps: GuardianDeps, cancel: CancellationToken) {
    let interval = Duration::from_secs_f64(deps.config.heartbeat_guardian_sec.max(1.0));
    let mut last_save = now_ts();

    while !cancel.is_cancelled() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        deps.heartbeat.beat("guardian");
        let now = now_ts();

        // Blacklist hygiene + uptime bookkeeping.
        {
            let mut state = deps.brain.lock().await;
            state.expire_blacklist(now);
            state.uptime_seconds = (now - state.session_start_timestamp).max(0.0);
        }

        // Equity refresh from the exchange (non-fatal on failure).
        match deps.ex.fetch_balance().await {
            Ok(balance) => {
                deps.api.record_ok();
                if balance.total_equity > 0.0 {
                    deps.brain.lock().await.record_equity(balance.total_equity, now);
                    deps.kill.record_equity(balance.total_equity, now);
                }
            }
            Err(e) => {
                deps.api.record_err();
                warn!(component = "guardian", error = %e, "balance fetch failed");
            }
        }

        // Kill-switch evaluation off the oracle's stale report.
        let (equity_view, in_positions, status) = {
            let state = deps.brain.lock().await;
            let in_positions: HashSet<String> = state.positions.keys().cloned().collect();
            (
                EquityView {
                    current_drawdown_pct: state.current_drawdown_pct,
                    daily_pnl: state.daily_pnl,
                    start_of_day_equity: state.start_of_day_equity,
                },
                in_positions,
                StatusSnapshot {
                    equity: state.current_equity,
                    peak_equity: state.peak_equity,
                    daily_pnl: state.daily_pnl,
                    win_rate: state.win_rate,
                    total_trades: state.total_trades,
                    open_positions: state.positions.len(),
                    active_symbols: deps.config.active_symbols.clone(),
                    halted: deps.kill.is_halted(now),
                    uptime_sec: now - state.session_start_timestamp,
                },
            )
        };

        let report = deps
            .oracle
            .get_stale_report(&deps.config.active_symbols, &in_positions);

        if let Some(reason) = deps
            .kill
            .evaluate(now, &report, &in_positions, &deps.api, equity_view)
        {
            deps.events
                .publish(EngineEvent::KillSwitchTripped { reason });

            if deps.config.kill_switch_emergency_flat && deps.kill.should_emergency_flat(now) {
                warn!(component = "guardian", "kill switch escalation, flattening all positions");
                deps.monitor.emergency_flat(now).await;
            }
        }

        // Heartbeat alerts for the other loops.
        let alerts = deps.heartbeat.trigger_alerts(now);
        if alerts > 0 {
            for status in deps.heartbeat.check_health(now).critical {
                deps.events.publish(EngineEvent::HeartbeatAlert {
                    component: status.name,
                    misses: status.miss_count,
                });
            }
        }

        deps.events.publish(EngineEvent::Status(status));

        // Periodic persistence.
        if now - last_save >= BRAIN_SAVE_INTERVAL_SEC {
            last_save = now;
            let snapshot = deps.brain.lock().await.clone();
            if let Err(e) = deps.store.save(&snapshot, false).await {
                warn!(component = "guardian", error = %e, "periodic brain save failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_cancels_cooperative_tasks() {
        let mut sup = Supervisor::new();
        let cancel = sup.cancel_token();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let f = flag.clone();
        sup.spawn("worker", async move {
            cancel.cancelled().await;
            f.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(sup.task_count(), 1);

        sup.shutdown().await;
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_aborts_stragglers() {
        let mut sup = Supervisor::new();
        // Ignores cancellation entirely.
        sup.spawn("stubborn", async {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });

        let start = std::time::Instant::now();
        sup.shutdown().await;
        // Did not wait for the hour-long sleep.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn multiple_tasks_all_stop() {
        let mut sup = Supervisor::new();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for i in 0..5 {
            let cancel = sup.cancel_token();
            let c = counter.clone();
            sup.spawn(format!("w{i}"), async move {
                cancel.cancelled().await;
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }

        sup.shutdown().await;
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 5);
    }
}
