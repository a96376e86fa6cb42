// =============================================================================
// Reconciliation — align the Brain's projection with exchange truth
// =============================================================================
//
// The engine never assumes authority over exchange state. On every pass:
//
//   - Brain position, exchange flat   => the position was closed behind our
//     back (stop fill, liquidation, manual action). Book the close locally,
//     deduplicated through `known_exit_order_ids`.
//   - Sizes disagree                  => trust the exchange, update the Brain,
//     emit a discrepancy event.
//   - Exchange position, Brain flat   => adopt it so the exit manager takes
//     over, emit a discrepancy event.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::brain::persistence::BrainStore;
use crate::brain::{Brain, Side};
use crate::config::Config;
use crate::data::oracle::DataOracle;
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{Exchange, ExchangePosition};
use crate::exit::monitor::{ExitMonitor, ExitReason};
use crate::util::canon_symbol;

/// Relative size difference below which Brain and exchange are considered in
/// agreement (rounding / fee dust).
const SIZE_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub closed: usize,
    pub adjusted: usize,
    pub adopted: usize,
}

pub struct Reconciler {
    config: Config,
    brain: Brain,
    store: Arc<BrainStore>,
    oracle: Arc<DataOracle>,
    ex: Arc<dyn Exchange>,
    monitor: Arc<ExitMonitor>,
    events: EventBus,
}

impl Reconciler {
    pub fn new(
        config: Config,
        brain: Brain,
        store: Arc<BrainStore>,
        oracle: Arc<DataOracle>,
        ex: Arc<dyn Exchange>,
        monitor: Arc<ExitMonitor>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            brain,
            store,
            oracle,
            ex,
            monitor,
            events,
        }
    }

    /// One reconciliation pass.
    pub async fn reconcile_once(&self, now: f64) -> Result<ReconcileSummary> {
        let exchange_positions = self.ex.fetch_positions().await?;

        let mut ex_map: HashMap<String, ExchangePosition> = HashMap::new();
        for p in exchange_positions {
            let k = canon_symbol(&p.symbol);
            if !k.is_empty() && p.size != 0.0 {
                ex_map.insert(k, p);
            }
        }

        let mut summary = ReconcileSummary::default();
        let brain_symbols = self.brain.lock().await.position_symbols();

        for symbol in &brain_symbols {
            let Some(pos) = self.brain.lock().await.positions.get(symbol).cloned() else {
                continue;
            };

            match ex_map.get(symbol) {
                None => {
                    // Exchange is flat: the exit happened without us. Book it
                    // at the freshest price available, falling back to entry.
                    let price = {
                        let p = self.oracle.get_price(symbol, true);
                        if p > 0.0 {
                            p
                        } else {
                            pos.entry_price
                        }
                    };
                    // Synthetic exit id keyed by the position's identity so a
                    // repeated pass cannot double-book the same close.
                    let synth_id = format!("recon-{symbol}-{:.0}", pos.entry_ts);

                    warn!(
                        component = "reconcile",
                        symbol = %symbol,
                        "exchange flat but brain holds a position, booking local close"
                    );
                    self.events.publish(EngineEvent::DiscrepancyDetected {
                        symbol: symbol.clone(),
                        detail: "exchange flat, local position closed".to_string(),
                    });
                    self.monitor
                        .settle_close(symbol, price, now, ExitReason::Reconciled, Some(synth_id))
                        .await;
                    summary.closed += 1;
                }
                Some(exch) => {
                    let ex_size = exch.size.abs();
                    let rel_diff = (ex_size - pos.size).abs() / pos.size.max(f64::EPSILON);
                    if rel_diff > SIZE_TOLERANCE {
                        warn!(
                            component = "reconcile",
                            symbol = %symbol,
                            brain_size = pos.size,
                            exchange_size = ex_size,
                            "size drift, trusting exchange"
                        );
                        {
                            let mut state = self.brain.lock().await;
                            if let Some(p) = state.positions.get_mut(symbol) {
                                p.size = ex_size;
                            }
                            state.validate();
                            state.recompute_derived();
                        }
                        self.events.publish(EngineEvent::DiscrepancyDetected {
                            symbol: symbol.clone(),
                            detail: format!(
                                "size drift: brain {} vs exchange {}",
                                pos.size, ex_size
                            ),
                        });
                        summary.adjusted += 1;
                    }
                }
            }
        }

        // Positions the exchange holds that the Brain has never seen.
        for (symbol, exch) in &ex_map {
            if self.brain.lock().await.positions.contains_key(symbol) {
                continue;
            }
            let side = if exch.size > 0.0 { Side::Long } else { Side::Short };
            // ATR is unknown for an adopted position; a conservative
            // reference-volatility placeholder keeps stop math sane until
            // the next signal pass refreshes it.
            let atr = exch.entry_price * self.config.trailing_atr_reference_pct;

            warn!(
                component = "reconcile",
                symbol = %symbol,
                size = exch.size,
                "adopting unknown exchange position"
            );
            {
                let mut state = self.brain.lock().await;
                state.apply_fill(
                    symbol,
                    side,
                    exch.size.abs(),
                    exch.entry_price,
                    atr,
                    exch.leverage.max(1.0) as u32,
                    0.0,
                    now,
                );
            }
            self.events.publish(EngineEvent::DiscrepancyDetected {
                symbol: symbol.clone(),
                detail: "adopted position found on exchange".to_string(),
            });
            summary.adopted += 1;
        }

        if summary.adjusted > 0 || summary.adopted > 0 {
            let snapshot = self.brain.lock().await.clone();
            if let Err(e) = self.store.save(&snapshot, false).await {
                warn!(component = "reconcile", error = %e, "brain save after reconcile failed");
            }
        }

        if summary != ReconcileSummary::default() {
            info!(
                component = "reconcile",
                closed = summary.closed,
                adjusted = summary.adjusted,
                adopted = summary.adopted,
                "reconciliation pass applied changes"
            );
        }
        Ok(summary)
    }
}
