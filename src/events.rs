// =============================================================================
// Event bus — the engine's outward channel
// =============================================================================
//
// Surrounding surfaces (UI bridge, notifiers) subscribe here; the core only
// produces. A lagging subscriber drops old events, never blocks the engine.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;

use crate::brain::Side;

const EVENT_BUS_CAPACITY: usize = 256;

/// Read-only status snapshot for outside consumers.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusSnapshot {
    pub equity: f64,
    pub peak_equity: f64,
    pub daily_pnl: f64,
    pub win_rate: f64,
    pub total_trades: u64,
    pub open_positions: usize,
    pub active_symbols: Vec<String>,
    pub halted: bool,
    pub uptime_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    EntryFilled {
        symbol: String,
        side: Side,
        size: f64,
        price: f64,
        confidence: f64,
    },
    PositionClosed {
        symbol: String,
        reason: String,
        pnl: f64,
    },
    BreakevenMoved {
        symbol: String,
        stop_price: f64,
    },
    TrailingUpdated {
        symbol: String,
        stop_price: f64,
    },
    Blacklisted {
        symbol: String,
        reason: String,
        until_ts: f64,
    },
    KillSwitchTripped {
        reason: String,
    },
    EmergencyFlat {
        positions: usize,
    },
    HeartbeatAlert {
        component: String,
        misses: u32,
    },
    DiscrepancyDetected {
        symbol: String,
        detail: String,
    },
    Status(StatusSnapshot),
}

/// Broadcast fan-out of engine events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::KillSwitchTripped {
            reason: "test".to_string(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::KillSwitchTripped { reason } => assert_eq!(reason, "test"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::EmergencyFlat { positions: 0 });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&EngineEvent::Blacklisted {
            symbol: "BTCUSDT".to_string(),
            reason: "3 consecutive losses".to_string(),
            until_ts: 42.0,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"blacklisted\""));
        assert!(json.contains("BTCUSDT"));
    }
}
