// =============================================================================
// Heartbeat Monitor — component liveness through periodic beats
// =============================================================================
//
// Components register with an expected beat interval and call `beat(name)`
// at the top of every loop iteration. A component is stale once its age
// exceeds 1.5x the expected interval; after `alert_after_miss` missed
// periods it is critical and alert callbacks fire (with optional recovery).
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::util::now_ts;

/// Grace multiplier before a component counts as stale.
const STALE_GRACE_MULT: f64 = 1.5;

type AlertCallback = Box<dyn Fn(&str, &ComponentHealth) + Send + Sync>;
type RecoveryCallback = Box<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Default)]
pub struct ComponentHealth {
    pub name: String,
    pub expected_interval_sec: f64,
    pub last_beat_ts: f64,
    pub beat_count: u64,
    pub miss_count: u32,
    pub is_stale: bool,
    pub recovery_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct HealthReport {
    pub ts: f64,
    pub healthy: Vec<ComponentHealth>,
    pub stale: Vec<ComponentHealth>,
    pub critical: Vec<ComponentHealth>,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct HeartbeatMonitor {
    alert_after_miss: u32,
    components: Mutex<HashMap<String, ComponentHealth>>,
    alert_callbacks: Mutex<Vec<AlertCallback>>,
    recovery_callbacks: Mutex<HashMap<String, RecoveryCallback>>,
}

impl HeartbeatMonitor {
    pub fn new(alert_after_miss: u32) -> Self {
        Self {
            alert_after_miss: alert_after_miss.max(1),
            components: Mutex::new(HashMap::new()),
            alert_callbacks: Mutex::new(Vec::new()),
            recovery_callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_component(&self, name: &str, expected_interval_sec: f64) {
        self.components.lock().insert(
            name.to_string(),
            ComponentHealth {
                name: name.to_string(),
                expected_interval_sec: expected_interval_sec.max(0.1),
                ..ComponentHealth::default()
            },
        );
        info!(
            component = "heartbeat",
            name,
            interval_sec = expected_interval_sec,
            "component registered"
        );
    }

    pub fn register_alert_callback(&self, cb: AlertCallback) {
        self.alert_callbacks.lock().push(cb);
    }

    pub fn register_recovery_callback(&self, name: &str, cb: RecoveryCallback) {
        self.recovery_callbacks.lock().insert(name.to_string(), cb);
    }

    /// Record a beat. Unregistered names auto-register with a 60s interval.
    pub fn beat(&self, name: &str) {
        self.beat_at(name, now_ts());
    }

    /// Beat with an explicit timestamp (tests drive time directly).
    pub fn beat_at(&self, name: &str, now: f64) {
        let mut components = self.components.lock();
        let health = components.entry(name.to_string()).or_insert_with(|| {
            ComponentHealth {
                name: name.to_string(),
                expected_interval_sec: 60.0,
                ..ComponentHealth::default()
            }
        });

        health.last_beat_ts = now;
        health.beat_count += 1;
        if health.is_stale {
            info!(
                component = "heartbeat",
                name,
                misses = health.miss_count,
                "component recovered"
            );
            health.is_stale = false;
            health.miss_count = 0;
        }
    }

    pub fn component_age(&self, name: &str, now: f64) -> f64 {
        match self.components.lock().get(name) {
            Some(h) if h.last_beat_ts > 0.0 => now - h.last_beat_ts,
            _ => f64::INFINITY,
        }
    }

    pub fn is_component_stale(&self, name: &str, now: f64) -> bool {
        let components = self.components.lock();
        match components.get(name) {
            Some(h) => {
                let age = if h.last_beat_ts > 0.0 {
                    now - h.last_beat_ts
                } else {
                    f64::INFINITY
                };
                age > h.expected_interval_sec * STALE_GRACE_MULT
            }
            None => false,
        }
    }

    /// Classify every component as healthy / stale / critical.
    pub fn check_health(&self, now: f64) -> HealthReport {
        let mut report = HealthReport {
            ts: now,
            ..HealthReport::default()
        };

        let mut components = self.components.lock();
        for health in components.values_mut() {
            let age = if health.last_beat_ts > 0.0 {
                now - health.last_beat_ts
            } else {
                f64::INFINITY
            };
            let grace = health.expected_interval_sec * STALE_GRACE_MULT;

            if age <= grace {
                report.healthy.push(health.clone());
                continue;
            }

            health.is_stale = true;
            health.miss_count = if health.expected_interval_sec > 0.0 && age.is_finite() {
                (age / health.expected_interval_sec) as u32
            } else {
                self.alert_after_miss
            };

            if health.miss_count >= self.alert_after_miss {
                report.critical.push(health.clone());
            } else {
                report.stale.push(health.clone());
            }
        }
        report
    }

    /// Fire alert (and recovery) callbacks for critical components. Returns
    /// the number of alerts raised.
    pub fn trigger_alerts(&self, now: f64) -> usize {
        let report = self.check_health(now);
        let mut alerts = 0;

        for status in &report.critical {
            warn!(
                component = "heartbeat",
                name = %status.name,
                misses = status.miss_count,
                "component is critical"
            );

            for cb in self.alert_callbacks.lock().iter() {
                cb(&status.name, status);
                alerts += 1;
            }

            if let Some(recover) = self.recovery_callbacks.lock().get(&status.name) {
                if let Some(health) = self.components.lock().get_mut(&status.name) {
                    health.recovery_attempts += 1;
                }
                error!(
                    component = "heartbeat",
                    name = %status.name,
                    "attempting component recovery"
                );
                recover();
            }
        }
        alerts
    }
}
