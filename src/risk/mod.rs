// =============================================================================
// Risk governor — kill switch, heartbeat, distributed locking
// =============================================================================

pub mod heartbeat;
pub mod kill_switch;
pub mod lock;

pub use heartbeat::{ComponentHealth, HeartbeatMonitor};
pub use kill_switch::{ApiStats, KillSwitch, KillSwitchConfig};
pub use lock::{LockConfig, LockManager};
