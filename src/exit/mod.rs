// =============================================================================
// Exit management — breakeven, trailing, time exits, TP ladder
// =============================================================================

pub mod monitor;
pub mod time_exit;
pub mod trailing;

pub use monitor::ExitMonitor;
