// =============================================================================
// Brain — authoritative state + crash-safe persistence
// =============================================================================

pub mod persistence;
pub mod state;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use persistence::BrainStore;
pub use state::{BrainState, Position, Side};

/// Shared handle to the one authoritative state instance. All mutations
/// serialize through this mutex; readers clone a snapshot under it.
pub type Brain = Arc<Mutex<BrainState>>;

/// Wrap a freshly constructed (or loaded) state into the shared handle.
pub fn new_brain(state: BrainState) -> Brain {
    Arc::new(Mutex::new(state))
}
