// =============================================================================
// Weights Module
// =============================================================================
//
// Dynamic per-model confidence weights:
// - Weight model and cycle transitions
// - Bounded normalization of shares
// - Durable JSON store with cross-process locking
// - Manager orchestrating cycle detection and updates
// - Read-only status snapshots

pub mod manager;
pub mod model;
pub mod normalize;
pub mod status;
pub mod store;

pub use manager::{CycleCheck, WeightsManager};
