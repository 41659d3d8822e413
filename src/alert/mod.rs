//! Tier classification, debounced zone updates and the alert lifecycle.
//!
//! Submodules:
//! - `thresholds`: score to tier, and the zone classifier with its debounce
//!   window.
//! - `manager`: per-region alert state machine and event dispatch.
//! - `stalenesses`: flags zones whose score has not been refreshed.

pub mod manager;
pub mod stalenesses;
pub mod thresholds;
