//! Flood risk scoring and alerting for monitored regions.
//!
//! Spatial features (elevation, distance to water, recent rainfall) are
//! resolved per location, combined into a normalized risk score, classified
//! into tiers with debounce, and turned into alert lifecycle events.

pub mod alert;
pub mod analysis;
pub mod config;
pub mod db;
pub mod engine;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod regions;
pub mod store;
