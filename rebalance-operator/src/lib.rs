pub mod allocator;
pub mod config;
pub mod coordinator;
pub mod cruise_control;
pub mod error;
pub mod health;
pub mod id_range;
pub mod metrics_consts;
pub mod operator;
pub mod rebalance;
pub mod reconciler;
pub mod store;
pub mod test_utils;
pub mod types;
