/**
 * CARBON KERNEL - Continuous carbon estimation for compute instances
 *
 * PIPELINE :
 * sources -> scheduler -> bus(MetricsCollected) -> calculator
 *         -> bus(EmissionsCalculated) -> exporters (log, prometheus, mqtt -> plugins)
 */

pub mod bus;
pub mod cache;
pub mod calculator;
pub mod config;
pub mod exporter;
pub mod factors;
pub mod health;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod plugins;
pub mod scheduler;
pub mod source;
pub mod state;
