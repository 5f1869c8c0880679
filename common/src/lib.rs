// Execution result aggregation and bulk operation engine for the job dashboard

pub mod aggregate;
pub mod bulk;
pub mod client;
pub mod config;
pub mod errors;
pub mod filter;
pub mod live_view;
pub mod models;
pub mod polling;
pub mod rollup;
pub mod selection;
pub mod telemetry;
