pub mod config;
pub mod engine;
pub mod market_data;
pub mod rates;
pub mod sink;
pub mod telemetry;
