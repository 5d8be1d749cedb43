// Engine: universe construction, per-tick aggregation and the publish loop
pub mod aggregator;   // quotes -> pricing rows
pub mod chain;        // option universe for one session
pub mod shutdown;     // cancellation token
pub mod stream;       // timed publish loop
pub mod types;
