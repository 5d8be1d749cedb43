// Market data module entrypoint
pub mod adapters;     // gateway trait plus Client Portal and simulated venues
pub mod connection;   // connect with retry, idempotent disconnect
pub mod normaliser;   // converts wire strings -> prices
pub mod quote_book;   // latest quote per contract
