// Shared trait + errors for market-data gateways

use std::time::Duration;

use thiserror::Error;

use crate::engine::types::{ChainDefinition, Contract, ContractSpec};
use crate::market_data::quote_book::QuoteBook;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Nothing is listening yet. The only failure the connection layer retries.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("gateway session is not authenticated")]
    NotAuthenticated,

    #[error("not connected to the gateway")]
    NotConnected,

    #[error("http error: {0}")]
    Http(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("unexpected gateway payload: {0}")]
    Decode(String),

    #[error("no instrument found for {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            GatewayError::ConnectionRefused(e.to_string())
        } else if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Http(e.to_string())
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Everything the pipeline needs from a brokerage market-data gateway.
///
/// Quotes are delivered asynchronously into the gateway's own `QuoteBook`;
/// callers only ever read it.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    async fn connect(&self, client_id: i32, timeout: Option<Duration>) -> GatewayResult<()>;

    fn is_connected(&self) -> bool;

    /// Tear down subscriptions and the session. Safe to call more than once.
    async fn disconnect(&self);

    /// Qualify the underlying index and subscribe to its quote.
    async fn resolve_underlying(&self, spec: &ContractSpec) -> GatewayResult<Contract>;

    /// Option chains of `underlying` as listed on `exchange`.
    async fn chain_definitions(&self, underlying: &Contract, exchange: &str) -> GatewayResult<Vec<ChainDefinition>>;

    /// Returns only the specs the gateway could resolve, in input order.
    async fn qualify_contracts(&self, specs: &[ContractSpec]) -> GatewayResult<Vec<Contract>>;

    /// Returns the number of new subscriptions opened.
    async fn subscribe_quotes(&self, contracts: &[Contract]) -> GatewayResult<usize>;

    fn quotes(&self) -> QuoteBook;
}

pub mod client_portal;
pub mod client_portal_types;
pub mod simulated;
