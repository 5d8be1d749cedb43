// Layered settings: built-in defaults, then an optional TOML file, then
// OPTFEED__SECTION__KEY environment variables.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::chain::ChainParams;
use crate::market_data::connection::RetryPolicy;

pub const DEFAULT_CONFIG_NAME: &str = "optfeed";
pub const ENV_PREFIX: &str = "OPTFEED";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub chain: ChainSettings,
    pub stream: StreamSettings,
    pub sink: SinkSettings,
    pub rates: RateSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    /// Random in 0..10 when unset.
    pub client_id: Option<i32>,
    /// No limit when unset.
    pub connect_timeout_secs: Option<u64>,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    pub max_requests_in_flight: usize,
    /// The gateway ships with a self-signed certificate.
    pub accept_invalid_certs: bool,
    /// Overrides the websocket endpoint derived from host and port.
    pub ws_url: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            client_id: None,
            connect_timeout_secs: None,
            max_attempts: 20,
            retry_backoff_secs: 3,
            max_requests_in_flight: 48,
            accept_invalid_certs: true,
            ws_url: None,
        }
    }
}

impl GatewaySettings {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/v1/api", self.host, self.port)
    }

    pub fn websocket_url(&self) -> String {
        self.ws_url
            .clone()
            .unwrap_or_else(|| format!("wss://{}:{}/v1/api/ws", self.host, self.port))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn resolve_client_id(&self) -> i32 {
        use rand::Rng;
        self.client_id.unwrap_or_else(|| rand::thread_rng().gen_range(0..10))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    pub symbol: String,
    pub index_exchange: String,
    pub option_exchange: String,
    /// Standard class first; its strikes seed the universe.
    pub trading_classes: Vec<String>,
    pub min_dte: i64,
    pub max_dte: i64,
    pub strike_distance: f64,
    pub strike_range: f64,
    pub warmup_ms: u64,
    pub warmup_attempts: u32,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            symbol: "SPX".into(),
            index_exchange: "CBOE".into(),
            option_exchange: "SMART".into(),
            trading_classes: vec!["SPX".into(), "SPXW".into()],
            min_dte: 30,
            max_dte: 250,
            strike_distance: 25.0,
            strike_range: 0.5,
            warmup_ms: 1000,
            warmup_attempts: 10,
        }
    }
}

impl ChainSettings {
    pub fn params(&self) -> ChainParams {
        ChainParams {
            symbol: self.symbol.clone(),
            index_exchange: self.index_exchange.clone(),
            option_exchange: self.option_exchange.clone(),
            trading_classes: self.trading_classes.clone(),
            min_dte: self.min_dte,
            max_dte: self.max_dte,
            strike_distance: self.strike_distance,
            strike_range: self.strike_range,
            warmup: Duration::from_millis(self.warmup_ms),
            warmup_attempts: self.warmup_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub wait_ms: u64,
    pub drop_negative_mids: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self { wait_ms: 100, drop_negative_mids: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// Directory holding one CSV file per sheet.
    pub workbook: String,
    pub feed_sheet: String,
    pub feed_anchor: String,
    pub rate_sheet: String,
    pub rate_anchor: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            workbook: "workbook".into(),
            feed_sheet: "FM_FEED".into(),
            feed_anchor: "A1".into(),
            rate_sheet: "RFRATE".into(),
            rate_anchor: "C1".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateSettings {
    pub url: String,
    pub enabled: bool,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            url: "https://www.finanzen.net/zinsen/libor/usd".into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_filter: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self { log_filter: "info".into() }
    }
}

impl Settings {
    /// An explicit path must exist; the default `optfeed.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("chain.trading_classes")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
