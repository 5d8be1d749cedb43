use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Expirations travel as `YYYYMMDD` strings, the same form the gateway uses.
pub const EXPIRATION_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Right {
    Put,
    Call,
}

impl Right {
    pub fn code(&self) -> char {
        match self {
            Right::Put => 'P',
            Right::Call => 'C',
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s.trim() {
            "P" | "p" | "PUT" | "Put" => Some(Right::Put),
            "C" | "c" | "CALL" | "Call" => Some(Right::Call),
            _ => None,
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecType {
    Index,
    Option,
}

// Provisional contract: what we ask the gateway to qualify. No identity yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub symbol: String,
    pub sec_type: SecType,
    pub exchange: String,
    pub expiration: Option<String>,
    pub strike: Option<f64>,
    pub right: Option<Right>,
    pub trading_class: Option<String>,
}

impl ContractSpec {
    pub fn index(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: SecType::Index,
            exchange: exchange.to_string(),
            expiration: None,
            strike: None,
            right: None,
            trading_class: None,
        }
    }

    pub fn option(symbol: &str, expiration: &str, strike: f64, right: Right, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: SecType::Option,
            exchange: exchange.to_string(),
            expiration: Some(expiration.to_string()),
            strike: Some(strike),
            right: Some(right),
            trading_class: None,
        }
    }
}

/// A qualified contract. Two contracts are the same instrument iff `con_id` matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub con_id: i64,
    pub local_symbol: String,
    pub spec: ContractSpec,
}

impl Contract {
    pub fn symbol(&self) -> &str {
        &self.spec.symbol
    }

    pub fn expiration(&self) -> &str {
        self.spec.expiration.as_deref().unwrap_or("")
    }

    pub fn strike(&self) -> f64 {
        self.spec.strike.unwrap_or(f64::NAN)
    }

    pub fn right(&self) -> Option<Right> {
        self.spec.right
    }

    /// `OPTION_REF`: symbol left-aligned to six characters, then the expiration.
    pub fn option_ref(&self) -> String {
        format!("{:<6}{}", self.symbol(), self.expiration())
    }
}

/// One chain record as the gateway reports it for a trading class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub trading_class: String,
    pub exchange: String,
    pub strikes: Vec<f64>,
    pub expirations: Vec<String>,
}

/// Strikes and expirations selected for the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainSnapshot {
    pub spot: f64,
    pub strikes: Vec<f64>,
    pub expirations: Vec<String>,
}

impl ChainSnapshot {
    pub fn is_empty(&self) -> bool {
        self.strikes.is_empty() || self.expirations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub con_id: i64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub updated_ms: i64,
}

impl Quote {
    pub fn empty(con_id: i64) -> Self {
        Self { con_id, bid: None, ask: None, last: None, updated_ms: 0 }
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// Last trade if it sits inside the current bid/ask, else the mid, else the last trade.
    pub fn market_price(&self) -> Option<f64> {
        match (self.bid, self.ask, self.last) {
            (Some(bid), Some(ask), Some(last)) if bid <= last && last <= ask => Some(last),
            _ => self.mid().or(self.last),
        }
    }
}

// A partial update as it arrives from the wire; absent fields keep their old value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteUpdate {
    pub con_id: i64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub ts_ms: i64,
}

/// One line of the published feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingRow {
    pub trade_date: String,
    pub trade_time: String,
    pub underlying: String,
    pub underlying_price: Option<f64>,
    pub option_ref: String,
    pub strike: f64,
    pub call_ref: Option<String>,
    pub call_mid: Option<f64>,
    pub put_ref: String,
    pub put_mid: f64,
}

pub const PRICING_COLUMNS: [&str; 10] = [
    "TRADE_DT",
    "TRADE_TIME",
    "UNDLY",
    "UNDLY_PRICE",
    "OPTION_REF",
    "STRIKE",
    "CALL_REF",
    "CALL_MID",
    "PUT_REF",
    "PUT_MID",
];

pub fn parse_expiration(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, EXPIRATION_FORMAT).ok()
}
