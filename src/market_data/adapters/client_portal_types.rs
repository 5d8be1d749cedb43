// Wire types for the IBKR Client Portal Web API (REST under /v1/api, quotes on /v1/api/ws)

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::engine::types::{parse_expiration, QuoteUpdate, Right};
use crate::market_data::normaliser::Normaliser;

pub const FIELD_LAST: &str = "31";
pub const FIELD_BID: &str = "84";
pub const FIELD_ASK: &str = "86";

// GET /iserver/auth/status
#[derive(Debug, Deserialize)]
pub struct AuthStatus {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub competing: bool,
}

// GET /tickle
#[derive(Debug, Deserialize)]
pub struct Tickle {
    #[serde(default)]
    pub session: String,
}

// GET /iserver/secdef/search?symbol=SPX&secType=IND
#[derive(Debug, Deserialize)]
pub struct SecDefSearchEntry {
    #[serde(deserialize_with = "de_i64")]
    pub conid: i64,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(rename = "companyHeader", default)]
    pub company_header: Option<String>,
    #[serde(default)]
    pub sections: Vec<SecDefSection>,
}

#[derive(Debug, Deserialize)]
pub struct SecDefSection {
    #[serde(rename = "secType")]
    pub sec_type: String,
    /// e.g. "OCT26;NOV26;DEC26"
    #[serde(default)]
    pub months: Option<String>,
    /// e.g. "SMART;CBOE"
    #[serde(default)]
    pub exchange: Option<String>,
}

impl SecDefSearchEntry {
    /// Option months listed for this underlying, in gateway order.
    pub fn option_months(&self) -> Vec<String> {
        self.sections
            .iter()
            .filter(|s| s.sec_type == "OPT")
            .filter_map(|s| s.months.as_deref())
            .flat_map(|m| m.split(';'))
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// GET /iserver/secdef/strikes?conid=..&sectype=OPT&month=OCT26
#[derive(Debug, Default, Deserialize)]
pub struct StrikesResponse {
    #[serde(default)]
    pub call: Vec<f64>,
    #[serde(default)]
    pub put: Vec<f64>,
}

impl StrikesResponse {
    pub fn all(&self) -> Vec<f64> {
        let mut strikes: Vec<f64> = self.call.iter().chain(self.put.iter()).copied().collect();
        strikes.sort_by(f64::total_cmp);
        strikes.dedup();
        strikes
    }
}

// GET /iserver/secdef/info?conid=..&sectype=OPT&month=..&strike=..&right=C
#[derive(Debug, Clone, Deserialize)]
pub struct SecDefInfo {
    #[serde(deserialize_with = "de_i64")]
    pub conid: i64,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub right: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub strike: Option<f64>,
    #[serde(rename = "maturityDate", default)]
    pub maturity_date: Option<String>,
    #[serde(rename = "tradingClass", default)]
    pub trading_class: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
}

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => n.as_i64().ok_or_else(|| serde::de::Error::custom("conid out of range")),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("unexpected conid {other}"))),
    }
}

fn de_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// "20261218" -> "DEC26", the month code the secdef endpoints expect.
pub fn month_code(expiration: &str) -> Option<String> {
    parse_expiration(expiration).map(|d| d.format("%b%y").to_string().to_uppercase())
}

/// OCC-style local symbol, e.g. `SPXW  261218P04500000`.
pub fn occ_local_symbol(trading_class: &str, expiration: NaiveDate, right: Right, strike: f64) -> String {
    format!(
        "{:<6}{}{}{:08}",
        trading_class,
        expiration.format("%y%m%d"),
        right.code(),
        (strike * 1000.0).round() as i64
    )
}

pub fn smd_subscribe(con_id: i64) -> String {
    format!(
        "smd+{}+{{\"fields\":[\"{}\",\"{}\",\"{}\"]}}",
        con_id, FIELD_LAST, FIELD_BID, FIELD_ASK
    )
}

pub fn smd_unsubscribe(con_id: i64) -> String {
    format!("umd+{}+{{}}", con_id)
}

/// Parse one websocket frame. Anything that is not a market-data update is `None`.
pub fn parse_market_data(text: &str, normaliser: &Normaliser) -> Option<QuoteUpdate> {
    let msg: Value = serde_json::from_str(text).ok()?;
    let topic = msg.get("topic")?.as_str()?;
    if !topic.starts_with("smd+") {
        return None;
    }

    let con_id = msg
        .get("conid")
        .and_then(Value::as_i64)
        .or_else(|| topic.trim_start_matches("smd+").parse().ok())?;

    let update = QuoteUpdate {
        con_id,
        bid: normaliser.price_field(msg.get(FIELD_BID)),
        ask: normaliser.price_field(msg.get(FIELD_ASK)),
        last: normaliser.price_field(msg.get(FIELD_LAST)),
        ts_ms: msg.get("_updated").and_then(Value::as_i64).unwrap_or(0),
    };

    if update.bid.is_none() && update.ask.is_none() && update.last.is_none() {
        return None;
    }
    Some(update)
}
