use std::cmp::Ordering;
use std::collections::BTreeMap;

use ahash::AHashMap;
use chrono::NaiveDateTime;
use ordered_float::OrderedFloat;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::engine::types::{Contract, PricingRow, Right};
use crate::market_data::quote_book::QuoteSnapshot;

pub const TRADE_DATE_FORMAT: &str = "%Y%m%d";
pub const TRADE_TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("quote for con_id {con_id} does not belong to the universe")]
    UnknownContract { con_id: i64 },
}

pub type AggregateResult<T> = Result<T, AggregateError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateOptions {
    /// Keep only rows whose put and call mids are both present and non-negative. Off unless configured.
    pub drop_negative_mids: bool,
}

/// Underlying columns attached to every row.
#[derive(Debug, Clone, PartialEq)]
pub struct UnderlyingMark {
    pub symbol: String,
    pub price: Option<f64>,
}

struct Leg<'a> {
    contract: &'a Contract,
    mid: f64,
}

/// Turn one snapshot of option quotes into the put-side left join.
///
/// The underlying's own quote must already be removed from `quotes`.
#[instrument(level = "debug", skip_all, fields(quotes = quotes.len()))]
pub fn aggregate(
    universe: &[Contract],
    quotes: &QuoteSnapshot,
    underlying: &UnderlyingMark,
    now: NaiveDateTime,
    options: AggregateOptions,
) -> AggregateResult<Vec<PricingRow>> {
    let by_id: AHashMap<i64, &Contract> = universe.iter().map(|c| (c.con_id, c)).collect();

    let mut puts: Vec<Leg> = Vec::new();
    let mut calls: BTreeMap<(String, OrderedFloat<f64>), Vec<Leg>> = BTreeMap::new();

    for (con_id, quote) in quotes {
        let contract = *by_id
            .get(con_id)
            .ok_or(AggregateError::UnknownContract { con_id: *con_id })?;
        let Some(mid) = quote.mid() else {
            trace!(con_id, "no two-sided quote");
            continue;
        };
        let leg = Leg { contract, mid };
        match contract.right() {
            Some(Right::Put) => puts.push(leg),
            Some(Right::Call) => calls
                .entry((contract.option_ref(), OrderedFloat(contract.strike())))
                .or_default()
                .push(leg),
            None => {}
        }
    }

    let trade_date = now.format(TRADE_DATE_FORMAT).to_string();
    let trade_time = now.format(TRADE_TIME_FORMAT).to_string();
    let row = |put: &Leg, call: Option<&Leg>| PricingRow {
        trade_date: trade_date.clone(),
        trade_time: trade_time.clone(),
        underlying: underlying.symbol.clone(),
        underlying_price: underlying.price,
        option_ref: put.contract.option_ref(),
        strike: put.contract.strike(),
        call_ref: call.map(|c| c.contract.local_symbol.clone()),
        call_mid: call.map(|c| c.mid),
        put_ref: put.contract.local_symbol.clone(),
        put_mid: put.mid,
    };

    let mut rows = Vec::with_capacity(puts.len());
    for put in &puts {
        match calls.get(&(put.contract.option_ref(), OrderedFloat(put.contract.strike()))) {
            Some(matches) => rows.extend(matches.iter().map(|call| row(put, Some(call)))),
            None => rows.push(row(put, None)),
        }
    }

    if options.drop_negative_mids {
        rows.retain(|r| r.put_mid >= 0.0 && matches!(r.call_mid, Some(mid) if mid >= 0.0));
    }

    sort_rows(&mut rows);
    Ok(rows)
}

fn row_order(a: &PricingRow, b: &PricingRow) -> Ordering {
    (&a.trade_date, &a.trade_time, &a.option_ref)
        .cmp(&(&b.trade_date, &b.trade_time, &b.option_ref))
        .then_with(|| a.strike.total_cmp(&b.strike))
        .then_with(|| a.put_ref.cmp(&b.put_ref))
        .then_with(|| a.call_ref.cmp(&b.call_ref))
}

/// Descending by date, time, option ref, strike; ties by put then call reference.
pub fn sort_rows(rows: &mut [PricingRow]) {
    rows.sort_by(|a, b| row_order(b, a));
}
