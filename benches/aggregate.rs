use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use optfeed_rs::engine::aggregator::{aggregate, AggregateOptions, UnderlyingMark};
use optfeed_rs::engine::types::{Contract, ContractSpec, Quote, Right};
use optfeed_rs::market_data::quote_book::QuoteSnapshot;

// ~180 strikes x 40 expirations x 2 rights, roughly a full SPX session
fn universe() -> (Vec<Contract>, QuoteSnapshot) {
    let start = NaiveDate::from_ymd_opt(2026, 11, 20).unwrap();
    let mut contracts = Vec::new();
    let mut quotes = QuoteSnapshot::default();
    let mut id = 0;
    for week in 0..40 {
        let exp = (start + chrono::Duration::weeks(week)).format("%Y%m%d").to_string();
        for k in 0..180 {
            let strike = 2275.0 + k as f64 * 25.0;
            for right in [Right::Put, Right::Call] {
                id += 1;
                contracts.push(Contract {
                    con_id: id,
                    local_symbol: format!("SPXW  {exp}{right}{strike}"),
                    spec: ContractSpec::option("SPX", &exp, strike, right, "SMART"),
                });
                quotes.insert(id, Quote { con_id: id, bid: Some(10.0), ask: Some(10.5), last: None, updated_ms: 0 });
            }
        }
    }
    (contracts, quotes)
}

fn bench_aggregate(c: &mut Criterion) {
    let (contracts, quotes) = universe();
    let mark = UnderlyingMark { symbol: "SPX".into(), price: Some(4500.0) };
    let now = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap().and_hms_opt(15, 0, 0).unwrap();

    c.bench_function("aggregate_full_session", |b| {
        b.iter(|| {
            let rows = aggregate(&contracts, black_box(&quotes), &mark, now, AggregateOptions::default()).unwrap();
            black_box(rows)
        })
    });
}

criterion_group!(benches, bench_aggregate);
criterion_main!(benches);
