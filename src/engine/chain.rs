use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, NaiveTime};
use itertools::iproduct;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::engine::shutdown::Shutdown;
use crate::engine::types::{parse_expiration, ChainDefinition, ChainSnapshot, Contract, ContractSpec, Right};
use crate::market_data::adapters::{Gateway, GatewayError, GatewayResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ChainParams {
    pub symbol: String,
    pub index_exchange: String,
    pub option_exchange: String,
    pub trading_classes: Vec<String>,
    pub min_dte: i64,
    pub max_dte: i64,
    pub strike_distance: f64,
    pub strike_range: f64,
    pub warmup: Duration,
    pub warmup_attempts: u32,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("no quote for underlying {symbol} after {attempts} attempts")]
    NoUnderlyingQuote { symbol: String, attempts: u32 },
    #[error("trading class {class} not listed on {exchange}")]
    MissingTradingClass { class: String, exchange: String },
    #[error("chain build cancelled")]
    Cancelled,
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Everything the session streams: qualified options ordered by `con_id`.
#[derive(Debug, Clone)]
pub struct Universe {
    pub underlying: Contract,
    pub contracts: Vec<Contract>,
    pub snapshot: ChainSnapshot,
    pub subscriptions: usize,
}

impl Universe {
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

/// Whole days from `now` to the expiration's midnight, rounded down.
pub fn days_to_expiry(expiration: &str, now: NaiveDateTime) -> Option<i64> {
    let midnight = parse_expiration(expiration)?.and_time(NaiveTime::MIN);
    Some((midnight - now).num_seconds().div_euclid(86_400))
}

/// Per-class sorted lists, concatenated in class order, DTE strictly inside `(min_dte, max_dte)`.
pub fn select_expirations(
    classes: &[&ChainDefinition],
    now: NaiveDateTime,
    min_dte: i64,
    max_dte: i64,
) -> Vec<String> {
    classes
        .iter()
        .flat_map(|def| {
            let mut sorted = def.expirations.clone();
            sorted.sort();
            sorted
        })
        .filter(|exp| matches!(days_to_expiry(exp, now), Some(d) if d > min_dte && d < max_dte))
        .collect()
}

/// Strikes on the `distance` grid inside the open band `spot * (1 ± range)`.
pub fn select_strikes(strikes: &[f64], spot: f64, distance: f64, range: f64) -> Vec<f64> {
    let low = spot * (1.0 - range);
    let high = spot * (1.0 + range);
    strikes
        .iter()
        .copied()
        .filter(|k| k % distance == 0.0 && *k > low && *k < high)
        .collect()
}

/// strike x {P, C} x expiration, in that nesting.
pub fn candidate_specs(params: &ChainParams, strikes: &[f64], expirations: &[String]) -> Vec<ContractSpec> {
    iproduct!(strikes.iter(), [Right::Put, Right::Call], expirations.iter())
        .map(|(strike, right, exp)| {
            ContractSpec::option(&params.symbol, exp, *strike, right, &params.option_exchange)
        })
        .collect()
}

/// Later duplicates win; output is keyed (and ordered) by `con_id`.
pub fn dedupe_by_con_id(contracts: Vec<Contract>) -> BTreeMap<i64, Contract> {
    contracts.into_iter().map(|c| (c.con_id, c)).collect()
}

fn select_classes<'a>(
    defs: &'a [ChainDefinition],
    classes: &[String],
    exchange: &str,
) -> ChainResult<Vec<&'a ChainDefinition>> {
    classes
        .iter()
        .map(|class| {
            defs.iter()
                .find(|d| &d.trading_class == class && d.exchange == exchange)
                .ok_or_else(|| ChainError::MissingTradingClass {
                    class: class.clone(),
                    exchange: exchange.to_string(),
                })
        })
        .collect()
}

/// Run one gateway call unless shutdown has fired or fires while it is in flight.
async fn interruptible<T>(
    shutdown: &mut Shutdown,
    call: impl Future<Output = GatewayResult<T>>,
) -> ChainResult<T> {
    if shutdown.is_triggered() {
        return Err(ChainError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = shutdown.triggered() => Err(ChainError::Cancelled),
        result = call => Ok(result?),
    }
}

pub struct ChainBuilder {
    gateway: Arc<dyn Gateway>,
}

impl ChainBuilder {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    pub async fn build(&self, params: &ChainParams, shutdown: &mut Shutdown) -> ChainResult<Universe> {
        self.build_at(params, chrono::Local::now().naive_local(), shutdown).await
    }

    /// Same as [`build`](Self::build) with an explicit clock for the DTE filter.
    #[instrument(skip_all, fields(symbol = %params.symbol))]
    pub async fn build_at(
        &self,
        params: &ChainParams,
        now: NaiveDateTime,
        shutdown: &mut Shutdown,
    ) -> ChainResult<Universe> {
        let started = Instant::now();

        let index = ContractSpec::index(&params.symbol, &params.index_exchange);
        let underlying = interruptible(shutdown, self.gateway.resolve_underlying(&index)).await?;
        let spot = self.warm_up(&underlying, params, shutdown).await?;
        info!(con_id = underlying.con_id, spot, "underlying ready");

        let defs = interruptible(
            shutdown,
            self.gateway.chain_definitions(&underlying, &params.option_exchange),
        )
        .await?;
        let classes = select_classes(&defs, &params.trading_classes, &params.option_exchange)?;

        let expirations = select_expirations(&classes, now, params.min_dte, params.max_dte);
        let strikes = classes
            .first()
            .map(|standard| select_strikes(&standard.strikes, spot, params.strike_distance, params.strike_range))
            .unwrap_or_default();
        info!(
            expirations = expirations.len(),
            strikes = strikes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chain filtered"
        );

        let snapshot = ChainSnapshot { spot, strikes, expirations };
        if snapshot.is_empty() {
            warn!("nothing to stream: no expiration or strike passed the filters");
            metrics::gauge!("optfeed_universe_contracts").set(0.0);
            return Ok(Universe { underlying, contracts: Vec::new(), snapshot, subscriptions: 0 });
        }

        let candidates = candidate_specs(params, &snapshot.strikes, &snapshot.expirations);
        let qualified = interruptible(shutdown, self.gateway.qualify_contracts(&candidates)).await?;
        debug!(requested = candidates.len(), qualified = qualified.len(), "first qualification");

        let unique = dedupe_by_con_id(qualified);
        let specs: Vec<ContractSpec> = unique.values().map(|c| c.spec.clone()).collect();
        let requalified = interruptible(shutdown, self.gateway.qualify_contracts(&specs)).await?;
        let contracts: Vec<Contract> = dedupe_by_con_id(requalified).into_values().collect();
        info!(
            candidates = candidates.len(),
            unique = unique.len(),
            contracts = contracts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "contracts qualified"
        );

        let subscriptions = interruptible(shutdown, self.gateway.subscribe_quotes(&contracts)).await?;
        metrics::gauge!("optfeed_universe_contracts").set(contracts.len() as f64);
        info!(
            subscriptions,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "universe subscribed"
        );

        Ok(Universe { underlying, contracts, snapshot, subscriptions })
    }

    async fn warm_up(&self, underlying: &Contract, params: &ChainParams, shutdown: &mut Shutdown) -> ChainResult<f64> {
        let book = self.gateway.quotes();
        for attempt in 1..=params.warmup_attempts {
            tokio::select! {
                _ = tokio::time::sleep(params.warmup) => {}
                _ = shutdown.triggered() => return Err(ChainError::Cancelled),
            }
            if let Some(price) = book.get(underlying.con_id).and_then(|q| q.market_price()) {
                return Ok(price);
            }
            debug!(attempt, "underlying quote not in yet");
        }
        Err(ChainError::NoUnderlyingQuote {
            symbol: underlying.symbol().to_string(),
            attempts: params.warmup_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainSettings;
    use crate::engine::shutdown::{self, ShutdownTrigger};
    use crate::market_data::adapters::simulated::SimulatedGateway;
    use crate::market_data::quote_book::QuoteBook;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;

    /// Fires shutdown from inside the first qualification round trip.
    struct StopDuringQualify {
        inner: Arc<SimulatedGateway>,
        trigger: Mutex<Option<ShutdownTrigger>>,
    }

    #[async_trait::async_trait]
    impl Gateway for StopDuringQualify {
        async fn connect(&self, client_id: i32, timeout: Option<Duration>) -> GatewayResult<()> {
            self.inner.connect(client_id, timeout).await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn disconnect(&self) {
            self.inner.disconnect().await
        }

        async fn resolve_underlying(&self, spec: &ContractSpec) -> GatewayResult<Contract> {
            self.inner.resolve_underlying(spec).await
        }

        async fn chain_definitions(&self, underlying: &Contract, exchange: &str) -> GatewayResult<Vec<ChainDefinition>> {
            self.inner.chain_definitions(underlying, exchange).await
        }

        async fn qualify_contracts(&self, specs: &[ContractSpec]) -> GatewayResult<Vec<Contract>> {
            if let Some(trigger) = self.trigger.lock().take() {
                trigger.trigger();
            }
            self.inner.qualify_contracts(specs).await
        }

        async fn subscribe_quotes(&self, contracts: &[Contract]) -> GatewayResult<usize> {
            self.inner.subscribe_quotes(contracts).await
        }

        fn quotes(&self) -> QuoteBook {
            self.inner.quotes()
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn def(class: &str, expirations: &[&str]) -> ChainDefinition {
        ChainDefinition {
            trading_class: class.into(),
            exchange: "SMART".into(),
            strikes: vec![],
            expirations: expirations.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_days_to_expiry_floors() {
        let now = at(2026, 10, 18, 15);
        // 61 days minus 15 hours
        assert_eq!(days_to_expiry("20261218", now), Some(60));
        assert_eq!(days_to_expiry("20261019", now), Some(0));
        assert_eq!(days_to_expiry("20261018", now), Some(-1));
        assert_eq!(days_to_expiry("garbage", now), None);
    }

    #[test]
    fn test_expirations_keep_class_order_and_duplicates() {
        let now = at(2026, 10, 18, 0);
        let spx = def("SPX", &["20270115", "20261218"]);
        let spxw = def("SPXW", &["20261218", "20261030", "20271231"]);
        let got = select_expirations(&[&spx, &spxw], now, 30, 250);
        assert_eq!(got, vec!["20261218", "20270115", "20261218"]);
    }

    #[test]
    fn test_dte_bounds_are_exclusive() {
        let now = at(2026, 10, 18, 0);
        let d = def("SPX", &["20261117", "20261118", "20261119"]);
        // 30, 31, 32 days out
        assert_eq!(select_expirations(&[&d], now, 30, 32), vec!["20261118"]);
    }

    #[test]
    fn test_strike_band_and_grid() {
        let strikes = [2250.0, 2275.0, 4510.0, 4500.0, 6750.0, 6725.0, 4525.5];
        let got = select_strikes(&strikes, 4500.0, 25.0, 0.5);
        assert_eq!(got, vec![2275.0, 4500.0, 6725.0]);
    }

    #[test]
    fn test_candidates_nest_strike_right_expiration() {
        let params = ChainSettings::default().params();
        let specs = candidate_specs(&params, &[4500.0, 4525.0], &["20261218".into(), "20270115".into()]);
        assert_eq!(specs.len(), 8);
        let key = |s: &ContractSpec| (s.strike.unwrap(), s.right.unwrap(), s.expiration.clone().unwrap());
        assert_eq!(key(&specs[0]), (4500.0, Right::Put, "20261218".into()));
        assert_eq!(key(&specs[1]), (4500.0, Right::Put, "20270115".into()));
        assert_eq!(key(&specs[2]), (4500.0, Right::Call, "20261218".into()));
        assert_eq!(key(&specs[4]), (4525.0, Right::Put, "20261218".into()));
        assert!(specs.iter().all(|s| s.exchange == "SMART" && s.symbol == "SPX"));
    }

    #[test]
    fn test_missing_class_is_an_error() {
        let defs = vec![def("SPX", &[])];
        let err = select_classes(&defs, &["SPX".into(), "SPXW".into()], "SMART").unwrap_err();
        assert!(matches!(err, ChainError::MissingTradingClass { ref class, .. } if class == "SPXW"));
    }

    fn params(warmup_attempts: u32) -> ChainParams {
        ChainParams { warmup_attempts, ..ChainSettings::default().params() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_dedupes_and_subscribes() {
        // the same listing reachable through both classes
        let gw = Arc::new(
            SimulatedGateway::builder("SPX", Some(4500.0))
                .chain("SPX", vec![4475.0, 4500.0, 4510.0], vec!["20261218"])
                .chain("SPXW", vec![4500.0], vec!["20261218", "20261030"])
                .list("20261218", 4500.0, Right::Put, 101)
                .list("20261218", 4500.0, Right::Call, 102)
                .list("20261218", 4475.0, Right::Put, 103)
                .build(),
        );
        gw.connect(1, None).await.unwrap();
        let (_t, mut sd) = shutdown::channel();

        let universe = ChainBuilder::new(gw.clone())
            .build_at(&params(3), at(2026, 10, 18, 9), &mut sd)
            .await
            .unwrap();

        assert_eq!(universe.snapshot.expirations, vec!["20261218", "20261218"]);
        assert_eq!(universe.snapshot.strikes, vec![4475.0, 4500.0]);
        let ids: Vec<i64> = universe.contracts.iter().map(|c| c.con_id).collect();
        assert_eq!(ids, vec![101, 102, 103]);
        assert_eq!(universe.subscriptions, 3);
        assert_eq!(gw.qualify_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_expirations_skip_qualification() {
        let gw = Arc::new(
            SimulatedGateway::builder("SPX", Some(4500.0))
                .chain("SPX", vec![4500.0], vec!["20261030"])
                .chain("SPXW", vec![4500.0], vec!["20261023"])
                .build(),
        );
        gw.connect(1, None).await.unwrap();
        let (_t, mut sd) = shutdown::channel();

        let universe = ChainBuilder::new(gw.clone())
            .build_at(&params(3), at(2026, 10, 18, 9), &mut sd)
            .await
            .unwrap();

        assert!(universe.is_empty());
        assert_eq!(universe.subscriptions, 0);
        assert_eq!(gw.qualify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_gives_up_without_a_quote() {
        let gw = Arc::new(SimulatedGateway::builder("SPX", None).build());
        gw.connect(1, None).await.unwrap();
        let (_t, mut sd) = shutdown::channel();

        let err = ChainBuilder::new(gw).build(&params(4), &mut sd).await.unwrap_err();
        assert!(matches!(err, ChainError::NoUnderlyingQuote { attempts: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_warmup() {
        let gw = Arc::new(SimulatedGateway::builder("SPX", None).build());
        gw.connect(1, None).await.unwrap();
        let (trigger, mut sd) = shutdown::channel();
        trigger.trigger();

        let err = ChainBuilder::new(gw).build(&params(10), &mut sd).await.unwrap_err();
        assert!(matches!(err, ChainError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_qualification_stops_the_build() {
        let sim = Arc::new(
            SimulatedGateway::builder("SPX", Some(4500.0))
                .chain("SPX", vec![4500.0], vec!["20261218"])
                .chain("SPXW", vec![4500.0], vec!["20261218"])
                .list("20261218", 4500.0, Right::Put, 101)
                .list("20261218", 4500.0, Right::Call, 102)
                .build(),
        );
        sim.connect(1, None).await.unwrap();
        let (trigger, mut sd) = shutdown::channel();
        let gw = Arc::new(StopDuringQualify { inner: sim.clone(), trigger: Mutex::new(Some(trigger)) });

        let err = ChainBuilder::new(gw)
            .build_at(&params(3), at(2026, 10, 18, 9), &mut sd)
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Cancelled));
        assert_eq!(sim.qualify_calls.load(Ordering::SeqCst), 1);
        // only the underlying was ever subscribed
        assert_eq!(sim.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_uses_configured_option_exchange() {
        let gw = Arc::new(
            SimulatedGateway::builder("SPX", Some(4500.0))
                .chain_on("CBOE", "SPX", vec![4500.0], vec!["20261218"])
                .chain_on("CBOE", "SPXW", vec![4500.0], vec!["20261218"])
                .chain("SPX", vec![4400.0], vec!["20261218"])
                .list("20261218", 4500.0, Right::Put, 101)
                .list("20261218", 4500.0, Right::Call, 102)
                .build(),
        );
        gw.connect(1, None).await.unwrap();
        let (_t, mut sd) = shutdown::channel();
        let params = ChainParams { option_exchange: "CBOE".into(), ..params(3) };

        let universe = ChainBuilder::new(gw.clone())
            .build_at(&params, at(2026, 10, 18, 9), &mut sd)
            .await
            .unwrap();

        assert_eq!(universe.snapshot.strikes, vec![4500.0]);
        assert_eq!(universe.len(), 2);
        assert!(universe.contracts.iter().all(|c| c.spec.exchange == "CBOE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_class_missing_on_configured_exchange() {
        let gw = Arc::new(
            SimulatedGateway::builder("SPX", Some(4500.0))
                .chain("SPX", vec![4500.0], vec!["20261218"])
                .chain("SPXW", vec![4500.0], vec!["20261218"])
                .build(),
        );
        gw.connect(1, None).await.unwrap();
        let (_t, mut sd) = shutdown::channel();
        let params = ChainParams { option_exchange: "CBOE".into(), ..params(3) };

        let err = ChainBuilder::new(gw).build_at(&params, at(2026, 10, 18, 9), &mut sd).await.unwrap_err();
        assert!(matches!(err, ChainError::MissingTradingClass { ref exchange, .. } if exchange == "CBOE"));
    }

    proptest! {
        #[test]
        fn prop_selected_strikes_respect_grid_and_band(
            raw in proptest::collection::vec(0u32..400, 0..60),
            spot in 1000.0f64..8000.0,
            range in 0.01f64..0.9,
        ) {
            let strikes: Vec<f64> = raw.iter().map(|r| *r as f64 * 12.5).collect();
            for k in select_strikes(&strikes, spot, 25.0, range) {
                prop_assert_eq!(k % 25.0, 0.0);
                prop_assert!(k > spot * (1.0 - range) && k < spot * (1.0 + range));
            }
        }

        #[test]
        fn prop_selected_expirations_inside_window(offsets in proptest::collection::vec(0i64..400, 0..40)) {
            let now = at(2026, 10, 18, 12);
            let exps: Vec<String> = offsets
                .iter()
                .map(|o| (now.date() + chrono::Duration::days(*o)).format("%Y%m%d").to_string())
                .collect();
            let refs: Vec<&str> = exps.iter().map(String::as_str).collect();
            let d = def("SPX", &refs);
            for e in select_expirations(&[&d], now, 30, 250) {
                let dte = days_to_expiry(&e, now).unwrap();
                prop_assert!(dte > 30 && dte < 250);
            }
        }

        #[test]
        fn prop_dedupe_is_idempotent(ids in proptest::collection::vec(1i64..30, 0..50)) {
            let contracts: Vec<Contract> = ids
                .iter()
                .map(|id| Contract {
                    con_id: *id,
                    local_symbol: format!("X{id}"),
                    spec: ContractSpec::option("SPX", "20261218", 4500.0, Right::Put, "SMART"),
                })
                .collect();
            let once = dedupe_by_con_id(contracts);
            let twice = dedupe_by_con_id(once.values().cloned().collect());
            prop_assert_eq!(once.len(), twice.len());
            prop_assert!(once.keys().eq(twice.keys()));
        }
    }
}
