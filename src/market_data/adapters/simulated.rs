// In-process gateway with a scripted chain, listings and quotes.
//
// Backs the integration tests and the `--simulate` mode of the binary.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Weekday};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::client_portal_types::occ_local_symbol;
use super::{Gateway, GatewayError, GatewayResult};
use crate::engine::types::{
    parse_expiration, ChainDefinition, Contract, ContractSpec, QuoteUpdate, Right, EXPIRATION_FORMAT,
};
use crate::market_data::quote_book::QuoteBook;

pub const SIM_UNDERLYING_CONID: i64 = 416_904;

type ListingKey = (String, i64, Right);

fn listing_key(expiration: &str, strike: f64, right: Right) -> ListingKey {
    (expiration.to_string(), (strike * 1000.0).round() as i64, right)
}

/// Deterministic id for a listed option: yymmdd, half-point strike, right.
pub fn sim_con_id(expiration: &str, strike: f64, right: Right) -> i64 {
    let date: i64 = expiration.get(2..).and_then(|s| s.parse().ok()).unwrap_or(0);
    let halves = (strike * 2.0).round() as i64;
    let bit = match right {
        Right::Put => 0,
        Right::Call => 1,
    };
    date * 100_000 + halves * 2 + bit
}

enum Listing {
    /// Only explicitly listed contracts qualify.
    Table(AHashMap<ListingKey, i64>),
    /// Every (expiration, strike) present in some chain qualifies.
    Chains,
}

struct Ticker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct SimulatedGateway {
    symbol: String,
    spot: Option<f64>,
    chains: Vec<ChainDefinition>,
    listing: Listing,
    seeded: AHashMap<i64, (f64, f64)>,
    refusals_left: AtomicU32,
    jitter: Option<Duration>,
    connected: AtomicBool,
    book: QuoteBook,
    subscribed: Mutex<AHashSet<i64>>,
    ticker: Mutex<Option<Ticker>>,
    pub connect_calls: AtomicU32,
    pub qualify_calls: AtomicUsize,
    pub disconnect_calls: AtomicU32,
}

pub struct SimulatedGatewayBuilder {
    symbol: String,
    spot: Option<f64>,
    chains: Vec<ChainDefinition>,
    listing: Listing,
    seeded: AHashMap<i64, (f64, f64)>,
    refusals: u32,
    jitter: Option<Duration>,
}

impl SimulatedGatewayBuilder {
    pub fn chain(self, trading_class: &str, strikes: Vec<f64>, expirations: Vec<&str>) -> Self {
        self.chain_on("SMART", trading_class, strikes, expirations)
    }

    pub fn chain_on(mut self, exchange: &str, trading_class: &str, strikes: Vec<f64>, expirations: Vec<&str>) -> Self {
        self.chains.push(ChainDefinition {
            trading_class: trading_class.to_string(),
            exchange: exchange.to_string(),
            strikes,
            expirations: expirations.into_iter().map(str::to_string).collect(),
        });
        self
    }

    pub fn list(mut self, expiration: &str, strike: f64, right: Right, con_id: i64) -> Self {
        if let Listing::Table(table) = &mut self.listing {
            table.insert(listing_key(expiration, strike, right), con_id);
        }
        self
    }

    pub fn list_all_chains(mut self) -> Self {
        self.listing = Listing::Chains;
        self
    }

    pub fn quote(mut self, con_id: i64, bid: f64, ask: f64) -> Self {
        self.seeded.insert(con_id, (bid, ask));
        self
    }

    pub fn refuse_connections(mut self, n: u32) -> Self {
        self.refusals = n;
        self
    }

    /// Randomly walk subscribed quotes on this period.
    pub fn jitter(mut self, every: Duration) -> Self {
        self.jitter = Some(every);
        self
    }

    pub fn build(self) -> SimulatedGateway {
        SimulatedGateway {
            symbol: self.symbol,
            spot: self.spot,
            chains: self.chains,
            listing: self.listing,
            seeded: self.seeded,
            refusals_left: AtomicU32::new(self.refusals),
            jitter: self.jitter,
            connected: AtomicBool::new(false),
            book: QuoteBook::new(),
            subscribed: Mutex::new(AHashSet::new()),
            ticker: Mutex::new(None),
            connect_calls: AtomicU32::new(0),
            qualify_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicU32::new(0),
        }
    }
}

impl SimulatedGateway {
    /// `spot = None` simulates an underlying whose quote never arrives.
    pub fn builder(symbol: &str, spot: Option<f64>) -> SimulatedGatewayBuilder {
        SimulatedGatewayBuilder {
            symbol: symbol.to_string(),
            spot,
            chains: Vec::new(),
            listing: Listing::Table(AHashMap::new()),
            seeded: AHashMap::new(),
            refusals: 0,
            jitter: None,
        }
    }

    /// An SPX-like market: monthly third-Friday `SPX` expirations, weekly
    /// Friday `SPXW` expirations, 5-point strikes, every listing live.
    pub fn demo(today: NaiveDate, spot: f64) -> Self {
        let strikes: Vec<f64> = (200..=1600).map(|i| i as f64 * 5.0).collect();

        let mut weeklies = Vec::new();
        let mut monthlies = Vec::new();
        let mut day = today;
        while day <= today + ChronoDuration::days(400) {
            if day.weekday() == Weekday::Fri {
                let exp = day.format(EXPIRATION_FORMAT).to_string();
                if (15..=21).contains(&day.day()) {
                    monthlies.push(exp.clone());
                }
                weeklies.push(exp);
            }
            day += ChronoDuration::days(1);
        }

        Self::builder("SPX", Some(spot))
            .chain("SPX", strikes.clone(), monthlies.iter().map(String::as_str).collect())
            .chain("SPXW", strikes, weeklies.iter().map(String::as_str).collect())
            .list_all_chains()
            .jitter(Duration::from_millis(250))
            .build()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    /// Push a quote as if it had arrived from the wire. False if nobody subscribed to it.
    pub fn push_quote(&self, con_id: i64, bid: f64, ask: f64) -> bool {
        self.book.apply(QuoteUpdate { con_id, bid: Some(bid), ask: Some(ask), last: None, ts_ms: now_ms() })
    }

    fn lookup(&self, spec: &ContractSpec) -> Option<Contract> {
        let expiration = spec.expiration.as_deref()?;
        let strike = spec.strike?;
        let right = spec.right?;
        if spec.symbol != self.symbol {
            return None;
        }

        let (con_id, class) = match &self.listing {
            Listing::Table(table) => {
                let id = *table.get(&listing_key(expiration, strike, right))?;
                (id, spec.trading_class.clone().unwrap_or_else(|| self.symbol.clone()))
            }
            Listing::Chains => {
                let chain = self.chains.iter().find(|c| {
                    c.expirations.iter().any(|e| e == expiration) && c.strikes.iter().any(|s| *s == strike)
                })?;
                (sim_con_id(expiration, strike, right), chain.trading_class.clone())
            }
        };

        let mut qualified = spec.clone();
        qualified.trading_class = Some(class.clone());
        Some(Contract {
            con_id,
            local_symbol: occ_local_symbol(&class, parse_expiration(expiration)?, right, strike),
            spec: qualified,
        })
    }

    /// Rough fair value so demo mode shows sensible numbers.
    fn seed_price(&self, contract: &Contract) -> Option<(f64, f64)> {
        if let Some(q) = self.seeded.get(&contract.con_id) {
            return Some(*q);
        }
        let Listing::Chains = self.listing else {
            return None;
        };
        let spot = self.spot?;
        let strike = contract.spec.strike?;
        let right = contract.spec.right?;
        let expiry = parse_expiration(contract.expiration())?;
        let years = ((expiry - chrono::Local::now().date_naive()).num_days().max(1) as f64) / 365.0;

        let intrinsic = match right {
            Right::Call => (spot - strike).max(0.0),
            Right::Put => (strike - spot).max(0.0),
        };
        let sd = spot * 0.18 * years.sqrt();
        let z = (strike - spot) / sd;
        let time_value = 0.4 * sd * (-0.5 * z * z).exp();
        let mid = intrinsic + time_value;
        let half_spread = (mid * 0.01).max(0.05);
        Some(((mid - half_spread).max(0.0), mid + half_spread))
    }

    fn start_ticker(&self) {
        let Some(every) = self.jitter else {
            return;
        };
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let book = self.book.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.changed() => return,
                }
                let snapshot = book.snapshot();
                let mut rng = rand::thread_rng();
                for quote in snapshot.values() {
                    let (Some(bid), Some(ask)) = (quote.bid, quote.ask) else {
                        continue;
                    };
                    let step = (bid + ask) * 0.0005 * rng.gen_range(-1.0..=1.0);
                    book.apply(QuoteUpdate {
                        con_id: quote.con_id,
                        bid: Some((bid + step).max(0.0)),
                        ask: Some((ask + step).max(0.05)),
                        last: quote.last.map(|l| l + step),
                        ts_ms: now_ms(),
                    });
                }
            }
        });
        *ticker = Some(Ticker { stop: stop_tx, task });
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait::async_trait]
impl Gateway for SimulatedGateway {
    async fn connect(&self, client_id: i32, _timeout: Option<Duration>) -> GatewayResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(GatewayError::ConnectionRefused("simulated refusal".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(client_id, "simulated gateway connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let ticker = self.ticker.lock().take();
        if let Some(t) = ticker {
            t.stop.send_replace(true);
            let _ = t.task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn resolve_underlying(&self, spec: &ContractSpec) -> GatewayResult<Contract> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        if spec.symbol != self.symbol {
            return Err(GatewayError::NotFound(spec.symbol.clone()));
        }
        let contract = Contract {
            con_id: SIM_UNDERLYING_CONID,
            local_symbol: self.symbol.clone(),
            spec: spec.clone(),
        };
        self.subscribed.lock().insert(contract.con_id);
        self.book.track(contract.con_id);
        if let Some(spot) = self.spot {
            self.book.apply(QuoteUpdate {
                con_id: contract.con_id,
                bid: Some(spot - 0.25),
                ask: Some(spot + 0.25),
                last: Some(spot),
                ts_ms: now_ms(),
            });
        }
        Ok(contract)
    }

    async fn chain_definitions(&self, underlying: &Contract, exchange: &str) -> GatewayResult<Vec<ChainDefinition>> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        if underlying.con_id != SIM_UNDERLYING_CONID {
            return Err(GatewayError::NotFound(underlying.local_symbol.clone()));
        }
        Ok(self.chains.iter().filter(|c| c.exchange == exchange).cloned().collect())
    }

    async fn qualify_contracts(&self, specs: &[ContractSpec]) -> GatewayResult<Vec<Contract>> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.qualify_calls.fetch_add(1, Ordering::SeqCst);
        let qualified: Vec<Contract> = specs.iter().filter_map(|s| self.lookup(s)).collect();
        debug!(requested = specs.len(), qualified = qualified.len(), "simulated qualification");
        Ok(qualified)
    }

    async fn subscribe_quotes(&self, contracts: &[Contract]) -> GatewayResult<usize> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let mut fresh = 0;
        for contract in contracts {
            if !self.subscribed.lock().insert(contract.con_id) {
                continue;
            }
            fresh += 1;
            self.book.track(contract.con_id);
            if let Some((bid, ask)) = self.seed_price(contract) {
                self.push_quote(contract.con_id, bid, ask);
            }
        }
        if fresh > 0 {
            self.start_ticker();
        }
        Ok(fresh)
    }

    fn quotes(&self) -> QuoteBook {
        self.book.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_con_id_is_distinct_per_leg() {
        let put = sim_con_id("20261218", 4500.0, Right::Put);
        let call = sim_con_id("20261218", 4500.0, Right::Call);
        let half = sim_con_id("20261218", 4500.5, Right::Put);
        assert_ne!(put, call);
        assert_ne!(put, half);
        assert_eq!(put, sim_con_id("20261218", 4500.0, Right::Put));
    }

    #[tokio::test]
    async fn test_refusals_then_connect() {
        let gw = SimulatedGateway::builder("SPX", Some(4500.0)).refuse_connections(2).build();
        assert!(matches!(gw.connect(0, None).await, Err(GatewayError::ConnectionRefused(_))));
        assert!(matches!(gw.connect(0, None).await, Err(GatewayError::ConnectionRefused(_))));
        assert!(gw.connect(0, None).await.is_ok());
        assert!(gw.is_connected());
    }

    #[tokio::test]
    async fn test_table_listing_qualifies_only_listed() {
        let gw = SimulatedGateway::builder("SPX", Some(4500.0))
            .list("20261218", 4500.0, Right::Put, 11)
            .build();
        gw.connect(0, None).await.unwrap();

        let specs = vec![
            ContractSpec::option("SPX", "20261218", 4500.0, Right::Put, "SMART"),
            ContractSpec::option("SPX", "20261218", 4500.0, Right::Call, "SMART"),
        ];
        let q = gw.qualify_contracts(&specs).await.unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].con_id, 11);
        assert_eq!(q[0].local_symbol, "SPX   261218P04500000");
    }

    #[tokio::test]
    async fn test_demo_chain_shape() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let gw = SimulatedGateway::demo(today, 4500.0);
        gw.connect(0, None).await.unwrap();
        let und = gw.resolve_underlying(&ContractSpec::index("SPX", "CBOE")).await.unwrap();
        let chains = gw.chain_definitions(&und, "SMART").await.unwrap();
        assert!(gw.chain_definitions(&und, "CBOE").await.unwrap().is_empty());

        let spx = chains.iter().find(|c| c.trading_class == "SPX").unwrap();
        let spxw = chains.iter().find(|c| c.trading_class == "SPXW").unwrap();
        assert!(spx.expirations.len() < spxw.expirations.len());
        // every monthly is also a weekly Friday
        assert!(spx.expirations.iter().all(|e| spxw.expirations.contains(e)));
        assert_eq!(gw.quotes().get(SIM_UNDERLYING_CONID).unwrap().market_price(), Some(4500.0));
        gw.disconnect().await;
    }
}
