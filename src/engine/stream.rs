use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::engine::aggregator::{aggregate, AggregateError, AggregateOptions, UnderlyingMark};
use crate::engine::chain::Universe;
use crate::engine::shutdown::Shutdown;
use crate::market_data::connection::GatewayConnection;
use crate::market_data::quote_book::QuoteBook;
use crate::sink::{pricing_table, CellRef, SheetSink, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Stopped,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),
    #[error("stream loop already stopped")]
    AlreadyStopped,
}

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub sheet: String,
    pub anchor: CellRef,
    pub wait: Duration,
    pub options: AggregateOptions,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub ticks: u64,
    pub published: u64,
    pub skipped: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Republishes the full pricing table every `wait` until shutdown.
pub struct StreamLoop<S: SheetSink> {
    universe: Universe,
    book: QuoteBook,
    sink: S,
    config: StreamConfig,
    connection: Arc<GatewayConnection>,
    state: StreamState,
    latency: Histogram<u64>,
    ticks: u64,
    published: u64,
    skipped: u64,
}

impl<S: SheetSink> StreamLoop<S> {
    pub fn new(
        universe: Universe,
        connection: Arc<GatewayConnection>,
        sink: S,
        config: StreamConfig,
    ) -> StreamResult<Self> {
        // 1us .. 60s at 3 significant figures
        let latency = Histogram::new_with_bounds(1, 60_000_000, 3)?;
        Ok(Self {
            book: connection.gateway().quotes(),
            universe,
            sink,
            config,
            connection,
            state: StreamState::Idle,
            latency,
            ticks: 0,
            published: 0,
            skipped: 0,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            ticks: self.ticks,
            published: self.published,
            skipped: self.skipped,
            p50_us: self.latency.value_at_quantile(0.50),
            p99_us: self.latency.value_at_quantile(0.99),
            max_us: self.latency.max(),
        }
    }

    #[instrument(skip_all, fields(sheet = %self.config.sheet, contracts = self.universe.len()))]
    pub async fn run(&mut self, shutdown: &mut Shutdown) -> StreamResult<StreamStats> {
        if self.state == StreamState::Stopped {
            return Err(StreamError::AlreadyStopped);
        }
        self.state = StreamState::Streaming;
        info!(wait_ms = self.config.wait.as_millis() as u64, "streaming data....");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(self.config.wait) => {}
            }

            let started = Instant::now();
            self.ticks += 1;
            metrics::counter!("optfeed_ticks_total").increment(1);

            match self.tick().await {
                Ok(rows) => {
                    self.published += 1;
                    metrics::gauge!("optfeed_rows").set(rows as f64);
                    debug!(tick = self.ticks, rows, "published");
                }
                Err(e) => {
                    if let StreamError::Aggregate(AggregateError::UnknownContract { con_id }) = &e {
                        // evict so only this tick is lost
                        self.book.untrack(*con_id);
                    }
                    self.skipped += 1;
                    metrics::counter!("optfeed_ticks_skipped_total").increment(1);
                    warn!(tick = self.ticks, error = %e, "skipping tick");
                }
            }
            self.latency.saturating_record(started.elapsed().as_micros() as u64);
        }

        self.state = StreamState::Stopped;
        self.connection.disconnect().await;

        let stats = self.stats();
        info!(
            ticks = stats.ticks,
            published = stats.published,
            skipped = stats.skipped,
            p50_us = stats.p50_us,
            p99_us = stats.p99_us,
            "stream stopped"
        );
        Ok(stats)
    }

    async fn tick(&mut self) -> StreamResult<usize> {
        let mut quotes = self.book.snapshot();
        let underlying = &self.universe.underlying;
        let mark = UnderlyingMark {
            symbol: underlying.symbol().to_string(),
            price: quotes.remove(&underlying.con_id).and_then(|q| q.market_price()),
        };

        let now = chrono::Local::now().naive_local();
        let rows = aggregate(&self.universe.contracts, &quotes, &mark, now, self.config.options)?;
        self.sink
            .replace_range(&self.config.sheet, self.config.anchor, &pricing_table(&rows))
            .await?;
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::shutdown;
    use crate::engine::types::{ChainSnapshot, ContractSpec, Right};
    use crate::market_data::adapters::simulated::SimulatedGateway;
    use crate::market_data::adapters::Gateway;
    use crate::market_data::connection::RetryPolicy;
    use crate::sink::{SinkResult, Table};
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<(String, CellRef, Table)>,
        fail_first: usize,
    }

    #[async_trait::async_trait]
    impl SheetSink for RecordingSink {
        async fn replace_range(&mut self, sheet: &str, anchor: CellRef, table: &Table) -> SinkResult<()> {
            if self.fail_first > 0 {
                self.fail_first -= 1;
                return Err(SinkError::Io(std::io::Error::other("workbook locked")));
            }
            self.writes.push((sheet.to_string(), anchor, table.clone()));
            Ok(())
        }
    }

    async fn setup() -> (Arc<SimulatedGateway>, Universe) {
        let gw = Arc::new(
            SimulatedGateway::builder("SPX", Some(4500.0))
                .list("20261218", 4500.0, Right::Put, 2)
                .list("20261218", 4500.0, Right::Call, 1)
                .quote(1, 10.0, 12.0)
                .quote(2, 8.0, 9.0)
                .build(),
        );
        gw.connect(1, None).await.unwrap();
        let underlying = gw.resolve_underlying(&ContractSpec::index("SPX", "CBOE")).await.unwrap();
        let contracts = gw
            .qualify_contracts(&[
                ContractSpec::option("SPX", "20261218", 4500.0, Right::Call, "SMART"),
                ContractSpec::option("SPX", "20261218", 4500.0, Right::Put, "SMART"),
            ])
            .await
            .unwrap();
        let subscriptions = gw.subscribe_quotes(&contracts).await.unwrap();
        let universe = Universe { underlying, contracts, snapshot: ChainSnapshot::default(), subscriptions };
        (gw, universe)
    }

    fn config() -> StreamConfig {
        StreamConfig {
            sheet: "FM_FEED".into(),
            anchor: CellRef::new(0, 0),
            wait: Duration::from_millis(100),
            options: AggregateOptions::default(),
        }
    }

    fn stop_after(trigger: shutdown::ShutdownTrigger, after: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trigger.trigger();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_each_tick_until_stopped() {
        let (gw, universe) = setup().await;
        let conn = Arc::new(GatewayConnection::new(gw.clone(), RetryPolicy::default()));
        let mut lp = StreamLoop::new(universe, conn.clone(), RecordingSink::default(), config()).unwrap();
        assert_eq!(lp.state(), StreamState::Idle);

        let (trigger, mut sd) = shutdown::channel();
        stop_after(trigger, Duration::from_millis(350));
        let stats = lp.run(&mut sd).await.unwrap();

        assert_eq!(stats.ticks, 3);
        assert_eq!(stats.published, 3);
        assert_eq!(lp.state(), StreamState::Stopped);
        assert!(!gw.is_connected());
        assert_eq!(gw.disconnect_calls.load(Ordering::SeqCst), 1);

        let (sheet, anchor, table) = &lp.sink().writes[2];
        assert_eq!(sheet, "FM_FEED");
        assert_eq!(*anchor, CellRef::new(0, 0));
        assert_eq!(table.rows.len(), 1);
        let rendered: Vec<Vec<String>> = table.rendered_rows().collect();
        assert_eq!(rendered[0][2], "SPX");
        assert_eq!(rendered[0][3], "4500");
        assert_eq!(rendered[0][7], "11");
        assert_eq!(rendered[0][9], "8.5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_skips_tick_and_continues() {
        let (gw, universe) = setup().await;
        let conn = Arc::new(GatewayConnection::new(gw, RetryPolicy::default()));
        let sink = RecordingSink { fail_first: 2, ..RecordingSink::default() };
        let mut lp = StreamLoop::new(universe, conn, sink, config()).unwrap();

        let (trigger, mut sd) = shutdown::channel();
        stop_after(trigger, Duration::from_millis(450));
        let stats = lp.run(&mut sd).await.unwrap();

        assert_eq!(stats.ticks, 4);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.published, 2);
        assert_eq!(lp.sink().writes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_quote_never_reaches_the_table() {
        let (gw, universe) = setup().await;
        assert!(!gw.push_quote(777, 1.0, 2.0));
        let conn = Arc::new(GatewayConnection::new(gw, RetryPolicy::default()));
        let mut lp = StreamLoop::new(universe, conn, RecordingSink::default(), config()).unwrap();

        let (trigger, mut sd) = shutdown::channel();
        stop_after(trigger, Duration::from_millis(250));
        let stats = lp.run(&mut sd).await.unwrap();

        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_quote_costs_one_tick_only() {
        let (gw, universe) = setup().await;
        // tracked by the book but outside the universe
        gw.quotes().track(777);
        assert!(gw.push_quote(777, 1.0, 2.0));
        let conn = Arc::new(GatewayConnection::new(gw.clone(), RetryPolicy::default()));
        let mut lp = StreamLoop::new(universe, conn, RecordingSink::default(), config()).unwrap();

        let (trigger, mut sd) = shutdown::channel();
        stop_after(trigger, Duration::from_millis(1050));
        let stats = lp.run(&mut sd).await.unwrap();

        assert_eq!(stats.ticks, 10);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.published, 9);
        assert_eq!(lp.sink().writes.len(), 9);
        assert_eq!(gw.quotes().get(777), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cannot_restart_after_stop() {
        let (gw, universe) = setup().await;
        let conn = Arc::new(GatewayConnection::new(gw, RetryPolicy::default()));
        let mut lp = StreamLoop::new(universe, conn, RecordingSink::default(), config()).unwrap();

        let (trigger, mut sd) = shutdown::channel();
        trigger.trigger();
        let stats = lp.run(&mut sd).await.unwrap();
        assert_eq!(stats.ticks, 0);
        assert!(matches!(lp.run(&mut sd).await, Err(StreamError::AlreadyStopped)));
    }
}
