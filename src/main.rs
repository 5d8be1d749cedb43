use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use optfeed_rs::config::Settings;
use optfeed_rs::engine::aggregator::AggregateOptions;
use optfeed_rs::engine::chain::{ChainBuilder, ChainError};
use optfeed_rs::engine::shutdown::{self, Shutdown};
use optfeed_rs::engine::stream::{StreamConfig, StreamLoop};
use optfeed_rs::market_data::adapters::client_portal::ClientPortalGateway;
use optfeed_rs::market_data::adapters::simulated::SimulatedGateway;
use optfeed_rs::market_data::adapters::Gateway;
use optfeed_rs::market_data::connection::{ConnectionState, GatewayConnection};
use optfeed_rs::rates::RateFetcher;
use optfeed_rs::sink::{CellRef, CsvWorkbook, SheetSink};
use optfeed_rs::telemetry;

const SIMULATED_SPOT: f64 = 4500.0;

#[derive(Debug, Parser)]
#[command(name = "optfeed", version, about = "Streams a live SPX option pricing table into a workbook")]
struct Cli {
    /// TOML settings file (default: ./optfeed.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Use the in-process simulated gateway instead of the Client Portal
    #[arg(long)]
    simulate: bool,
    /// Skip the rate-curve download
    #[arg(long)]
    no_rates: bool,
    /// Overrides telemetry.log_filter; RUST_LOG still wins
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;

    telemetry::init_tracing(cli.log_level.as_deref().unwrap_or(&settings.telemetry.log_filter));
    telemetry::init_metrics()?;

    let (trigger, mut shutdown) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                trigger.trigger();
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c");
                // keep the trigger alive; dropping it would stop the session
                std::future::pending::<()>().await;
            }
        }
    });

    let gateway: Arc<dyn Gateway> = if cli.simulate {
        info!(spot = SIMULATED_SPOT, "using simulated gateway");
        Arc::new(SimulatedGateway::demo(chrono::Local::now().date_naive(), SIMULATED_SPOT))
    } else {
        Arc::new(ClientPortalGateway::new(&settings.gateway)?)
    };
    let connection = Arc::new(GatewayConnection::new(gateway, settings.gateway.retry_policy()));

    let result = run(&cli, &settings, &connection, &mut shutdown).await;
    connection.disconnect().await;
    result
}

async fn run(
    cli: &Cli,
    settings: &Settings,
    connection: &Arc<GatewayConnection>,
    shutdown: &mut Shutdown,
) -> anyhow::Result<()> {
    let feed_anchor = CellRef::parse(&settings.sink.feed_anchor)?;
    let rate_anchor = CellRef::parse(&settings.sink.rate_anchor)?;

    let client_id = settings.gateway.resolve_client_id();
    match connection
        .connect(client_id, settings.gateway.connect_timeout(), shutdown)
        .await?
    {
        ConnectionState::Connected { attempts } => info!(client_id, attempts, "gateway ready"),
        ConnectionState::TimedOut { attempts } => {
            bail!("gateway unreachable after {attempts} attempts")
        }
        ConnectionState::Cancelled => return Ok(()),
    }

    let rates = if settings.rates.enabled && !cli.no_rates {
        let fetcher = RateFetcher::new(&settings.rates.url)?;
        let row = fetcher
            .fetch(chrono::Local::now().date_naive())
            .await
            .context("downloading rates")?;
        info!("rate download finished");
        Some(row)
    } else {
        None
    };

    let universe = match ChainBuilder::new(connection.gateway())
        .build(&settings.chain.params(), shutdown)
        .await
    {
        Ok(u) => u,
        Err(ChainError::Cancelled) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    info!(path = %settings.sink.workbook, "connecting to workbook...");
    let mut workbook = CsvWorkbook::open(&settings.sink.workbook).await?;
    if let Some(row) = rates {
        workbook
            .replace_range(&settings.sink.rate_sheet, rate_anchor, &row.to_table())
            .await?;
        info!(sheet = %settings.sink.rate_sheet, "rates published");
    }

    let config = StreamConfig {
        sheet: settings.sink.feed_sheet.clone(),
        anchor: feed_anchor,
        wait: Duration::from_millis(settings.stream.wait_ms),
        options: AggregateOptions { drop_negative_mids: settings.stream.drop_negative_mids },
    };
    let mut stream = StreamLoop::new(universe, Arc::clone(connection), workbook, config)?;
    let stats = stream.run(shutdown).await?;
    info!(?stats, "session finished");
    Ok(())
}
