use anyhow::{anyhow, Context};
use autostop::api::{BinanceClient, BinanceGateway, CandleSource, OrderGateway, PaperGateway};
use autostop::config::Settings;
use autostop::db::PostgresStore;
use autostop::execution::{Evaluator, StopDecider};
use autostop::indicators::{self, IndicatorState};
use autostop::persistence::{CachedCandleSource, RedisCandleCache};
use autostop::scheduler::Scheduler;
use autostop::{StrategyParams, Timeframe};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "autostop", about = "Trailing stop-loss automation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cohort scheduler until Ctrl+C (default)
    Run,
    /// Evaluate one position now
    Check {
        #[arg(long)]
        position: Uuid,
    },
    /// Print per-bar indicator readings for a symbol
    Replay {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1h")]
        timeframe: Timeframe,
        #[arg(long, default_value_t = 200)]
        bars: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::load().context("Failed to load settings")?;
    setup_logging(&settings);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Check { position } => check(settings, position).await,
        Command::Replay {
            symbol,
            timeframe,
            bars,
        } => replay(settings, &symbol, timeframe, bars).await,
    }
}

fn setup_logging(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    tracing::info!("🚀 autostop starting");

    let scheduler = build_scheduler(&settings).await?;

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Max concurrency: {}", settings.scheduler.max_concurrency);
    tracing::info!("  Settle delay: {}ms", settings.scheduler.settle_delay_ms);
    tracing::info!("  Gateway attempts: {}", settings.gateway.max_attempts);
    tracing::info!("  Manual override: {}", settings.policy.manual_override);
    tracing::info!("  Dry run: {}", settings.venue.dry_run);

    let handle = scheduler.start(&Timeframe::ALL);
    tracing::info!("✅ Cohort loops running for {} timeframes", Timeframe::ALL.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    tracing::info!("🛑 Shutdown requested, draining in-flight evaluations...");
    handle.shutdown().await;
    tracing::info!("👋 autostop stopped");

    Ok(())
}

async fn check(settings: Settings, position: Uuid) -> anyhow::Result<()> {
    let scheduler = build_scheduler(&settings).await?;
    let outcome = scheduler
        .check_now(position)
        .await
        .with_context(|| format!("Check failed for position {}", position))?;

    tracing::info!("🔎 Position {}: {}", position, outcome);
    println!("{}", outcome);
    Ok(())
}

async fn replay(
    settings: Settings,
    symbol: &str,
    timeframe: Timeframe,
    bars: usize,
) -> anyhow::Result<()> {
    let source = build_source(&settings, venue_client(&settings)?).await?;
    let params = StrategyParams::default();
    let now = Utc::now();

    let candles = source
        .fetch(symbol, timeframe, None, bars.max(params.warmup_bars() + 1))
        .await
        .with_context(|| format!("Failed to fetch {} {} candles", symbol, timeframe))?;
    let closed: Vec<_> = candles
        .into_iter()
        .filter(|c| timeframe.is_closed(c.timestamp, now))
        .collect();

    tracing::info!("📈 Replaying {} closed {} bars for {}", closed.len(), timeframe, symbol);

    println!(
        "{:<20} {:>12} {:>6} {:>12} {:>12} {:>12} {:>12}  regime",
        "bar", "close", "mult", "upper", "lower", "trail_long", "trail_short"
    );

    let mut state = IndicatorState::new();
    for candle in &closed {
        state = indicators::update(state, &params, std::slice::from_ref(candle));
        let Ok(reading) = state.reading(&params) else {
            continue;
        };
        println!(
            "{:<20} {:>12.4} {:>6.3} {:>12.4} {:>12.4} {:>12.4} {:>12.4}  {:?}{}",
            reading.timestamp.format("%Y-%m-%d %H:%M"),
            reading.close,
            reading.multiplier,
            reading.upper_band,
            reading.lower_band,
            reading.trail_long,
            reading.trail_short,
            reading.regime,
            if reading.is_flip { " (flip)" } else { "" }
        );
    }

    Ok(())
}

fn venue_client(settings: &Settings) -> anyhow::Result<BinanceClient> {
    BinanceClient::new(&settings.venue.base_url, settings.venue.requests_per_minute)
        .context("Failed to create venue client")
}

async fn build_source(
    settings: &Settings,
    client: BinanceClient,
) -> anyhow::Result<Arc<dyn CandleSource>> {
    let binance: Arc<dyn CandleSource> = Arc::new(client);

    let Some(redis_url) = settings.redis.url.as_deref() else {
        return Ok(binance);
    };

    match RedisCandleCache::new(redis_url).await {
        Ok(cache) => {
            tracing::info!("✅ Candle cache enabled");
            Ok(Arc::new(CachedCandleSource::new(binance, cache)))
        }
        Err(e) => {
            tracing::warn!("⚠️  Redis unavailable, fetching candles from venue only: {}", e);
            Ok(binance)
        }
    }
}

async fn build_scheduler(settings: &Settings) -> anyhow::Result<Scheduler> {
    let store = PostgresStore::new(&settings.database.url, settings.database.max_connections)
        .await
        .map_err(|e| anyhow!("Failed to connect to Postgres: {}", e))?;
    let store = Arc::new(store);

    // Candles and orders share one HTTP pool and request budget
    let client = venue_client(settings)?;
    let gateway: Arc<dyn OrderGateway> = if settings.venue.dry_run {
        tracing::info!("📝 Dry run: stops are placed on the paper venue");
        Arc::new(PaperGateway::permissive())
    } else {
        let (key, secret) = settings.venue_credentials()?;
        tracing::info!("🔐 Live mode: stops are placed on {}", settings.venue.base_url);
        Arc::new(
            BinanceGateway::new(client.clone(), key, secret)
                .with_recv_window(settings.venue.recv_window_ms),
        )
    };

    let policy = settings.manual_override()?;
    let source = build_source(settings, client).await?;
    let evaluator = Evaluator::new(store.clone(), store, source, gateway)
        .with_decider(StopDecider::new(policy))
        .with_retry(settings.retry_policy())
        .with_history_bars(settings.scheduler.history_bars)
        .with_log_timeout(settings.log_timeout());

    Ok(Scheduler::new(evaluator, settings.scheduler_config()))
}
