use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use umbrellabot::config::DEFAULT_SETTINGS_FILE;
use umbrellabot::discovery::{SelectionManager, SelectionSet, UniverseFilter};
use umbrellabot::notify::{SinkRegistry, TracingSink};
use umbrellabot::persistence::{MemorySelectionStore, RedisSelectionStore, SelectionStore};
use umbrellabot::simulation::{MarketScenario, SimulationConfig, SimulationRunner, SyntheticMarket};
use umbrellabot::StrategySettings;

#[derive(Parser)]
#[command(name = "umbrellabot", version, about = "Endless umbrella trading-signal engine")]
struct Cli {
    /// Settings file; UMBRELLA_* environment variables override it
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a synthetic session against the paper gateway
    Simulate {
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 8)]
        instruments: usize,
        /// Session length in simulated minutes
        #[arg(long, default_value_t = 240)]
        minutes: usize,
        #[arg(long, value_enum, default_value_t = MarketScenario::Rally)]
        scenario: MarketScenario,
    },
    /// Add or remove tickers in a selection set of the synthetic universe
    Select {
        /// Set number: 1-3, or 4 for favourites
        #[arg(long, default_value_t = 1)]
        set: u8,
        #[arg(long)]
        remove: bool,
        /// Seed of the synthetic universe
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 8)]
        instruments: usize,
        tickers: Vec<String>,
    },
    /// Print the effective settings as JSON
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = StrategySettings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    match cli.command {
        Command::Simulate {
            seed,
            instruments,
            minutes,
            scenario,
        } => {
            let config = SimulationConfig {
                seed,
                instruments,
                minutes,
                scenario,
            };
            simulate(settings, config).await
        }
        Command::Select {
            set,
            remove,
            seed,
            instruments,
            tickers,
        } => {
            let Some(set) = SelectionSet::from_number(set) else {
                bail!("unknown selection set {set}, expected 1-4");
            };
            let universe = SyntheticMarket::new(seed)
                .instruments(instruments, settings.price_min, settings.price_max)
                .into_iter()
                .map(Arc::new)
                .collect::<Vec<_>>();
            let filter = UniverseFilter::from_settings(&settings);

            match settings.redis_url.as_deref() {
                Some(url) => {
                    let store = RedisSelectionStore::new(url).await?;
                    select(store, filter, &universe, set, &tickers, !remove).await
                }
                None => {
                    tracing::warn!("⚠️  No redis_url configured, selection will not persist");
                    let store = MemorySelectionStore::new();
                    select(store, filter, &universe, set, &tickers, !remove).await
                }
            }
        }
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("umbrellabot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn simulate(settings: StrategySettings, config: SimulationConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 Umbrella simulation starting");
    tracing::info!(
        "  Capital: {:.2} in {} parts",
        settings.purchase_volume,
        settings.purchase_parts
    );
    tracing::info!("  Threshold: {}%", settings.change_percent);
    tracing::info!("  Take profit: {}%", settings.take_profit_percent);

    let mut sinks = SinkRegistry::new();
    sinks.register(Box::new(TracingSink));
    let sinks = Arc::new(sinks);

    let runner = SimulationRunner::new(settings);
    let task = tokio::task::spawn_blocking(move || runner.run(&config, sinks));

    // Wait for Ctrl+C or the session to finish
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, abandoning simulation");
        }
        result = task => {
            let report = result.context("simulation task panicked")??;
            println!("\n{report}");
        }
    }

    tracing::info!("👋 Umbrella simulation stopped");
    Ok(())
}

async fn select<S: SelectionStore>(
    store: S,
    filter: UniverseFilter,
    universe: &[Arc<umbrellabot::Instrument>],
    set: SelectionSet,
    tickers: &[String],
    selected: bool,
) -> anyhow::Result<()> {
    let mut manager = SelectionManager::new(store, filter);
    manager.process(universe, set).await?;

    for ticker in tickers {
        if manager.toggle(ticker, selected).await? {
            tracing::info!(ticker = %ticker, selected, "Selection updated");
        } else {
            tracing::info!(ticker = %ticker, "Selection unchanged");
        }
    }

    println!("{}: {}", set.key(), manager.serialized());
    Ok(())
}
