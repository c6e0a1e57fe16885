//! Binary entry point: loads configuration, seeds the profile store
//! from the environment and runs one engine instance until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mm_common::ActivityLog;
use mm_engine::config::EngineConfig;
use mm_engine::credentials::{Profile, StaticProfileStore};
use mm_engine::engine::{MmEngine, MmEngineDeps};
use mm_engine::registry::{InstanceKind, InstanceRegistry};
use mm_engine::router::HttpRouter;
use mm_engine::settlement::{AlloyChainClient, SettlementManager};
use mm_engine::sniper::{SniperEngine, SniperEngineDeps};
use mm_market::{
    BookStream, BookStreamConfig, FinderConfig, HttpCandleSource, HttpCatalog, HttpSpotQuote,
    MarketFinder, MetadataCache, SpotPriceStream, SpotStreamConfig,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "mm-engine", about = "Quoting engine for short-window binary crypto markets")]
struct Cli {
    /// Path to a TOML config file. Without it the mode preset is used.
    #[arg(long)]
    config: Option<String>,

    /// Window mode override (5m or 15m).
    #[arg(long)]
    mode: Option<String>,

    /// Comma-separated asset override (e.g. BTC,ETH).
    #[arg(long, value_delimiter = ',')]
    assets: Option<Vec<String>>,

    /// Profile id to run under.
    #[arg(long, default_value = "default")]
    profile: String,

    /// Engine variant: "mm" or "sniper".
    #[arg(long, default_value = "mm")]
    engine: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::preset_15m(),
    };
    config.apply_env_overrides();
    config.apply_cli_overrides(cli.mode.clone(), cli.assets.clone());
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let kind = match cli.engine.as_str() {
        "mm" => InstanceKind::MarketMaker,
        "sniper" => InstanceKind::Sniper,
        other => bail!("unknown engine variant: {other} (expected mm or sniper)"),
    };
    info!(mode = %config.mode, kind = %kind, profile = %cli.profile, "starting");

    let store = StaticProfileStore::new();
    store.insert(profile_from_env(&cli.profile)?);
    let registry = Arc::new(InstanceRegistry::new(Arc::new(store)));

    let launch_config = config.clone();
    registry
        .start(&cli.profile, kind, move |profile, shutdown| async move {
            run_instance(launch_config, profile, kind, shutdown).await;
        })
        .await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    registry.stop_all().await;
    Ok(())
}

/// Build one instance's collaborators and drive its loop to completion.
async fn run_instance(
    config: EngineConfig,
    profile: Profile,
    kind: InstanceKind,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let router = Arc::new(HttpRouter::new(
        &config.endpoints.clob_rest,
        &profile,
        HTTP_TIMEOUT,
    ));
    let catalog = Arc::new(HttpCatalog::new(&config.endpoints.catalog, HTTP_TIMEOUT));
    let candles = Arc::new(HttpCandleSource::new(
        &config.endpoints.exchange_rest,
        HTTP_TIMEOUT,
    ));
    let spot_quote = Arc::new(HttpSpotQuote::new(
        &config.endpoints.exchange_rest,
        HTTP_TIMEOUT,
    ));
    let metadata = Arc::new(MetadataCache::new(&config.endpoints.clob_rest, HTTP_TIMEOUT));
    let activity = Arc::new(ActivityLog::new(1024));

    let chain = match AlloyChainClient::new(
        profile.private_key.clone(),
        config.endpoints.rpc_endpoints.clone(),
    ) {
        Ok(chain) => Arc::new(chain),
        Err(e) => {
            error!("settlement client init failed: {e}");
            return;
        }
    };
    let settlement = SettlementManager::new(chain);

    let (book_handle, book_events) = BookStream::spawn(BookStreamConfig {
        ws_url: config.endpoints.clob_ws.clone(),
        ..BookStreamConfig::default()
    });
    let (spot_handle, spot_events) = SpotPriceStream::spawn(SpotStreamConfig {
        ws_url: config.endpoints.exchange_ws.clone(),
        assets: config.assets.clone(),
        ..SpotStreamConfig::default()
    });
    let spot_cache = spot_handle.cache();

    match kind {
        InstanceKind::MarketMaker => {
            let deps = MmEngineDeps {
                router,
                catalog,
                history: candles.clone(),
                candles,
                spot_quote,
                metadata,
                settlement,
                activity,
                spot_cache,
                book_events,
                spot_events,
                book_handle: Some(book_handle),
                spot_handle: Some(spot_handle),
            };
            MmEngine::new(config, deps).run(shutdown).await;
        }
        InstanceKind::Sniper => {
            let finder = MarketFinder::new(
                catalog,
                candles,
                FinderConfig::new(config.assets.clone(), config.mode),
            );
            let deps = SniperEngineDeps {
                router,
                finder,
                settlement,
                activity,
                spot_cache,
                book_events,
                spot_events,
                book_handle: Some(book_handle),
                spot_handle: Some(spot_handle),
            };
            SniperEngine::new(config.sniper, deps).run(shutdown).await;
        }
    }
}

/// Seed the running profile from the environment.
fn profile_from_env(profile_id: &str) -> Result<Profile> {
    let private_key =
        std::env::var("POLY_PRIVATE_KEY").context("POLY_PRIVATE_KEY must be set")?;
    let funder_address =
        std::env::var("POLY_FUNDER_ADDRESS").context("POLY_FUNDER_ADDRESS must be set")?;
    Ok(Profile {
        id: profile_id.to_string(),
        private_key,
        funder_address,
        api_key: std::env::var("POLY_API_KEY").unwrap_or_default(),
        api_secret: std::env::var("POLY_API_SECRET").unwrap_or_default(),
        api_passphrase: std::env::var("POLY_API_PASSPHRASE").unwrap_or_default(),
        active: true,
    })
}
