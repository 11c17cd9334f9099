//! Service entry point: wire the store, resolver, stream controller, spill
//! task, and API server together and run until shutdown.

use anyhow::Result;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use polygraph::api::{self, AppState};
use polygraph::bus::AlertBus;
use polygraph::config::Config;
use polygraph::db::{self, SpillTask};
use polygraph::onchain::{abi, RpcClient};
use polygraph::resolver::MarketResolver;
use polygraph::store::EvidenceStore;
use polygraph::stream::StreamController;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = match Config::load(Path::new("polygraph.toml")) {
        Ok(c) => c,
        Err(_) => Config::from_env()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.level))
        .init();

    for (signature, ok) in abi::verify_topic_hashes() {
        if !ok {
            anyhow::bail!("event topic hash mismatch for {signature}");
        }
    }

    let pool = db::connect(&config.storage.db_path).await?;

    let bus = Arc::new(AlertBus::new());
    let store = Arc::new(EvidenceStore::new(
        config.storage.ring_trades,
        config.storage.ring_alerts,
        Arc::clone(&bus),
    ));

    let collateral = alloy::primitives::Address::from_str(&config.chain.collateral_address)
        .map_err(|e| anyhow::anyhow!("bad collateral address: {e}"))?;
    let resolver = Arc::new(MarketResolver::new(
        config.chain.gamma_url.clone(),
        collateral,
        Some(pool.clone()),
    ));
    resolver.load_cached().await?;

    // Catalog warm-up runs in the background so a slow Gamma API cannot
    // block startup.
    {
        let resolver = Arc::clone(&resolver);
        tokio::spawn(async move {
            if let Err(e) = resolver.load_active_markets().await {
                warn!(error = %e, "active market preload failed");
            }
        });
    }

    let rpc = Arc::new(RpcClient::connect(&config.chain.rpc_url)?);
    match rpc.get_block_number().await {
        Ok(block) => info!(block, "connected to Polygon upstream"),
        Err(e) => warn!(error = %e, "Polygon upstream unreachable at startup"),
    }

    let controller = Arc::new(StreamController::new(
        &config,
        Arc::clone(&rpc),
        Arc::clone(&store),
        Arc::clone(&resolver),
        Arc::clone(&bus),
        pool.clone(),
    )?);

    let spill = SpillTask::new(
        pool.clone(),
        Arc::clone(&store),
        Duration::from_secs(config.storage.sync_interval_secs),
    );
    tokio::spawn(spill.run());

    controller.start(
        Duration::from_secs_f64(config.stream.poll_interval_secs),
        config.stream.blocks_per_poll,
    );

    let state = AppState {
        store,
        resolver,
        controller,
        bus,
        pool,
    };
    api::serve(state, &config.api.bind).await
}
