use std::path::PathBuf;

use clap::Parser;
use raftkv::{parse_config, Store};
use tokio::signal;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long)]
    conf_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = filter::filter_fn(|metadata| metadata.target().starts_with("raftkv"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::DEBUG))
        .init();

    let args = Args::parse();
    let config = parse_config(PathBuf::from(args.conf_path))?;

    let store = Store::create(config.store).await?;
    info!(
        node_name = %config.node_name,
        node_id = store.node_id(),
        address = %store.address(),
        "node running"
    );

    match signal::ctrl_c().await {
        Ok(()) => {}
        Err(e) => {
            warn!("Unable to listen for shutdown: {:?}", e)
        }
    }

    info!(status = ?store.status(), "shutting down");
    store.shutdown().await?;
    Ok(())
}
