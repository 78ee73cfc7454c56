use std::{
    net::SocketAddr,
    sync::Arc,
};

use clap::Parser;
use common::env::config_service;
use controller::{
    cleaner::Cleaner,
    smpc::HttpSmpcCluster,
    Controller,
    SmpcSettings,
};
use controller_api::{
    router,
    ApiState,
};
use landscape::LandscapeAggregator;
use worker_client::HttpTaskChannel;

const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_NO_WORKERS: i32 = 3;

#[derive(Parser, Debug)]
#[command(about = "Federated analytics controller")]
struct Config {
    /// Address the HTTP facade listens on.
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:5000")]
    listen_address: SocketAddr,

    /// Comma-separated queue addresses of the federation's workers.
    #[arg(long, env = "WORKER_ADDRESSES", value_delimiter = ',')]
    worker_addresses: Vec<String>,
}

fn main() {
    config_service();
    let config = Config::parse();
    if config.worker_addresses.is_empty() {
        tracing::error!("No worker addresses configured");
        std::process::exit(EXIT_CONFIG_ERROR);
    }
    tracing::info!("Starting controller with config {config:?}");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Could not build the runtime: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        },
    };
    if let Err(e) = runtime.block_on(run(config)) {
        tracing::error!("Controller failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let channel = Arc::new(HttpTaskChannel::new());
    let aggregator = Arc::new(LandscapeAggregator::new(
        channel.clone(),
        config.worker_addresses.clone(),
    ));

    // First scan before serving: a federation where no worker answers is
    // a deployment problem, not something to retry silently.
    aggregator.update_once().await;
    if aggregator.snapshot().node_registry.workers().next().is_none() {
        tracing::error!(
            "None of the configured workers responded: {:?}",
            config.worker_addresses
        );
        std::process::exit(EXIT_NO_WORKERS);
    }

    let (cleanup_events, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let cleaner = Cleaner::from_knobs(channel.clone());
    let (algorithms, _udf_registry) = algorithms::default_registries()?;
    let controller = Controller::new(
        channel.clone(),
        aggregator.clone(),
        Arc::new(HttpSmpcCluster::from_knobs()),
        SmpcSettings::from_knobs(),
        algorithms,
        cleanup_events,
    );

    tokio::spawn(aggregator.run());
    tokio::spawn(cleaner.run(events_rx));

    let app = router(ApiState {
        controller: Arc::new(controller),
    });
    let listener = tokio::net::TcpListener::bind(config.listen_address).await?;
    tracing::info!("Listening on {}", config.listen_address);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
