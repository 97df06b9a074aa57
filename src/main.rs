//! Discovers, probes and curates third-party DERP relays into a relay-map
//! document, following the `refetch`/`recheck`/HTTP-surface shape of
//! `internal/derperer/map.go` and `derperer/map.go`.

mod assets;
mod config;
mod error;
mod http;
mod normalize;
mod prober;
mod registry;
mod relay;
mod relay_map;
mod scheduler;
mod unit;

use std::process::ExitCode;
use std::sync::{Arc, RwLock};

use clap::Parser;
use tokio_util::sync::CancellationToken;

use assets::AssetSource;
use assets::fofa::FofaAssetSource;
use config::Args;
use normalize::Normalizer;
use prober::Prober;
use registry::Registry;
use scheduler::{Scheduler, SharedConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match config::load(&args) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let listen_addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(%err, "invalid listen address");
            return ExitCode::FAILURE;
        }
    };

    let normalizer = match Normalizer::from_system_conf() {
        Ok(normalizer) => Arc::new(normalizer),
        Err(err) => {
            tracing::error!(%err, "failed to build DNS resolver");
            return ExitCode::FAILURE;
        }
    };

    let registry = Arc::new(Registry::new());
    let asset_source: Arc<dyn AssetSource> = Arc::new(FofaAssetSource::new(
        config.fofa_email.clone(),
        config.fofa_key.clone(),
    ));
    let prober = Arc::new(Prober::with_tcp());
    let shared_config: SharedConfig = Arc::new(RwLock::new(config));

    let scheduler = Arc::new(Scheduler::new(
        shared_config.clone(),
        registry.clone(),
        asset_source,
        normalizer,
        prober,
    ));

    let cancel = CancellationToken::new();

    let scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    let state = http::AppState {
        registry,
        config: shared_config,
    };
    let app = http::build_router(state);

    tracing::info!(%listen_addr, "starting HTTP surface");
    let server = axum::Server::bind(&listen_addr).serve(app.into_make_service());

    let shutdown_cancel = cancel.clone();
    let graceful = server.with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        shutdown_cancel.cancel();
    });

    let exit_code = match graceful.await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "HTTP server error");
            cancel.cancel();
            ExitCode::FAILURE
        }
    };

    let _ = scheduler_handle.await;
    exit_code
}
