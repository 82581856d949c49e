mod api;
mod api_server;
mod error;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::{Bridge, WorkerPool};
use crate::model::{load_model, ModelArgs};
use crate::params::DefaultsArgs;
use api_server::HttpOptions;

#[derive(Debug, clap::Args)]
pub struct ServeArgs {
    #[arg(long, env = "PALMA_BIND", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,
    #[arg(
        long,
        env = "PALMA_WORKERS",
        help = "Number of generation threads; bounds concurrent generations"
    )]
    pub workers: usize,
    #[command(flatten)]
    pub model: ModelArgs,
    #[command(flatten)]
    pub defaults: DefaultsArgs,
    #[arg(long, env = "PALMA_ACCESS_CONTROL_ALLOW_ORIGIN", default_value = "*")]
    pub access_control_allow_origin: String,
    #[arg(long, env = "PALMA_ACCESS_CONTROL_MAX_AGE", default_value = "86400")]
    pub access_control_max_age: String,
}

pub async fn serve_main(args: ServeArgs) -> anyhow::Result<()> {
    let defaults = args.defaults.to_defaults()?;
    let model = load_model(&args.model)?;
    let pool = WorkerPool::new(args.workers)?;
    let bridge = Arc::new(Bridge::new(model, pool, defaults));
    let app = api_server::router(
        bridge.clone(),
        &HttpOptions {
            allow_origin: args.access_control_allow_origin,
            max_age: args.access_control_max_age,
        },
    )?;

    let http_handle = axum_server::Handle::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
    let http = tokio::spawn(api_server::run_http(
        args.bind,
        http_handle.clone(),
        shutdown_complete_tx.clone(),
        app,
    ));
    drop(shutdown_complete_tx);

    let ret: anyhow::Result<()> = tokio::select! {
        ret = http => ret.map_err(|e| e.into()),
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received.");
            Ok(())
        }
    };
    if let Err(e) = ret {
        error!(%e);
    }

    info!("Shutting down...");
    http_handle.graceful_shutdown(Some(Duration::from_secs(30)));
    let _ = shutdown_complete_rx.recv().await;

    // In-flight generations are not cancelled; wait for them.
    match Arc::try_unwrap(bridge) {
        Ok(bridge) => {
            tokio::task::spawn_blocking(move || bridge.shutdown()).await?
        }
        Err(_) => warn!("Bridge still referenced; skipping worker join."),
    }
    info!("Shutdown complete.");
    Ok(())
}
