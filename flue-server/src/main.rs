use anyhow::{Context, Result};
use clap::Parser;
use flue_core::{load_model, DeviceMap};
use flue_server::{app, config::Args, AppState};
use hf_hub::api::tokio::Api;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let model = load_model(&args.model, Api::new()?, DeviceMap::from_cpu_flag(args.cpu)).await?;
    let state = AppState::new(args.credentials(), model);

    let bind_address = args.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "Started server");
    axum::serve(listener, app(state)).await?;

    Ok(())
}
