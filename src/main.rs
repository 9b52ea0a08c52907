use anyhow::{Context, Result};
use std::sync::Arc;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use consentd::{
    config::{Cli, Command, Config},
    consent::{ConsentService, ServiceOptions},
    directory::StaticDirectory,
    events::StatusEventsHandle,
    state::JsonSnapshotStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::CheckConfig => check_config(&cli.config),
    }
}

fn load_directory(config: &Config) -> Result<StaticDirectory> {
    let path = config
        .directory_file
        .as_ref()
        .context("--directory-file is required")?;
    StaticDirectory::load(path)
        .with_context(|| format!("load directory file {}", path.display()))
}

fn check_config(config: &Config) -> Result<()> {
    let quorum = config.quorum_defaults()?;
    let directory = load_directory(config)?;
    println!(
        "ok: {} directory entries, quorum {}/{}, access window {}s",
        directory.len(),
        quorum.required_confirmations,
        quorum.nodes.len(),
        config.access_window_secs
    );
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let quorum_defaults = config.quorum_defaults()?;
    let directory = load_directory(&config)?;
    let store = JsonSnapshotStore::load_or_init(&config.data_dir)?;
    let service = Arc::new(ConsentService::new(
        store,
        Arc::new(directory),
        StatusEventsHandle::new(),
        ServiceOptions {
            access_window: config.access_window(),
            quorum_defaults,
        },
    )?);

    let sweeper =
        consentd::lifecycle::spawn_expiry_sweeper(service.clone(), config.expiry_sweep_interval());

    let app = consentd::http::build_router(config.clone(), service.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        requests = service.len().await,
        simulate_validators = config.simulate_validators,
        "starting consentd"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
