mod config;
mod reconciler;
mod registration;
mod server;
mod signature;

use canton_rs::keystore::{KeyStore, MasterKey};
use canton_rs::ledger::{templates, LedgerClient};
use canton_rs::store;
use config::Config;
use eyre::{eyre, WrapErr};
use reconciler::Reconciler;
use registration::{KeyDerivation, RegistrationService};
use std::sync::Arc;
use std::time::Duration;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging)?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting Canton bridge API server"
    );

    let db = store::create_pool(&config.database.url()).await?;
    store::run_migrations(&db).await?;
    tracing::info!("Database connected, migrations complete");

    // A malformed or absent master key is fatal at startup.
    let master = MasterKey::from_env(&config.key_management.master_key_env)
        .map_err(|e| eyre!("{e}"))?;
    let keystore = Arc::new(KeyStore::new(db.clone(), master));

    let ledger = Arc::new(LedgerClient::connect(config.canton.ledger_config())?);

    let derivation = match config.key_management.key_derivation.as_str() {
        "derive" => {
            let raw = std::env::var(&config.key_management.seed_env).wrap_err_with(|| {
                format!(
                    "{} is required when key_derivation = derive",
                    config.key_management.seed_env
                )
            })?;
            let seed = hex::decode(raw.strip_prefix("0x").unwrap_or(&raw))
                .wrap_err("derivation seed must be hex")?;
            KeyDerivation::Derive { seed }
        }
        _ => KeyDerivation::Generate,
    };

    let registration = Arc::new(RegistrationService::new(
        db.clone(),
        keystore,
        ledger.clone(),
        config.canton.relayer_party.clone(),
        templates::bridge_admin(&config.canton.bridge_package_id),
        templates::fingerprint_mapping(&config.canton.common_package_id),
        derivation,
        config.registration.verify_ledger_signature,
    ));

    let reconciler = Reconciler::new(
        db,
        ledger,
        config.canton.relayer_party.clone(),
        templates::holding(&config.canton.cip56_package_id),
        Duration::from_secs(config.reconciliation.interval),
        Duration::from_secs(config.reconciliation.initial_timeout),
    );

    let (shutdown_tx1, shutdown_rx1) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx1.send(()).await;
        let _ = shutdown_tx2.send(()).await;
    });

    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx2));

    let addr: std::net::SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .wrap_err("invalid server.host/server.port")?;
    let state = server::AppState { registration };
    server::serve(
        addr,
        state,
        Duration::from_secs(config.server.read_timeout),
        shutdown_rx1,
    )
    .await?;

    match reconciler_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Reconciler stopped with error"),
        Err(e) => tracing::error!(error = %e, "Reconciler task panicked"),
    }
    tracing::info!("Canton bridge API server stopped");
    Ok(())
}

fn init_logging(logging: &config::LoggingConfig) -> eyre::Result<()> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},canton_api=debug", logging.level)));

    let writer = match &logging.output_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("failed to open log file {path}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let fmt_layer = if logging.format == "json" {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_target(true).with_writer(writer).boxed()
    };

    tracing_subscriber::registry().with(fmt_layer).with(filter).init();
    Ok(())
}

/// Wait for shutdown signals (SIGINT/SIGTERM).
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
