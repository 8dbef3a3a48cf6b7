mod api;
mod config;
mod metrics;
mod pipelines;

use canton_rs::evm::{DepositWatcher, WithdrawalSubmitter};
use canton_rs::ledger::{templates, LedgerClient};
use canton_rs::types::EvmAddress;
use canton_rs::{amount, store};
use config::Config;
use eyre::WrapErr;
use pipelines::{
    DepositPipeline, DepositSettings, PipelineManager, ReadyState, RetryConfig,
    WithdrawalPipeline, WithdrawalSettings,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

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
        chain_id = config.ethereum.chain_id,
        synchronizer_id = %config.canton.synchronizer_id,
        "Starting Canton bridge relayer"
    );

    let db = store::create_pool(&config.database.url()).await?;
    store::run_migrations(&db).await?;
    tracing::info!("Database connected, migrations complete");

    let ledger = Arc::new(LedgerClient::connect(config.canton.ledger_config())?);
    let watcher = DepositWatcher::new(
        &config.ethereum.rpc_url,
        &config.ethereum.bridge_contract,
        config.ethereum.confirmation_blocks,
        config.ethereum.lookback_blocks,
    )?;
    let submitter = WithdrawalSubmitter::new(
        &config.ethereum.rpc_url,
        &config.ethereum.bridge_contract,
        &config.ethereum.relayer_private_key,
        config.ethereum.gas_limit,
        config.ethereum.max_gas_price,
    )?;

    // The configured retry delay seeds the exponential backoff; successive
    // attempts double it up to the cap.
    let retry = RetryConfig {
        max_retries: config.bridge.max_retries,
        initial_backoff: Duration::from_secs(config.bridge.retry_delay),
        max_backoff: Duration::from_secs(config.bridge.retry_delay.saturating_mul(16)),
        ..Default::default()
    };
    let min_amount = config
        .bridge
        .min_transfer_amount
        .as_deref()
        .map(amount::parse_units)
        .transpose()
        .wrap_err("invalid bridge.min_transfer_amount")?;
    let max_amount = config
        .bridge
        .max_transfer_amount
        .as_deref()
        .map(amount::parse_units)
        .transpose()
        .wrap_err("invalid bridge.max_transfer_amount")?;

    let ready = Arc::new(ReadyState::new());

    let deposit = DepositPipeline::new(
        db.clone(),
        watcher,
        ledger.clone(),
        DepositSettings {
            issuer_party: config.canton.relayer_party.clone(),
            bridge_admin_template: templates::bridge_admin(&config.canton.bridge_package_id),
            holding_template: templates::holding(&config.canton.cip56_package_id),
            token_contract: EvmAddress::from_hex(&config.ethereum.token_contract)?,
            start_block: config.ethereum.start_block,
            polling_interval: Duration::from_secs(config.ethereum.polling_interval),
            worker_count: config.bridge.worker_count,
            retry: retry.clone(),
            shutdown_timeout: Duration::from_secs(config.bridge.shutdown_timeout),
            min_amount,
            max_amount,
        },
        ready.deposit_flag(),
    );

    let withdrawal = WithdrawalPipeline::new(
        db.clone(),
        ledger,
        submitter,
        WithdrawalSettings {
            issuer_party: config.canton.relayer_party.clone(),
            withdrawal_template: templates::withdrawal_request(&config.canton.bridge_package_id),
            confirmation_offset: config.canton.confirmation_blocks,
            polling_interval: Duration::from_secs(config.canton.polling_interval),
            worker_count: config.bridge.worker_count,
            retry,
            shutdown_timeout: Duration::from_secs(config.bridge.shutdown_timeout),
        },
        ready.withdrawal_flag(),
    );

    // Shutdown fan-out: one channel per long-lived task.
    let (shutdown_tx1, shutdown_rx1) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx3, shutdown_rx3) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx1.send(()).await;
        let _ = shutdown_tx2.send(()).await;
        let _ = shutdown_tx3.send(()).await;
    });

    if config.monitoring.enabled {
        let api_addr =
            std::net::SocketAddr::from(([0, 0, 0, 0], config.monitoring.metrics_port));
        let state = api::AppState {
            db: db.clone(),
            ready: ready.clone(),
            started_at: Instant::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_addr, state, shutdown_rx3).await {
                tracing::error!(error = %e, "API server error");
            }
        });
    }

    metrics::UP.set(1.0);
    tracing::info!("Pipelines initialized, starting processing");

    let manager = PipelineManager::new(deposit, withdrawal);
    let result = manager.run(shutdown_rx1, shutdown_rx2).await;

    metrics::UP.set(0.0);
    tracing::info!("Canton bridge relayer stopped");
    result
}

fn init_logging(logging: &config::LoggingConfig) -> eyre::Result<()> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},canton_relayer=debug", logging.level)));

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
