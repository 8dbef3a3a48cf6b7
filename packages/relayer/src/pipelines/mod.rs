//! The relay engine: one pipeline per direction plus the shared readiness
//! signal consumed by the /ready probe.

use eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

pub mod deposit;
pub mod retry;
pub mod withdrawal;

pub use deposit::{DepositPipeline, DepositSettings};
pub use retry::RetryConfig;
pub use withdrawal::{WithdrawalPipeline, WithdrawalSettings};

/// Readiness is reached once each pipeline has caught up to the live head
/// at least once.
#[derive(Default)]
pub struct ReadyState {
    deposits: Arc<AtomicBool>,
    withdrawals: Arc<AtomicBool>,
}

impl ReadyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit_flag(&self) -> Arc<AtomicBool> {
        self.deposits.clone()
    }

    pub fn withdrawal_flag(&self) -> Arc<AtomicBool> {
        self.withdrawals.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.deposits.load(Ordering::Relaxed) && self.withdrawals.load(Ordering::Relaxed)
    }
}

/// Runs both pipelines and surfaces the first failure.
pub struct PipelineManager {
    deposit: DepositPipeline,
    withdrawal: WithdrawalPipeline,
}

impl PipelineManager {
    pub fn new(deposit: DepositPipeline, withdrawal: WithdrawalPipeline) -> Self {
        Self {
            deposit,
            withdrawal,
        }
    }

    /// Run until both pipelines return (shutdown) or one fails.
    pub async fn run(
        self,
        deposit_shutdown: mpsc::Receiver<()>,
        withdrawal_shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        let mut join_set = JoinSet::new();
        join_set.spawn(self.deposit.run(deposit_shutdown));
        join_set.spawn(self.withdrawal.run(withdrawal_shutdown));

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "A pipeline stopped with error");
                    join_set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "A pipeline task panicked");
                    join_set.abort_all();
                    return Err(eyre::eyre!("pipeline task panicked: {e}"));
                }
            }
        }
        info!("Pipelines stopped");
        Ok(())
    }
}
