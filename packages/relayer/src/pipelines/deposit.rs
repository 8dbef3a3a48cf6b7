//! Deposit pipeline: EVM deposit events become ledger mints.
//!
//! Per deposit the state machine is
//! observed → confirming → submitted → completed, with `failed` terminal
//! after the retry budget and `orphaned` for reorged-away events. The mint
//! command id derives from `(tx hash, log index)`, so re-submission after a
//! crash lands on the participant's dedup key: at-most-once minting. The
//! cursor never advances past an open transfer: at-least-once minting.

use crate::metrics;
use crate::pipelines::retry::{decide, CircuitBreaker, RetryConfig, RetryDecision};
use bigdecimal::BigDecimal;
use canton_rs::error::{Error, ErrorKind, Result};
use canton_rs::evm::DepositWatcher;
use canton_rs::ledger::proto::Identifier;
use canton_rs::ledger::{codec, LedgerClient};
use canton_rs::store::{self, NewTransfer, Transfer};
use canton_rs::types::{Direction, EvmAddress, TokenSymbol, TransferStatus};
use canton_rs::{amount, hash};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

pub struct DepositSettings {
    pub issuer_party: String,
    pub bridge_admin_template: Identifier,
    pub holding_template: Identifier,
    pub token_contract: EvmAddress,
    pub start_block: u64,
    pub polling_interval: Duration,
    pub worker_count: usize,
    pub retry: RetryConfig,
    pub shutdown_timeout: Duration,
    pub min_amount: Option<BigDecimal>,
    pub max_amount: Option<BigDecimal>,
}

pub struct DepositPipeline {
    ctx: Arc<DepositCtx>,
}

struct DepositCtx {
    db: PgPool,
    watcher: DepositWatcher,
    ledger: Arc<LedgerClient>,
    settings: DepositSettings,
    /// Cached contract id of the issuer's bridge admin contract.
    admin_cid: Mutex<Option<String>>,
    last_safe_head: AtomicI64,
    ready: Arc<AtomicBool>,
}

impl DepositPipeline {
    pub fn new(
        db: PgPool,
        watcher: DepositWatcher,
        ledger: Arc<LedgerClient>,
        settings: DepositSettings,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ctx: Arc::new(DepositCtx {
                db,
                watcher,
                ledger,
                settings,
                admin_cid: Mutex::new(None),
                last_safe_head: AtomicI64::new(0),
                ready,
            }),
        }
    }

    /// Run the watcher loop and worker pool until shutdown.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> eyre::Result<()> {
        let ctx = self.ctx;
        let settings = &ctx.settings;

        store::ensure_cursor(
            &ctx.db,
            Direction::Inbound,
            settings.start_block.saturating_sub(1) as i64,
        )
        .await?;

        let (work_tx, work_rx) = mpsc::channel::<Transfer>(settings.worker_count * 4);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let mut workers = JoinSet::new();
        for _ in 0..settings.worker_count {
            let ctx = ctx.clone();
            let work_rx = work_rx.clone();
            workers.spawn(worker_loop(ctx, work_rx));
        }

        let mut ticker = tokio::time::interval(settings.polling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut breaker = CircuitBreaker::default();
        let mut cycle_count = 0u64;

        tracing::info!(
            start_block = settings.start_block,
            workers = settings.worker_count,
            poll_secs = settings.polling_interval.as_secs(),
            "Deposit pipeline starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, draining deposit workers");
                    drop(work_tx);
                    let drain = async { while workers.join_next().await.is_some() {} };
                    if tokio::time::timeout(ctx.settings.shutdown_timeout, drain).await.is_err() {
                        tracing::warn!("Deposit workers did not drain in time, aborting");
                        workers.abort_all();
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {
                    cycle_count += 1;
                    if cycle_count % 10 == 1 {
                        let counts = store::transfer_counts(&ctx.db, Direction::Inbound).await
                            .unwrap_or_default();
                        tracing::info!(
                            cycle = cycle_count,
                            observed = counts.observed,
                            confirming = counts.confirming,
                            submitted = counts.submitted,
                            failures = breaker.consecutive_failures(),
                            "Deposit pipeline heartbeat"
                        );
                    }
                    match ctx.cycle(&work_tx).await {
                        Ok(()) => {
                            // A full cycle covers (cursor, safe head]; the
                            // watcher has seen the live head at least once.
                            ctx.ready.store(true, Ordering::Relaxed);
                            breaker.record_success();
                            metrics::record_successful_poll("deposit");
                        }
                        Err(e) => {
                            metrics::record_error("deposit", e.kind().as_str());
                            tracing::error!(error = %e, "Deposit poll cycle failed");
                            if let Some(pause) = breaker.record_failure() {
                                tracing::warn!(
                                    pause_secs = pause.as_secs(),
                                    "Deposit circuit breaker tripped, pausing"
                                );
                                tokio::time::sleep(pause).await;
                            }
                        }
                    }
                    metrics::record_consecutive_failures("deposit", breaker.consecutive_failures());
                }
            }
        }
    }
}

impl DepositCtx {
    /// One poll cycle: scan confirmed deposits, persist them, revalidate
    /// the lookback window, advance the cursor, dispatch open work.
    async fn cycle(&self, work_tx: &mpsc::Sender<Transfer>) -> Result<()> {
        let settings = &self.settings;
        let cursor = store::cursor(&self.db, Direction::Inbound)
            .await?
            .unwrap_or(settings.start_block.saturating_sub(1) as i64);

        let scan = self.watcher.scan(cursor.max(0) as u64).await?;
        self.last_safe_head
            .store(scan.safe_head as i64, Ordering::Relaxed);
        metrics::record_safe_head("in", scan.safe_head as i64);

        for event in &scan.events {
            if event.token != settings.token_contract {
                tracing::warn!(
                    token = %event.token,
                    tx_hash = %event.tx_hash,
                    "Ignoring deposit of unknown token"
                );
                continue;
            }
            let amount = amount::from_base_units(event.amount);
            store::upsert_transfer(&self.db, &NewTransfer {
                direction: Direction::Inbound,
                source_tx_hash: event.source_key(),
                source_position: event.block_number as i64,
                recipient: event.recipient_fingerprint.as_hex(),
                token: TokenSymbol::Prompt,
                amount: amount::format_units(&amount),
                ledger_cid: None,
            })
            .await?;
            metrics::DEPOSITS_OBSERVED
                .with_label_values(&[TokenSymbol::Prompt.as_str()])
                .inc();
        }

        // Reorg policy: any open transfer inside the scanned window whose
        // event no longer appears in the canonical chain is orphaned and
        // never actioned.
        let scanned: HashSet<String> = scan.events.iter().map(|e| e.source_key()).collect();
        let open_in_window = store::open_transfers_in_window(
            &self.db,
            Direction::Inbound,
            scan.window_start as i64,
            scan.safe_head as i64,
        )
        .await?;
        for transfer in open_in_window {
            if scanned.contains(&transfer.source_tx_hash) {
                continue;
            }
            let (tx_hash, _) = split_source_key(&transfer.source_tx_hash)?;
            if !self
                .watcher
                .still_canonical(tx_hash, transfer.source_position as u64)
                .await?
            {
                tracing::warn!(
                    transfer_id = transfer.id,
                    source = %transfer.source_tx_hash,
                    block = transfer.source_position,
                    "Deposit dropped by chain reorganisation, orphaning"
                );
                store::mark_transfer_orphaned(&self.db, transfer.id).await?;
            }
        }

        // All events at or below the safe head are durably recorded now;
        // the store still caps the cursor below the earliest open transfer.
        let position = store::advance_cursor(&self.db, Direction::Inbound, scan.safe_head as i64)
            .await?;
        metrics::record_cursor("in", position);

        let open = store::open_transfers(
            &self.db,
            Direction::Inbound,
            (settings.worker_count * 4) as i64,
        )
        .await?;
        metrics::OPEN_TRANSFERS
            .with_label_values(&["in"])
            .set(open.len() as f64);
        for transfer in open {
            if !retry_due(&settings.retry, &transfer) {
                continue;
            }
            if work_tx.send(transfer).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn bridge_admin_cid(&self) -> Result<String> {
        let mut cache = self.admin_cid.lock().await;
        if let Some(cid) = &*cache {
            return Ok(cid.clone());
        }
        let mut contracts = self
            .ledger
            .active_contracts(
                &self.settings.issuer_party,
                vec![self.settings.bridge_admin_template.clone()],
            )
            .await?;
        while let Some(event) = contracts.next().await? {
            let matches = event
                .template_id
                .as_ref()
                .is_some_and(|t| t.same_entity(&self.settings.bridge_admin_template));
            if matches {
                *cache = Some(event.contract_id.clone());
                return Ok(event.contract_id);
            }
        }
        Err(Error::dependency(
            "bridge admin contract not found on the ledger",
        ))
    }

    async fn invalidate_admin_cid(&self) {
        *self.admin_cid.lock().await = None;
    }

    fn cursor_target(&self, transfer: &Transfer) -> i64 {
        let head = self.last_safe_head.load(Ordering::Relaxed);
        if head > 0 {
            head
        } else {
            transfer.source_position
        }
    }

    async fn process(&self, transfer: &Transfer) -> Result<()> {
        match transfer.status {
            TransferStatus::Observed => self.process_observed(transfer).await,
            TransferStatus::Confirming | TransferStatus::Submitted => {
                self.submit_mint(transfer).await
            }
            _ => Ok(()),
        }
    }

    async fn process_observed(&self, transfer: &Transfer) -> Result<()> {
        let amount = amount::parse_units(&transfer.amount)?;
        if let Some(min) = &self.settings.min_amount {
            if &amount < min {
                store::mark_transfer_failed(&self.db, transfer.id, "amount below minimum").await?;
                return Ok(());
            }
        }
        if let Some(max) = &self.settings.max_amount {
            if &amount > max {
                store::mark_transfer_failed(&self.db, transfer.id, "amount above maximum").await?;
                return Ok(());
            }
        }

        let user = store::user_by_fingerprint(&self.db, &transfer.recipient).await?;
        let has_party = user.as_ref().is_some_and(|u| u.canton_party.is_some());
        if !has_party {
            // Held, not failed: the user may register later. The open row
            // keeps the cursor pinned, which is what guarantees the mint
            // once registration happens.
            store::record_transfer_attempt(
                &self.db,
                transfer.id,
                "no registered user for recipient fingerprint",
            )
            .await?;
            return Ok(());
        }

        if !store::claim_transfer(
            &self.db,
            transfer.id,
            TransferStatus::Observed,
            TransferStatus::Confirming,
        )
        .await?
        {
            return Ok(());
        }
        let mut claimed = transfer.clone();
        claimed.status = TransferStatus::Confirming;
        self.submit_mint(&claimed).await
    }

    async fn submit_mint(&self, transfer: &Transfer) -> Result<()> {
        let user = store::user_by_fingerprint(&self.db, &transfer.recipient).await?;
        let Some(party) = user.and_then(|u| u.canton_party) else {
            store::record_transfer_attempt(
                &self.db,
                transfer.id,
                "no registered user for recipient fingerprint",
            )
            .await?;
            return Ok(());
        };

        let (tx_hash, log_index) = split_source_key(&transfer.source_tx_hash)?;
        let command_id = hash::deposit_command_id(tx_hash, log_index);

        if transfer.status == TransferStatus::Confirming
            && !store::claim_transfer(
                &self.db,
                transfer.id,
                TransferStatus::Confirming,
                TransferStatus::Submitted,
            )
            .await?
        {
            return Ok(());
        }

        let amount = amount::parse_units(&transfer.amount)?;
        let admin_cid = self.bridge_admin_cid().await?;
        let argument = codec::record_value(vec![
            ("recipient", codec::party(&party)),
            ("symbol", codec::text(transfer.token.as_str())),
            ("amount", codec::numeric(&amount)),
            ("transferId", codec::text(&transfer.source_tx_hash)),
        ]);

        match self
            .ledger
            .exercise(
                &self.settings.bridge_admin_template,
                &admin_cid,
                "Mint",
                argument,
                &self.settings.issuer_party,
                &command_id,
            )
            .await
        {
            Ok(ledger_tx) => {
                metrics::record_mint_submitted(true);
                let holding_cid = ledger_tx
                    .created(&self.settings.holding_template)
                    .next()
                    .map(|c| c.contract_id.clone());
                self.complete(transfer, holding_cid.as_deref()).await
            }
            Err(e) => {
                metrics::record_mint_submitted(false);
                self.handle_mint_error(transfer, e).await
            }
        }
    }

    async fn complete(&self, transfer: &Transfer, holding_cid: Option<&str>) -> Result<()> {
        let newly_completed = store::finalize_mint(
            &self.db,
            transfer.id,
            transfer.token,
            &transfer.amount,
            holding_cid,
            self.cursor_target(transfer),
        )
        .await?;
        if newly_completed {
            let elapsed = (chrono::Utc::now() - transfer.created_at).num_milliseconds();
            metrics::record_latency("in", elapsed as f64 / 1000.0);
            tracing::info!(
                transfer_id = transfer.id,
                source = %transfer.source_tx_hash,
                amount = %transfer.amount,
                holding_cid = ?holding_cid,
                "Deposit minted on the ledger"
            );
        }
        Ok(())
    }

    async fn handle_mint_error(&self, transfer: &Transfer, error: Error) -> Result<()> {
        metrics::record_error("deposit", error.kind().as_str());

        // A vanished admin contract means it was replaced; refetch and
        // treat the attempt as transient.
        if error.kind() == ErrorKind::NotFound {
            self.invalidate_admin_cid().await;
            return self.retry_or_fail(transfer, &error).await;
        }

        match decide(error.kind()) {
            RetryDecision::ResolveConflict => {
                // The command id was already consumed: the mint happened
                // (before a crash, or on a competing worker). Converge.
                tracing::info!(
                    transfer_id = transfer.id,
                    source = %transfer.source_tx_hash,
                    "Mint command id already accepted, treating as success"
                );
                self.complete(transfer, None).await
            }
            RetryDecision::Retry => self.retry_or_fail(transfer, &error).await,
            RetryDecision::Fail => {
                tracing::error!(
                    transfer_id = transfer.id,
                    source = %transfer.source_tx_hash,
                    error = %error,
                    "Mint failed terminally"
                );
                store::mark_transfer_failed(&self.db, transfer.id, &error.to_string()).await
            }
        }
    }

    async fn retry_or_fail(&self, transfer: &Transfer, error: &Error) -> Result<()> {
        let attempts =
            store::record_transfer_attempt(&self.db, transfer.id, &error.to_string()).await?;
        if self.settings.retry.attempts_exhausted(attempts) {
            tracing::error!(
                transfer_id = transfer.id,
                source = %transfer.source_tx_hash,
                attempts,
                error = %error,
                "Mint retries exhausted, marking failed"
            );
            store::mark_transfer_failed(&self.db, transfer.id, &error.to_string()).await?;
        } else {
            tracing::warn!(
                transfer_id = transfer.id,
                attempts,
                error = %error,
                "Mint attempt failed, will retry"
            );
        }
        Ok(())
    }
}

async fn worker_loop(ctx: Arc<DepositCtx>, work_rx: Arc<Mutex<mpsc::Receiver<Transfer>>>) {
    loop {
        let item = { work_rx.lock().await.recv().await };
        let Some(transfer) = item else { break };
        if let Err(e) = ctx.process(&transfer).await {
            tracing::warn!(
                transfer_id = transfer.id,
                error = %e,
                "Deposit worker error"
            );
        }
    }
}

/// Whether a previously-failed item has waited out its backoff.
/// Exponential per attempt, with a per-id spread so retries do not
/// stampede on the same tick.
fn retry_due(retry: &RetryConfig, transfer: &Transfer) -> bool {
    if transfer.attempts == 0 {
        return true;
    }
    let backoff = retry.backoff_for_attempt(transfer.attempts.saturating_sub(1) as u32);
    let jitter = (transfer.id % 10) as i64;
    let age = chrono::Utc::now() - transfer.updated_at;
    age.num_seconds() >= backoff.as_secs() as i64 + jitter
}

/// Split a `"tx_hash:log_index"` source key.
fn split_source_key(source: &str) -> Result<(&str, u64)> {
    let (tx_hash, log_index) = source
        .rsplit_once(':')
        .ok_or_else(|| Error::internal(format!("malformed source key {source:?}")))?;
    let log_index = log_index
        .parse()
        .map_err(|_| Error::internal(format!("malformed log index in {source:?}")))?;
    Ok((tx_hash, log_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_key_round_trip() {
        let (tx_hash, log_index) = split_source_key("0xabc:7").unwrap();
        assert_eq!(tx_hash, "0xabc");
        assert_eq!(log_index, 7);
    }

    #[test]
    fn malformed_source_key_rejected() {
        assert!(split_source_key("no-separator").is_err());
        assert!(split_source_key("0xabc:not-a-number").is_err());
    }
}
