//! Withdrawal pipeline: ledger burns become EVM completion transactions.
//!
//! Burns surface as `WithdrawalRequest` contracts on the update stream;
//! each becomes a transfer keyed by `(update id, node id)`. The completion
//! transaction carries the derived burn id as its contract-side idempotency
//! key, and after a successful receipt the on-ledger request is marked
//! completed so it cannot be paid out twice. The ledger offset cursor only
//! advances past completed or failed records.

use crate::metrics;
use crate::pipelines::retry::{decide, CircuitBreaker, RetryConfig, RetryDecision};
use canton_rs::error::{Error, ErrorKind, Result};
use canton_rs::evm::WithdrawalSubmitter;
use canton_rs::ledger::proto::{CreatedEvent, Identifier, Transaction};
use canton_rs::ledger::{codec, LedgerClient};
use canton_rs::store::{self, NewTransfer, Transfer};
use canton_rs::types::{Direction, EvmAddress, TokenSymbol, TransferStatus};
use canton_rs::{amount, hash};
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

pub struct WithdrawalSettings {
    pub issuer_party: String,
    pub withdrawal_template: Identifier,
    /// Offsets below the ledger end before a burn is eligible.
    pub confirmation_offset: i64,
    pub polling_interval: Duration,
    pub worker_count: usize,
    pub retry: RetryConfig,
    pub shutdown_timeout: Duration,
}

pub struct WithdrawalPipeline {
    ctx: Arc<WithdrawalCtx>,
}

struct WithdrawalCtx {
    db: PgPool,
    ledger: Arc<LedgerClient>,
    submitter: WithdrawalSubmitter,
    settings: WithdrawalSettings,
    last_safe_offset: AtomicI64,
    ready: Arc<AtomicBool>,
}

impl WithdrawalPipeline {
    pub fn new(
        db: PgPool,
        ledger: Arc<LedgerClient>,
        submitter: WithdrawalSubmitter,
        settings: WithdrawalSettings,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ctx: Arc::new(WithdrawalCtx {
                db,
                ledger,
                submitter,
                settings,
                last_safe_offset: AtomicI64::new(0),
                ready,
            }),
        }
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> eyre::Result<()> {
        let ctx = self.ctx;
        let settings = &ctx.settings;

        store::ensure_cursor(&ctx.db, Direction::Outbound, 0).await?;

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
            workers = settings.worker_count,
            poll_secs = settings.polling_interval.as_secs(),
            "Withdrawal pipeline starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, draining withdrawal workers");
                    drop(work_tx);
                    let drain = async { while workers.join_next().await.is_some() {} };
                    if tokio::time::timeout(ctx.settings.shutdown_timeout, drain).await.is_err() {
                        tracing::warn!("Withdrawal workers did not drain in time, aborting");
                        workers.abort_all();
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {
                    cycle_count += 1;
                    if cycle_count % 10 == 1 {
                        let counts = store::transfer_counts(&ctx.db, Direction::Outbound).await
                            .unwrap_or_default();
                        tracing::info!(
                            cycle = cycle_count,
                            observed = counts.observed,
                            confirming = counts.confirming,
                            submitted = counts.submitted,
                            failures = breaker.consecutive_failures(),
                            "Withdrawal pipeline heartbeat"
                        );
                    }
                    match ctx.cycle(&work_tx).await {
                        Ok(()) => {
                            // The catch-up stream reached the confirmed
                            // ledger end; this pipeline has seen the live
                            // head at least once.
                            ctx.ready.store(true, Ordering::Relaxed);
                            breaker.record_success();
                            metrics::record_successful_poll("withdrawal");
                        }
                        Err(e) => {
                            metrics::record_error("withdrawal", e.kind().as_str());
                            tracing::error!(error = %e, "Withdrawal poll cycle failed");
                            if let Some(pause) = breaker.record_failure() {
                                tracing::warn!(
                                    pause_secs = pause.as_secs(),
                                    "Withdrawal circuit breaker tripped, pausing"
                                );
                                tokio::time::sleep(pause).await;
                            }
                        }
                    }
                    metrics::record_consecutive_failures("withdrawal", breaker.consecutive_failures());
                }
            }
        }
    }
}

impl WithdrawalCtx {
    async fn cycle(&self, work_tx: &mpsc::Sender<Transfer>) -> Result<()> {
        let settings = &self.settings;
        let ledger_end = self.ledger.ledger_end().await?;
        let safe = (ledger_end - settings.confirmation_offset).max(0);
        self.last_safe_offset.store(safe, Ordering::Relaxed);
        metrics::record_safe_head("out", safe);

        let cursor = store::cursor(&self.db, Direction::Outbound).await?.unwrap_or(0);

        if safe > cursor {
            let mut updates = self
                .ledger
                .updates(
                    &settings.issuer_party,
                    cursor,
                    Some(safe),
                    vec![settings.withdrawal_template.clone()],
                )
                .await?;
            while let Some(transaction) = updates.next().await? {
                self.record_burns(&transaction).await?;
            }
            // The catch-up bound was reached with every burn durably
            // recorded; the store caps the cursor below open transfers.
            let position = store::advance_cursor(&self.db, Direction::Outbound, safe).await?;
            metrics::record_cursor("out", position);
        }

        let open = store::open_transfers(
            &self.db,
            Direction::Outbound,
            (settings.worker_count * 4) as i64,
        )
        .await?;
        metrics::OPEN_TRANSFERS
            .with_label_values(&["out"])
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

    async fn record_burns(&self, transaction: &Transaction) -> Result<()> {
        for created in transaction.created(&self.settings.withdrawal_template) {
            match parse_withdrawal(created) {
                Ok((dest_address, token, amount)) => {
                    store::upsert_transfer(&self.db, &NewTransfer {
                        direction: Direction::Outbound,
                        source_tx_hash: format!("{}:{}", transaction.update_id, created.node_id),
                        source_position: transaction.offset,
                        recipient: dest_address,
                        token,
                        amount: amount::format_units(&amount),
                        ledger_cid: Some(created.contract_id.clone()),
                    })
                    .await?;
                    metrics::BURNS_OBSERVED
                        .with_label_values(&[token.as_str()])
                        .inc();
                    tracing::info!(
                        update_id = %transaction.update_id,
                        node_id = created.node_id,
                        offset = transaction.offset,
                        token = %token,
                        "New withdrawal request observed"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        update_id = %transaction.update_id,
                        node_id = created.node_id,
                        error = %e,
                        "Failed to decode withdrawal request"
                    );
                }
            }
        }
        Ok(())
    }

    fn cursor_target(&self, transfer: &Transfer) -> i64 {
        let offset = self.last_safe_offset.load(Ordering::Relaxed);
        if offset > 0 {
            offset
        } else {
            transfer.source_position
        }
    }

    async fn process(&self, transfer: &Transfer) -> Result<()> {
        match transfer.status {
            TransferStatus::Observed => {
                if store::claim_transfer(
                    &self.db,
                    transfer.id,
                    TransferStatus::Observed,
                    TransferStatus::Confirming,
                )
                .await?
                {
                    let mut claimed = transfer.clone();
                    claimed.status = TransferStatus::Confirming;
                    self.submit_completion(&claimed).await
                } else {
                    Ok(())
                }
            }
            TransferStatus::Confirming => self.submit_completion(transfer).await,
            TransferStatus::Submitted => self.check_receipt(transfer).await,
            _ => Ok(()),
        }
    }

    /// Submit the EVM completion transaction, unless the contract already
    /// recorded one for this burn (crash recovery).
    async fn submit_completion(&self, transfer: &Transfer) -> Result<()> {
        let burn_id = self.burn_id_of(transfer)?;
        let to = match EvmAddress::from_hex(&transfer.recipient) {
            Ok(address) => address,
            Err(e) => {
                store::mark_transfer_failed(&self.db, transfer.id, &e.to_string()).await?;
                return Ok(());
            }
        };
        let units = amount::to_base_units(&amount::parse_units(&transfer.amount)?)?;

        match self.submitter.is_completed(burn_id).await {
            Ok(true) => {
                // Paid out before a crash; converge without re-sending.
                if store::claim_transfer(
                    &self.db,
                    transfer.id,
                    transfer.status,
                    TransferStatus::Submitted,
                )
                .await?
                {
                    return self.mark_ledger_completed(transfer, None).await;
                }
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => return self.retry_or_fail(transfer, &e).await,
        }

        if !store::claim_transfer(
            &self.db,
            transfer.id,
            transfer.status,
            TransferStatus::Submitted,
        )
        .await?
        {
            return Ok(());
        }

        match self.submitter.send_withdrawal(to, units, burn_id).await {
            Ok(tx_hash) => {
                metrics::record_completion_submitted(true);
                store::set_transfer_completion_ref(&self.db, transfer.id, &tx_hash).await?;
                store::record_evm_transaction(&self.db, transfer.id, &tx_hash, "submitted").await?;
                tracing::info!(
                    transfer_id = transfer.id,
                    tx_hash = %tx_hash,
                    amount = %transfer.amount,
                    "Completion transaction submitted"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_completion_submitted(false);
                metrics::record_error("withdrawal", e.kind().as_str());
                self.retry_or_fail(transfer, &e).await
            }
        }
    }

    /// Poll the receipt of a submitted completion; on success, archive the
    /// on-ledger request and finalize.
    async fn check_receipt(&self, transfer: &Transfer) -> Result<()> {
        let Some(tx_hash) = transfer.completion_ref.clone() else {
            // Crashed between the claim and the send; the contract knows
            // whether the burn was paid out.
            let burn_id = self.burn_id_of(transfer)?;
            if self.submitter.is_completed(burn_id).await? {
                return self.mark_ledger_completed(transfer, None).await;
            }
            // submit_completion re-claims submitted → submitted, which is
            // how the lost transaction gets re-sent.
            return self.submit_completion(transfer).await;
        };

        match self.submitter.receipt_of(&tx_hash).await? {
            None => Ok(()), // still pending
            Some(receipt) if receipt.success => {
                store::update_evm_transaction(
                    &self.db,
                    &tx_hash,
                    "confirmed",
                    Some(receipt.gas_used as i64),
                )
                .await?;
                self.mark_ledger_completed(transfer, Some(&tx_hash)).await
            }
            Some(_) => {
                // A reverted completion is a permanent failure of this
                // submission.
                store::update_evm_transaction(&self.db, &tx_hash, "failed", None).await?;
                tracing::error!(
                    transfer_id = transfer.id,
                    tx_hash = %tx_hash,
                    "Completion transaction reverted"
                );
                store::mark_transfer_failed(&self.db, transfer.id, "completion reverted").await
            }
        }
    }

    /// Exercise `MarkCompleted` on the withdrawal request so it cannot be
    /// re-submitted, then finalize the transfer. An already-archived
    /// request surfaces as `conflict`/`not-found` and counts as success.
    async fn mark_ledger_completed(
        &self,
        transfer: &Transfer,
        evm_tx_hash: Option<&str>,
    ) -> Result<()> {
        let Some(ledger_cid) = &transfer.ledger_cid else {
            return Err(Error::internal(format!(
                "withdrawal transfer {} has no ledger contract id",
                transfer.id
            )));
        };
        let (update_id, node_id) = split_source_key(&transfer.source_tx_hash)?;
        let command_id = hash::completion_command_id(update_id, node_id);
        let reference = evm_tx_hash
            .map(str::to_string)
            .or_else(|| transfer.completion_ref.clone())
            .unwrap_or_else(|| format!("burn:{}", hex::encode(self.burn_id_of(transfer).unwrap_or_default())));

        let argument = codec::record_value(vec![("txHash", codec::text(&reference))]);
        let result = self
            .ledger
            .exercise(
                &self.settings.withdrawal_template,
                ledger_cid,
                "MarkCompleted",
                argument,
                &self.settings.issuer_party,
                &command_id,
            )
            .await;

        match result {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::NotFound) => {
                tracing::debug!(
                    transfer_id = transfer.id,
                    "Withdrawal request already archived, continuing"
                );
            }
            Err(e) => return self.retry_or_fail(transfer, &e).await,
        }

        let newly_completed = store::finalize_withdrawal(
            &self.db,
            transfer.id,
            transfer.token,
            &transfer.amount,
            &reference,
            self.cursor_target(transfer),
        )
        .await?;
        if newly_completed {
            let elapsed = (chrono::Utc::now() - transfer.created_at).num_milliseconds();
            metrics::record_latency("out", elapsed as f64 / 1000.0);
            tracing::info!(
                transfer_id = transfer.id,
                source = %transfer.source_tx_hash,
                amount = %transfer.amount,
                completion = %reference,
                "Withdrawal completed on the EVM chain"
            );
        }
        Ok(())
    }

    fn burn_id_of(&self, transfer: &Transfer) -> Result<[u8; 32]> {
        let (update_id, node_id) = split_source_key(&transfer.source_tx_hash)?;
        Ok(hash::burn_id(update_id, node_id))
    }

    async fn retry_or_fail(&self, transfer: &Transfer, error: &Error) -> Result<()> {
        match decide(error.kind()) {
            RetryDecision::Retry | RetryDecision::ResolveConflict => {
                let attempts =
                    store::record_transfer_attempt(&self.db, transfer.id, &error.to_string())
                        .await?;
                if self.settings.retry.attempts_exhausted(attempts) {
                    tracing::error!(
                        transfer_id = transfer.id,
                        source = %transfer.source_tx_hash,
                        attempts,
                        error = %error,
                        "Withdrawal retries exhausted, marking failed"
                    );
                    store::mark_transfer_failed(&self.db, transfer.id, &error.to_string()).await?;
                } else {
                    tracing::warn!(
                        transfer_id = transfer.id,
                        attempts,
                        error = %error,
                        "Withdrawal attempt failed, will retry"
                    );
                }
                Ok(())
            }
            RetryDecision::Fail => {
                tracing::error!(
                    transfer_id = transfer.id,
                    source = %transfer.source_tx_hash,
                    error = %error,
                    "Withdrawal failed terminally"
                );
                store::mark_transfer_failed(&self.db, transfer.id, &error.to_string()).await
            }
        }
    }
}

async fn worker_loop(ctx: Arc<WithdrawalCtx>, work_rx: Arc<Mutex<mpsc::Receiver<Transfer>>>) {
    loop {
        let item = { work_rx.lock().await.recv().await };
        let Some(transfer) = item else { break };
        if let Err(e) = ctx.process(&transfer).await {
            tracing::warn!(
                transfer_id = transfer.id,
                error = %e,
                "Withdrawal worker error"
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

fn parse_withdrawal(created: &CreatedEvent) -> Result<(String, TokenSymbol, bigdecimal::BigDecimal)> {
    let arguments = created
        .create_arguments
        .as_ref()
        .ok_or_else(|| Error::corrupt("withdrawal request has no payload"))?;
    let dest_address = codec::field_text(arguments, "destAddress")?;
    let symbol = codec::field_text(arguments, "symbol")?;
    let token = TokenSymbol::from_str(&symbol)?;
    let amount = codec::field_numeric(arguments, "amount")?;
    Ok((dest_address.to_lowercase(), token, amount))
}

/// Split an `"update_id:node_id"` source key.
fn split_source_key(source: &str) -> Result<(&str, u64)> {
    let (update_id, node_id) = source
        .rsplit_once(':')
        .ok_or_else(|| Error::internal(format!("malformed source key {source:?}")))?;
    let node_id = node_id
        .parse()
        .map_err(|_| Error::internal(format!("malformed node id in {source:?}")))?;
    Ok((update_id, node_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canton_rs::ledger::proto::{Identifier, Record};

    fn withdrawal_event(dest: &str, symbol: &str, amount: &str) -> CreatedEvent {
        let arguments: Record = codec::record(vec![
            ("issuer", codec::party("issuer::1220aa")),
            ("owner", codec::party("user_f39f::1220bb")),
            ("destAddress", codec::text(dest)),
            ("symbol", codec::text(symbol)),
            (
                "amount",
                codec::numeric(&amount::parse_units(amount).unwrap()),
            ),
        ]);
        CreatedEvent {
            contract_id: "cid-withdrawal-1".into(),
            template_id: Some(Identifier {
                package_id: "pkg".into(),
                module_name: "Bridge.Custody".into(),
                entity_name: "WithdrawalRequest".into(),
            }),
            create_arguments: Some(arguments),
            node_id: 2,
        }
    }

    #[test]
    fn parses_withdrawal_payload() {
        let event = withdrawal_event("0x70997970C51812dc3A010C7d01b50e0d17dc79C8", "PROMPT", "10");
        let (dest, token, amount) = parse_withdrawal(&event).unwrap();
        assert_eq!(dest, "0x70997970c51812dc3a010c7d01b50e0d17dc79c8");
        assert_eq!(token, TokenSymbol::Prompt);
        assert_eq!(amount, amount::parse_units("10.000000000000000000").unwrap());
    }

    #[test]
    fn unknown_symbol_rejected() {
        let event = withdrawal_event("0x7099", "WETH", "10");
        assert!(parse_withdrawal(&event).is_err());
    }

    #[test]
    fn burn_source_key_round_trip() {
        let (update_id, node_id) = split_source_key("1220deadbeef:4").unwrap();
        assert_eq!(update_id, "1220deadbeef");
        assert_eq!(node_id, 4);
    }
}
