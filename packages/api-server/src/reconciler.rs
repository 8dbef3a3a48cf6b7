//! Balance reconciler.
//!
//! Periodically reads the issuer's holdings off the ledger, aggregates by
//! owner and token, and overwrites the cached per-user balances and
//! per-token supply figures the read path serves. A failed cycle is logged
//! and skipped; the next tick starts fresh.

use bigdecimal::BigDecimal;
use canton_rs::error::Result;
use canton_rs::ledger::proto::Identifier;
use canton_rs::ledger::{codec, LedgerClient};
use canton_rs::types::TokenSymbol;
use canton_rs::{amount, store};
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Reconciler {
    db: PgPool,
    ledger: Arc<LedgerClient>,
    issuer_party: String,
    holding_template: Identifier,
    interval: Duration,
    initial_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        db: PgPool,
        ledger: Arc<LedgerClient>,
        issuer_party: String,
        holding_template: Identifier,
        interval: Duration,
        initial_timeout: Duration,
    ) -> Self {
        Self {
            db,
            ledger,
            issuer_party,
            holding_template,
            interval,
            initial_timeout,
        }
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> eyre::Result<()> {
        // One bounded initial run; its failure downgrades to a warning and
        // the periodic schedule continues regardless.
        match tokio::time::timeout(self.initial_timeout, self.reconcile()).await {
            Ok(Ok(())) => tracing::info!("Initial reconciliation complete"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Initial reconciliation failed"),
            Err(_) => tracing::warn!(
                timeout_secs = self.initial_timeout.as_secs(),
                "Initial reconciliation timed out"
            ),
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick; the initial run covered it

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping reconciler");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::warn!(error = %e, "Reconciliation cycle failed, skipping");
                    }
                }
            }
        }
    }

    /// One pass: snapshot holdings, aggregate, write balances and supplies.
    async fn reconcile(&self) -> Result<()> {
        let mut holdings = self
            .ledger
            .active_contracts(&self.issuer_party, vec![self.holding_template.clone()])
            .await?;

        let mut by_owner: HashMap<(String, TokenSymbol), BigDecimal> = HashMap::new();
        let mut totals: HashMap<TokenSymbol, BigDecimal> = HashMap::new();
        let mut contracts = 0u64;

        while let Some(event) = holdings.next().await? {
            let matches = event
                .template_id
                .as_ref()
                .is_some_and(|t| t.same_entity(&self.holding_template));
            if !matches {
                continue;
            }
            let Some(arguments) = &event.create_arguments else {
                continue;
            };
            let owner = codec::field_party(arguments, "owner")?;
            let symbol = codec::field_text(arguments, "symbol")?;
            let Ok(token) = TokenSymbol::from_str(&symbol) else {
                tracing::debug!(symbol = %symbol, "Skipping holding of unmanaged token");
                continue;
            };
            let value = codec::field_numeric(arguments, "amount")?;
            contracts += 1;
            *by_owner.entry((owner, token)).or_default() += value.clone();
            *totals.entry(token).or_default() += value;
        }

        let users = store::list_users(&self.db).await?;
        let mut updated = 0u64;
        for user in &users {
            let Some(party) = &user.canton_party else {
                continue;
            };
            let zero = BigDecimal::default();
            let prompt = by_owner
                .get(&(party.clone(), TokenSymbol::Prompt))
                .unwrap_or(&zero);
            let demo = by_owner
                .get(&(party.clone(), TokenSymbol::Demo))
                .unwrap_or(&zero);
            store::update_user_balances(
                &self.db,
                user.id,
                &amount::format_units(prompt),
                &amount::format_units(demo),
            )
            .await?;
            updated += 1;
        }

        for token in [TokenSymbol::Prompt, TokenSymbol::Demo] {
            let zero = BigDecimal::default();
            let total = totals.get(&token).unwrap_or(&zero);
            store::set_token_supply(&self.db, token, &amount::format_units(total)).await?;
        }

        tracing::info!(
            holdings = contracts,
            users = updated,
            "Reconciliation cycle complete"
        );
        Ok(())
    }
}
