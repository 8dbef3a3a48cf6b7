use crate::types::{Direction, TokenSymbol, TransferStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Amounts are stored as NUMERIC(78,18) and travel as String here: queries
// cast text on the way in ($n::NUMERIC) and cast ::TEXT on the way out.

/// A registered end-user mirrored onto the ledger.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub evm_address: String,
    pub canton_party: Option<String>,
    pub fingerprint: Option<String>,
    pub mapping_cid: Option<String>,
    pub prompt_balance: String,
    pub demo_balance: String,
    pub balance_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub evm_address: String,
    pub canton_party: String,
    pub fingerprint: String,
}

/// A single bridge operation in either direction.
///
/// `(direction, source_tx_hash)` is the dedup key: `"tx_hash:log_index"`
/// for deposits, `"update_id:node_id"` for withdrawals.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub direction: Direction,
    pub source_tx_hash: String,
    /// Block number (inbound) or ledger offset (outbound).
    pub source_position: i64,
    /// Recipient fingerprint (inbound) or EVM address (outbound).
    pub recipient: String,
    pub token: TokenSymbol,
    pub amount: String,
    pub status: TransferStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Ledger contract id involved: the created holding (inbound) or the
    /// withdrawal request being completed (outbound).
    pub ledger_cid: Option<String>,
    /// Completion reference: holding cid / EVM completion tx hash.
    pub completion_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub direction: Direction,
    pub source_tx_hash: String,
    pub source_position: i64,
    pub recipient: String,
    pub token: TokenSymbol,
    pub amount: String,
    pub ledger_cid: Option<String>,
}

/// Cached per-token supply figures.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TokenMetricsRow {
    pub token: TokenSymbol,
    pub total_supply: String,
    pub updated_at: DateTime<Utc>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

/// Per-direction transfer counts for the status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferCounts {
    pub observed: i64,
    pub confirming: i64,
    pub submitted: i64,
    pub completed: i64,
    pub failed: i64,
    pub orphaned: i64,
}
