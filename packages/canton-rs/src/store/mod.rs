//! Persistent state: users, transfers, cursors, whitelist, token metrics.
//!
//! The store is the single source of truth shared by the relayer and the
//! API server. Multi-row updates in the mint/burn path run inside one
//! database transaction; competing pipeline workers are serialised by
//! status-conditional updates ([`claim_transfer`]) rather than application
//! locks.

use crate::error::{Error, Result};
use crate::types::{Direction, TokenSymbol, TransferStatus};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

pub mod models;

pub use models::*;

/// Create a database connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(Error::from)
}

/// Run pending migrations (uses the migration files in migrations/).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::with_source(crate::ErrorKind::Dependency, "migrations failed", e))?;
    Ok(())
}

// ============ Users ============

const USER_SELECT: &str = r#"id, evm_address, canton_party, fingerprint, mapping_cid,
    prompt_balance::TEXT as prompt_balance, demo_balance::TEXT as demo_balance,
    balance_updated_at, created_at, updated_at"#;

/// Insert a new user. A duplicate EVM address (or party/fingerprint)
/// surfaces as `conflict`.
pub async fn create_user(pool: &PgPool, user: &NewUser) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO users (evm_address, canton_party, fingerprint)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(&user.evm_address)
    .bind(&user.canton_party)
    .bind(&user.fingerprint)
    .fetch_one(pool)
    .await?;
    Ok(row.get("id"))
}

pub async fn user_by_evm(pool: &PgPool, evm_address: &str) -> Result<Option<User>> {
    let query = format!("SELECT {USER_SELECT} FROM users WHERE evm_address = $1");
    Ok(sqlx::query_as::<_, User>(&query)
        .bind(evm_address)
        .fetch_optional(pool)
        .await?)
}

pub async fn user_by_party(pool: &PgPool, party: &str) -> Result<Option<User>> {
    let query = format!("SELECT {USER_SELECT} FROM users WHERE canton_party = $1");
    Ok(sqlx::query_as::<_, User>(&query)
        .bind(party)
        .fetch_optional(pool)
        .await?)
}

pub async fn user_by_fingerprint(pool: &PgPool, fingerprint: &str) -> Result<Option<User>> {
    let query = format!("SELECT {USER_SELECT} FROM users WHERE fingerprint = $1");
    Ok(sqlx::query_as::<_, User>(&query)
        .bind(fingerprint)
        .fetch_optional(pool)
        .await?)
}

pub async fn list_users(pool: &PgPool) -> Result<Vec<User>> {
    let query = format!("SELECT {USER_SELECT} FROM users ORDER BY id");
    Ok(sqlx::query_as::<_, User>(&query).fetch_all(pool).await?)
}

pub async fn update_user_mapping_cid(pool: &PgPool, id: i64, mapping_cid: &str) -> Result<()> {
    sqlx::query(r#"UPDATE users SET mapping_cid = $1, updated_at = NOW() WHERE id = $2"#)
        .bind(mapping_cid)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Atomically overwrite both cached balances and stamp
/// `balance_updated_at`. Reconciler-only.
pub async fn update_user_balances(
    pool: &PgPool,
    id: i64,
    prompt_balance: &str,
    demo_balance: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE users
        SET prompt_balance = $1::NUMERIC, demo_balance = $2::NUMERIC,
            balance_updated_at = NOW(), updated_at = NOW()
        WHERE id = $3
        "#,
    )
    .bind(prompt_balance)
    .bind(demo_balance)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove a user row; used to roll back a partially completed registration.
pub async fn delete_user(pool: &PgPool, evm_address: &str) -> Result<()> {
    sqlx::query(r#"DELETE FROM users WHERE evm_address = $1"#)
        .bind(evm_address)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Whitelist ============

pub async fn is_whitelisted(pool: &PgPool, evm_address: &str) -> Result<bool> {
    let row: (bool,) =
        sqlx::query_as(r#"SELECT EXISTS(SELECT 1 FROM whitelist WHERE evm_address = $1)"#)
            .bind(evm_address)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

pub async fn add_to_whitelist(pool: &PgPool, evm_address: &str) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO whitelist (evm_address) VALUES ($1) ON CONFLICT (evm_address) DO NOTHING"#,
    )
    .bind(evm_address)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Transfers ============

const TRANSFER_SELECT: &str = r#"id, direction, source_tx_hash, source_position, recipient,
    token, amount::TEXT as amount, status, attempts, last_error, ledger_cid, completion_ref,
    created_at, updated_at"#;

/// Upsert on `(direction, source_tx_hash)`. Re-observing an event never
/// regresses the row's status; only `updated_at` moves.
pub async fn upsert_transfer(pool: &PgPool, transfer: &NewTransfer) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO transfers (direction, source_tx_hash, source_position, recipient, token, amount, ledger_cid)
        VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7)
        ON CONFLICT (direction, source_tx_hash) DO UPDATE SET updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(transfer.direction)
    .bind(&transfer.source_tx_hash)
    .bind(transfer.source_position)
    .bind(&transfer.recipient)
    .bind(transfer.token)
    .bind(&transfer.amount)
    .bind(&transfer.ledger_cid)
    .fetch_one(pool)
    .await?;
    Ok(row.get("id"))
}

pub async fn transfer_by_id(pool: &PgPool, id: i64) -> Result<Option<Transfer>> {
    let query = format!("SELECT {TRANSFER_SELECT} FROM transfers WHERE id = $1");
    Ok(sqlx::query_as::<_, Transfer>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

/// Recent transfers, optionally filtered by direction.
pub async fn list_transfers(
    pool: &PgPool,
    direction: Option<Direction>,
    limit: i64,
) -> Result<Vec<Transfer>> {
    let rows = match direction {
        Some(direction) => {
            let query = format!(
                "SELECT {TRANSFER_SELECT} FROM transfers WHERE direction = $1
                 ORDER BY created_at DESC LIMIT $2"
            );
            sqlx::query_as::<_, Transfer>(&query)
                .bind(direction)
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
        None => {
            let query = format!(
                "SELECT {TRANSFER_SELECT} FROM transfers ORDER BY created_at DESC LIMIT $1"
            );
            sqlx::query_as::<_, Transfer>(&query)
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows)
}

/// Open transfers in source order, ready for pipeline pickup.
pub async fn open_transfers(
    pool: &PgPool,
    direction: Direction,
    limit: i64,
) -> Result<Vec<Transfer>> {
    let query = format!(
        "SELECT {TRANSFER_SELECT} FROM transfers
         WHERE direction = $1 AND status IN ('observed', 'confirming', 'submitted')
         ORDER BY source_position ASC, id ASC
         LIMIT $2"
    );
    Ok(sqlx::query_as::<_, Transfer>(&query)
        .bind(direction)
        .bind(limit)
        .fetch_all(pool)
        .await?)
}

/// Open transfers inside a source-position window; input to the reorg
/// revalidation.
pub async fn open_transfers_in_window(
    pool: &PgPool,
    direction: Direction,
    from_position: i64,
    to_position: i64,
) -> Result<Vec<Transfer>> {
    let query = format!(
        "SELECT {TRANSFER_SELECT} FROM transfers
         WHERE direction = $1 AND status IN ('observed', 'confirming', 'submitted')
           AND source_position BETWEEN $2 AND $3
         ORDER BY source_position ASC"
    );
    Ok(sqlx::query_as::<_, Transfer>(&query)
        .bind(direction)
        .bind(from_position)
        .bind(to_position)
        .fetch_all(pool)
        .await?)
}

/// Conditionally move a transfer from one status to the next. Returns
/// false when another worker already claimed it (or it advanced past
/// `from`); this is the per-id mutex of the worker pool.
pub async fn claim_transfer(
    pool: &PgPool,
    id: i64,
    from: TransferStatus,
    to: TransferStatus,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE transfers SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3"#,
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Record a failed attempt; returns the new attempt count.
pub async fn record_transfer_attempt(pool: &PgPool, id: i64, error: &str) -> Result<i32> {
    let row = sqlx::query(
        r#"
        UPDATE transfers SET attempts = attempts + 1, last_error = $1, updated_at = NOW()
        WHERE id = $2
        RETURNING attempts
        "#,
    )
    .bind(error)
    .bind(id)
    .fetch_one(pool)
    .await?;
    Ok(row.get("attempts"))
}

pub async fn mark_transfer_failed(pool: &PgPool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE transfers SET status = 'failed', last_error = $1, updated_at = NOW() WHERE id = $2"#,
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a reorged-away event; it is never actioned and stops blocking the
/// cursor.
pub async fn mark_transfer_orphaned(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query(r#"UPDATE transfers SET status = 'orphaned', updated_at = NOW() WHERE id = $1"#)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_transfer_ledger_cid(pool: &PgPool, id: i64, ledger_cid: &str) -> Result<()> {
    sqlx::query(r#"UPDATE transfers SET ledger_cid = $1, updated_at = NOW() WHERE id = $2"#)
        .bind(ledger_cid)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_transfer_completion_ref(pool: &PgPool, id: i64, reference: &str) -> Result<()> {
    sqlx::query(r#"UPDATE transfers SET completion_ref = $1, updated_at = NOW() WHERE id = $2"#)
        .bind(reference)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn transfer_counts(pool: &PgPool, direction: Direction) -> Result<TransferCounts> {
    let rows: Vec<(TransferStatus, i64)> = sqlx::query_as(
        r#"SELECT status, COUNT(*) FROM transfers WHERE direction = $1 GROUP BY status"#,
    )
    .bind(direction)
    .fetch_all(pool)
    .await?;
    let mut counts = TransferCounts::default();
    for (status, count) in rows {
        match status {
            TransferStatus::Observed => counts.observed = count,
            TransferStatus::Confirming => counts.confirming = count,
            TransferStatus::Submitted => counts.submitted = count,
            TransferStatus::Completed => counts.completed = count,
            TransferStatus::Failed => counts.failed = count,
            TransferStatus::Orphaned => counts.orphaned = count,
        }
    }
    Ok(counts)
}

// ============ Cursors ============

pub async fn cursor(pool: &PgPool, direction: Direction) -> Result<Option<i64>> {
    let row: Option<(i64,)> =
        sqlx::query_as(r#"SELECT position FROM cursors WHERE direction = $1"#)
            .bind(direction)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|r| r.0))
}

/// Seed a cursor row if none exists yet.
pub async fn ensure_cursor(pool: &PgPool, direction: Direction, initial: i64) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO cursors (direction, position) VALUES ($1, $2)
           ON CONFLICT (direction) DO NOTHING"#,
    )
    .bind(direction)
    .bind(initial)
    .execute(pool)
    .await?;
    Ok(())
}

/// Set a cursor to an explicit position. Monotone: an attempt to move it
/// backwards fails with `conflict`.
pub async fn set_cursor(pool: &PgPool, direction: Direction, position: i64) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO cursors (direction, position) VALUES ($1, $2)
        ON CONFLICT (direction) DO UPDATE SET position = EXCLUDED.position, updated_at = NOW()
        WHERE cursors.position <= EXCLUDED.position
        "#,
    )
    .bind(direction)
    .bind(position)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(Error::conflict(format!(
            "cursor for {direction} would move backwards to {position}"
        )));
    }
    Ok(())
}

/// Advance a cursor as far as the completed prefix allows: to just below
/// the earliest still-open transfer, capped at `target` (the safe head).
/// Never moves backwards.
pub async fn advance_cursor(pool: &PgPool, direction: Direction, target: i64) -> Result<i64> {
    let row = sqlx::query(
        r#"
        UPDATE cursors
        SET position = GREATEST(position, LEAST($2,
                COALESCE((SELECT MIN(source_position) - 1 FROM transfers
                          WHERE direction = $1
                            AND status IN ('observed', 'confirming', 'submitted')), $2))),
            updated_at = NOW()
        WHERE direction = $1
        RETURNING position
        "#,
    )
    .bind(direction)
    .bind(target)
    .fetch_one(pool)
    .await?;
    Ok(row.get("position"))
}

// ============ Token metrics ============

pub async fn token_metrics(pool: &PgPool) -> Result<Vec<TokenMetricsRow>> {
    Ok(sqlx::query_as::<_, TokenMetricsRow>(
        r#"SELECT token, total_supply::TEXT as total_supply, updated_at, last_reconciled_at
           FROM token_metrics ORDER BY token"#,
    )
    .fetch_all(pool)
    .await?)
}

/// Overwrite a token's cached total supply and stamp the reconciliation
/// time. Reconciler-only.
pub async fn set_token_supply(pool: &PgPool, token: TokenSymbol, total_supply: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE token_metrics
        SET total_supply = $1::NUMERIC, updated_at = NOW(), last_reconciled_at = NOW()
        WHERE token = $2
        "#,
    )
    .bind(total_supply)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ EVM transaction journal ============

pub async fn record_evm_transaction(
    pool: &PgPool,
    transfer_id: i64,
    tx_hash: &str,
    status: &str,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO evm_transactions (transfer_id, tx_hash, status) VALUES ($1, $2, $3)"#,
    )
    .bind(transfer_id)
    .bind(tx_hash)
    .bind(status)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_evm_transaction(
    pool: &PgPool,
    tx_hash: &str,
    status: &str,
    gas_used: Option<i64>,
) -> Result<()> {
    sqlx::query(r#"UPDATE evm_transactions SET status = $1, gas_used = $2 WHERE tx_hash = $3"#)
        .bind(status)
        .bind(gas_used)
        .bind(tx_hash)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Transactional finalizers ============

/// Complete an inbound mint atomically: status transition, holding cid,
/// cached supply increment, cursor advancement. Returns false when another
/// worker completed the transfer first (the supply is then not touched
/// again).
pub async fn finalize_mint(
    pool: &PgPool,
    transfer_id: i64,
    token: TokenSymbol,
    amount: &str,
    holding_cid: Option<&str>,
    cursor_target: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        r#"
        UPDATE transfers
        SET status = 'completed', completion_ref = COALESCE($1, completion_ref), updated_at = NOW()
        WHERE id = $2 AND status IN ('confirming', 'submitted')
        "#,
    )
    .bind(holding_cid)
    .bind(transfer_id)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        > 0;

    if claimed {
        sqlx::query(
            r#"UPDATE token_metrics SET total_supply = total_supply + $1::NUMERIC, updated_at = NOW()
               WHERE token = $2"#,
        )
        .bind(amount)
        .bind(token)
        .execute(&mut *tx)
        .await?;
    }

    advance_cursor_in_tx(&mut tx, Direction::Inbound, cursor_target).await?;
    tx.commit().await?;
    Ok(claimed)
}

/// Complete an outbound withdrawal atomically: status transition, EVM tx
/// reference, cached supply decrement, cursor advancement.
pub async fn finalize_withdrawal(
    pool: &PgPool,
    transfer_id: i64,
    token: TokenSymbol,
    amount: &str,
    evm_tx_hash: &str,
    cursor_target: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        r#"
        UPDATE transfers
        SET status = 'completed', completion_ref = $1, updated_at = NOW()
        WHERE id = $2 AND status IN ('confirming', 'submitted')
        "#,
    )
    .bind(evm_tx_hash)
    .bind(transfer_id)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        > 0;

    if claimed {
        sqlx::query(
            r#"UPDATE token_metrics SET total_supply = total_supply - $1::NUMERIC, updated_at = NOW()
               WHERE token = $2"#,
        )
        .bind(amount)
        .bind(token)
        .execute(&mut *tx)
        .await?;
    }

    advance_cursor_in_tx(&mut tx, Direction::Outbound, cursor_target).await?;
    tx.commit().await?;
    Ok(claimed)
}

async fn advance_cursor_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    direction: Direction,
    target: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE cursors
        SET position = GREATEST(position, LEAST($2,
                COALESCE((SELECT MIN(source_position) - 1 FROM transfers
                          WHERE direction = $1
                            AND status IN ('observed', 'confirming', 'submitted')), $2))),
            updated_at = NOW()
        WHERE direction = $1
        "#,
    )
    .bind(direction)
    .bind(target)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
