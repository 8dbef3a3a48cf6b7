//! Shared EVM JSON-RPC plumbing.

use crate::error::{Error, ErrorKind, Result};
use alloy::primitives::B256;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::{Client, Http};
use std::str::FromStr;

/// Build a read-only HTTP provider.
pub fn http_provider(rpc_url: &str) -> Result<RootProvider<Http<Client>>> {
    let url = rpc_url
        .parse()
        .map_err(|e| Error::invalid_input(format!("invalid EVM RPC URL: {e}")))?;
    Ok(ProviderBuilder::new().on_http(url))
}

/// Outcome of a receipt lookup.
#[derive(Debug, Clone)]
pub struct ReceiptInfo {
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: u64,
}

/// Current head block number.
pub async fn head(provider: &RootProvider<Http<Client>>) -> Result<u64> {
    provider
        .get_block_number()
        .await
        .map_err(|e| Error::with_source(ErrorKind::Dependency, "failed to get block number", e))
}

/// Receipt of a transaction, or `None` while it is still pending.
pub async fn receipt_of(
    provider: &RootProvider<Http<Client>>,
    tx_hash: &str,
) -> Result<Option<ReceiptInfo>> {
    let hash = B256::from_str(tx_hash)
        .map_err(|e| Error::invalid_input(format!("invalid tx hash {tx_hash:?}: {e}")))?;
    let receipt = provider
        .get_transaction_receipt(hash)
        .await
        .map_err(|e| Error::with_source(ErrorKind::Dependency, "failed to get receipt", e))?;
    Ok(receipt.map(|r| ReceiptInfo {
        success: r.status(),
        block_number: r.block_number,
        gas_used: r.gas_used as u64,
    }))
}

/// Whether the transaction is still part of the canonical chain at the
/// block it was originally observed in. Used by the reorg lookback.
pub async fn tx_at_block(
    provider: &RootProvider<Http<Client>>,
    tx_hash: &str,
    expected_block: u64,
) -> Result<bool> {
    Ok(matches!(
        receipt_of(provider, tx_hash).await?,
        Some(ReceiptInfo {
            block_number: Some(block),
            ..
        }) if block == expected_block
    ))
}
