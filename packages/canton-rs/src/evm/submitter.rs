//! Withdrawal completion submitter.
//!
//! Sends `completeWithdrawal` transactions against the bridge contract on
//! behalf of the relayer key. The burn id doubles as the contract-side
//! idempotency key, so a crashed-and-restarted submission can first ask the
//! contract whether the burn was already paid out.

use crate::error::{Error, ErrorKind, Result};
use crate::evm::client::{self, ReceiptInfo};
use crate::evm::contracts::CantonBridge;
use crate::types::EvmAddress;
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, FixedBytes, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client, Http};
use std::str::FromStr;

pub struct WithdrawalSubmitter {
    rpc_url: String,
    bridge_address: Address,
    signer: PrivateKeySigner,
    gas_limit: u64,
    max_gas_price: Option<u128>,
    provider: RootProvider<Http<Client>>,
}

impl WithdrawalSubmitter {
    pub fn new(
        rpc_url: &str,
        bridge_address: &str,
        relayer_private_key: &str,
        gas_limit: u64,
        max_gas_price: Option<u128>,
    ) -> Result<Self> {
        let bridge_address = Address::from_str(bridge_address)
            .map_err(|e| Error::invalid_input(format!("invalid bridge address: {e}")))?;
        let signer: PrivateKeySigner = relayer_private_key
            .parse()
            .map_err(|_| Error::invalid_input("invalid relayer private key"))?;
        let provider = client::http_provider(rpc_url)?;

        tracing::info!(
            relayer_address = %signer.address(),
            bridge_address = %bridge_address,
            gas_limit,
            "Withdrawal submitter initialized"
        );

        Ok(Self {
            rpc_url: rpc_url.to_string(),
            bridge_address,
            signer,
            gas_limit,
            max_gas_price,
            provider,
        })
    }

    pub fn relayer_address(&self) -> EvmAddress {
        EvmAddress::from(self.signer.address())
    }

    /// Whether the contract already recorded a completion for this burn.
    pub async fn is_completed(&self, burn_id: [u8; 32]) -> Result<bool> {
        let contract = CantonBridge::new(self.bridge_address, &self.provider);
        let result = contract
            .isWithdrawalCompleted(FixedBytes::from(burn_id))
            .call()
            .await
            .map_err(|e| {
                Error::with_source(ErrorKind::Dependency, "completion lookup failed", e)
            })?;
        Ok(result._0)
    }

    /// Construct, sign and submit the completion transaction. Returns the
    /// transaction hash; inclusion is checked separately via [`receipt_of`].
    ///
    /// [`receipt_of`]: WithdrawalSubmitter::receipt_of
    pub async fn send_withdrawal(
        &self,
        to: EvmAddress,
        amount: U256,
        burn_id: [u8; 32],
    ) -> Result<String> {
        // Gas price comes from the node's suggestion; refuse to submit past
        // the configured ceiling and let the pipeline retry later.
        if let Some(max) = self.max_gas_price {
            let suggested = self.provider.get_gas_price().await.map_err(|e| {
                Error::with_source(ErrorKind::Dependency, "failed to get gas price", e)
            })?;
            if suggested > max {
                return Err(Error::dependency(format!(
                    "suggested gas price {suggested} exceeds configured maximum {max}"
                )));
            }
        }

        let wallet = EthereumWallet::from(self.signer.clone());
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| Error::invalid_input(format!("invalid EVM RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().wallet(wallet).on_http(url);
        let contract = CantonBridge::new(self.bridge_address, &provider);

        tracing::debug!(
            to = %to,
            amount = %amount,
            burn_id = %hex::encode(burn_id),
            "Submitting completeWithdrawal"
        );

        let pending = contract
            .completeWithdrawal(to.into(), amount, FixedBytes::from(burn_id))
            .gas(self.gas_limit)
            .send()
            .await
            .map_err(|e| {
                Error::with_source(ErrorKind::Dependency, "failed to send completion", e)
            })?;

        Ok(format!("{:?}", *pending.tx_hash()))
    }

    /// Receipt of a previously submitted completion, or `None` while
    /// pending. A non-success receipt is a permanent failure of that
    /// submission.
    pub async fn receipt_of(&self, tx_hash: &str) -> Result<Option<ReceiptInfo>> {
        client::receipt_of(&self.provider, tx_hash).await
    }
}
