//! Custodial key store.
//!
//! Maps each of {EVM address, fingerprint, party id} to an encrypted
//! signing-key blob in `canton_key_records`. Plaintext key material never
//! crosses the store boundary at rest; rows are sealed on the way in and
//! opened on the way out.

pub mod crypto;

pub use crypto::{MasterKey, KEY_LEN, NONCE_LEN};

use crate::error::{Error, Result};
use crate::ledger::interactive::{PartySigner, UserKey};
use crate::types::{EvmAddress, Fingerprint};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use sqlx::PgPool;

pub struct KeyStore {
    db: PgPool,
    master: MasterKey,
}

impl KeyStore {
    pub fn new(db: PgPool, master: MasterKey) -> Self {
        Self { db, master }
    }

    /// Seal and persist a user's signing key, indexed by EVM address, party
    /// and fingerprint. The key must be exactly 32 bytes.
    pub async fn put(&self, evm: &EvmAddress, party: &str, key_bytes: &[u8]) -> Result<()> {
        let fingerprint = Fingerprint::of_evm_address(evm);
        let blob = crypto::seal(&self.master, key_bytes)?;
        sqlx::query(
            r#"
            INSERT INTO canton_key_records (evm_address, canton_party, fingerprint, encrypted_key)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(evm.as_hex())
        .bind(party)
        .bind(fingerprint.as_hex())
        .bind(&blob)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_by_evm(&self, evm: &EvmAddress) -> Result<Option<(String, SigningKey)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"SELECT canton_party, encrypted_key FROM canton_key_records WHERE evm_address = $1"#,
        )
        .bind(evm.as_hex())
        .fetch_optional(&self.db)
        .await?;
        row.map(|(party, blob)| Ok((party, crypto::open(&self.master, &blob)?)))
            .transpose()
    }

    pub async fn get_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<(String, SigningKey)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"SELECT canton_party, encrypted_key FROM canton_key_records WHERE fingerprint = $1"#,
        )
        .bind(fingerprint.as_hex())
        .fetch_optional(&self.db)
        .await?;
        row.map(|(party, blob)| Ok((party, crypto::open(&self.master, &blob)?)))
            .transpose()
    }

    pub async fn get_by_party(&self, party: &str) -> Result<Option<SigningKey>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"SELECT encrypted_key FROM canton_key_records WHERE canton_party = $1"#,
        )
        .bind(party)
        .fetch_optional(&self.db)
        .await?;
        row.map(|(blob,)| crypto::open(&self.master, &blob)).transpose()
    }

    pub async fn has(&self, evm: &EvmAddress) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            r#"SELECT EXISTS(SELECT 1 FROM canton_key_records WHERE evm_address = $1)"#,
        )
        .bind(evm.as_hex())
        .fetch_one(&self.db)
        .await?;
        Ok(row.0)
    }

    /// Remove a record; used to roll back a partially completed registration.
    pub async fn remove(&self, evm: &EvmAddress) -> Result<()> {
        sqlx::query(r#"DELETE FROM canton_key_records WHERE evm_address = $1"#)
            .bind(evm.as_hex())
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// The key store is the signing capability handed to the ledger client: it
/// resolves a party to that user's key without exposing storage details.
#[async_trait]
impl PartySigner for KeyStore {
    async fn resolve(&self, party: &str) -> Result<UserKey> {
        let key = self
            .get_by_party(party)
            .await?
            .ok_or_else(|| Error::not_found(format!("no signing key for party {party}")))?;
        let fingerprint = crypto::key_fingerprint(key.verifying_key());
        Ok(UserKey { key, fingerprint })
    }
}
