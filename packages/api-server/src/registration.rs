//! User registration: mirrors an end-user onto the ledger as an
//! externally-allocated party under the custodial issuer.
//!
//! Two modes. EVM-originated: the address is recovered from an EIP-191
//! signature, a custodial key is created, a party is allocated and the
//! user's fingerprint mapping is created by the party itself through
//! interactive submission. Ledger-originated: an existing party brings (or
//! is given) an EVM-compatible key and the issuer links the mapping via
//! its admin contract. Any failure after party allocation rolls back the
//! partially-created user.

use crate::signature;
use canton_rs::error::{Error, Result};
use canton_rs::hash::keccak256;
use canton_rs::keystore::{crypto, KeyStore};
use canton_rs::ledger::proto::{command, CreateCommand, Identifier};
use canton_rs::ledger::{codec, LedgerClient};
use canton_rs::store::{self, NewUser};
use canton_rs::types::{party_fingerprint, EvmAddress, Fingerprint};
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How fresh user keys are produced.
pub enum KeyDerivation {
    Generate,
    Derive { seed: Vec<u8> },
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    // EVM-originated
    pub signature: Option<String>,
    pub message: Option<String>,
    // Ledger-originated
    pub canton_party_id: Option<String>,
    pub canton_signature: Option<String>,
    pub canton_private_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub party: String,
    pub fingerprint: String,
    pub mapping_cid: Option<String>,
    pub evm_address: String,
    /// Returned only when the service generated an EVM key for an existing
    /// ledger party (wallet import).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

pub struct RegistrationService {
    db: PgPool,
    keystore: Arc<KeyStore>,
    ledger: Arc<LedgerClient>,
    issuer_party: String,
    bridge_admin_template: Identifier,
    mapping_template: Identifier,
    derivation: KeyDerivation,
    verify_ledger_signature: bool,
    admin_cid: Mutex<Option<String>>,
}

impl RegistrationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: PgPool,
        keystore: Arc<KeyStore>,
        ledger: Arc<LedgerClient>,
        issuer_party: String,
        bridge_admin_template: Identifier,
        mapping_template: Identifier,
        derivation: KeyDerivation,
        verify_ledger_signature: bool,
    ) -> Self {
        Self {
            db,
            keystore,
            ledger,
            issuer_party,
            bridge_admin_template,
            mapping_template,
            derivation,
            verify_ledger_signature,
            admin_cid: Mutex::new(None),
        }
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        if request.canton_party_id.is_some() {
            self.register_from_ledger(request).await
        } else {
            self.register_from_evm(request).await
        }
    }

    async fn register_from_evm(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let message = request
            .message
            .ok_or_else(|| Error::invalid_input("message is required"))?;
        let sig = request
            .signature
            .ok_or_else(|| Error::unauthorized("signature is required"))?;
        tracing::debug!(
            signature = %canton_rs::redact::Redacted(&sig),
            "Recovering registration signer"
        );
        let evm = signature::recover_evm_address(&message, &sig)?;

        if store::user_by_evm(&self.db, &evm.as_hex()).await?.is_some() {
            return Err(Error::conflict(format!("{} is already registered", evm)));
        }
        if !store::is_whitelisted(&self.db, &evm.as_hex()).await? {
            return Err(Error::forbidden(format!("{} is not whitelisted", evm)));
        }

        let fingerprint = Fingerprint::of_evm_address(&evm);
        let key = match &self.derivation {
            KeyDerivation::Generate => crypto::generate_key(),
            KeyDerivation::Derive { seed } => crypto::derive_key(&evm, seed)?,
        };

        let hint = format!("user_{}", &evm.as_hex()[2..10]);
        let spki = crypto::spki_der(key.verifying_key())?;
        let party = self
            .ledger
            .allocate_external_party(&hint, spki, &key)
            .await?;
        tracing::info!(party = %party, evm_address = %evm, "Allocated external party");

        match self.finish_evm_registration(&evm, &party, &fingerprint, &key).await {
            Ok(mapping_cid) => Ok(RegisterResponse {
                party,
                fingerprint: fingerprint.as_hex(),
                mapping_cid,
                evm_address: evm.as_hex(),
                private_key: None,
            }),
            Err(e) => {
                tracing::warn!(
                    evm_address = %evm,
                    error = %e,
                    "Registration failed after party allocation, rolling back"
                );
                self.rollback(&evm).await;
                Err(e)
            }
        }
    }

    async fn finish_evm_registration(
        &self,
        evm: &EvmAddress,
        party: &str,
        fingerprint: &Fingerprint,
        key: &SigningKey,
    ) -> Result<Option<String>> {
        self.keystore.put(evm, party, &key.to_bytes()).await?;
        let user_id = store::create_user(&self.db, &NewUser {
            evm_address: evm.as_hex(),
            canton_party: party.to_string(),
            fingerprint: fingerprint.as_hex(),
        })
        .await?;

        // The mapping is the user's own contract: the party signs its
        // creation through interactive submission.
        let command_id = format!("register-{}", fingerprint.as_hex());
        let arguments = codec::record(vec![
            ("party", codec::party(party)),
            ("fingerprint", codec::text(fingerprint.as_hex())),
            ("evmAddress", codec::text(evm.as_hex())),
        ]);
        let commands = self.ledger.commands(
            &command_id,
            party,
            command::Command::Create(CreateCommand {
                template_id: Some(self.mapping_template.clone()),
                create_arguments: Some(arguments),
            }),
        );
        self.ledger
            .submit_interactive(commands, party, self.keystore.as_ref())
            .await?;

        let mapping_cid = self.lookup_mapping_cid(party).await.ok().flatten();
        if let Some(cid) = &mapping_cid {
            store::update_user_mapping_cid(&self.db, user_id, cid).await?;
        }
        Ok(mapping_cid)
    }

    async fn register_from_ledger(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let party = request
            .canton_party_id
            .ok_or_else(|| Error::invalid_input("canton_party_id is required"))?;
        let message = request.message.unwrap_or_default();

        if store::user_by_party(&self.db, &party).await?.is_some() {
            return Err(Error::conflict(format!("party {party} is already registered")));
        }

        let provided_key = request
            .canton_private_key
            .as_deref()
            .map(parse_private_key)
            .transpose()?;

        if self.verify_ledger_signature {
            let sig = request
                .canton_signature
                .as_ref()
                .ok_or_else(|| Error::unauthorized("canton_signature is required"))?;
            let key = provided_key.as_ref().ok_or_else(|| {
                Error::unauthorized("canton_private_key is required to verify the party signature")
            })?;
            let expected = party_fingerprint(&party)
                .ok_or_else(|| Error::invalid_input("party id must be of the form hint::fingerprint"))?;
            if crypto::key_fingerprint(key.verifying_key()) != expected {
                return Err(Error::unauthorized(
                    "provided key does not match the party fingerprint",
                ));
            }
            signature::verify_party_signature(key.verifying_key(), &message, sig)?;
        }

        let (key, generated) = match provided_key {
            Some(key) => (key, false),
            None => (crypto::generate_key(), true),
        };
        let evm = crypto::evm_address_of(key.verifying_key());
        if store::user_by_evm(&self.db, &evm.as_hex()).await?.is_some() {
            return Err(Error::conflict(format!("{} is already registered", evm)));
        }

        // The bridge routing fingerprint derives from the party id's
        // fingerprint portion (there is no originating EVM address).
        let portion = party_fingerprint(&party)
            .ok_or_else(|| Error::invalid_input("party id must be of the form hint::fingerprint"))?;
        let fingerprint = Fingerprint::from_raw(keccak256(portion.as_bytes()));

        match self
            .finish_ledger_registration(&evm, &party, &fingerprint, &key)
            .await
        {
            Ok(mapping_cid) => Ok(RegisterResponse {
                party,
                fingerprint: fingerprint.as_hex(),
                mapping_cid,
                evm_address: evm.as_hex(),
                private_key: generated.then(|| hex::encode(key.to_bytes())),
            }),
            Err(e) => {
                tracing::warn!(
                    party = %party,
                    error = %e,
                    "Ledger registration failed, rolling back"
                );
                self.rollback(&evm).await;
                Err(e)
            }
        }
    }

    async fn finish_ledger_registration(
        &self,
        evm: &EvmAddress,
        party: &str,
        fingerprint: &Fingerprint,
        key: &SigningKey,
    ) -> Result<Option<String>> {
        self.keystore.put(evm, party, &key.to_bytes()).await?;
        let user_id = store::create_user(&self.db, &NewUser {
            evm_address: evm.as_hex(),
            canton_party: party.to_string(),
            fingerprint: fingerprint.as_hex(),
        })
        .await?;

        // An existing party is linked by the issuer via its admin contract.
        let admin_cid = self.bridge_admin_cid().await?;
        let command_id = format!("register-{}", fingerprint.as_hex());
        let argument = codec::record_value(vec![
            ("party", codec::party(party)),
            ("fingerprint", codec::text(fingerprint.as_hex())),
            ("evmAddress", codec::text(evm.as_hex())),
        ]);
        let transaction = self
            .ledger
            .exercise(
                &self.bridge_admin_template,
                &admin_cid,
                "RegisterUser",
                argument,
                &self.issuer_party,
                &command_id,
            )
            .await?;

        let mapping_cid = transaction
            .created(&self.mapping_template)
            .next()
            .map(|c| c.contract_id.clone());
        if let Some(cid) = &mapping_cid {
            store::update_user_mapping_cid(&self.db, user_id, cid).await?;
        }
        Ok(mapping_cid)
    }

    async fn bridge_admin_cid(&self) -> Result<String> {
        let mut cache = self.admin_cid.lock().await;
        if let Some(cid) = &*cache {
            return Ok(cid.clone());
        }
        let mut contracts = self
            .ledger
            .active_contracts(&self.issuer_party, vec![self.bridge_admin_template.clone()])
            .await?;
        while let Some(event) = contracts.next().await? {
            let matches = event
                .template_id
                .as_ref()
                .is_some_and(|t| t.same_entity(&self.bridge_admin_template));
            if matches {
                *cache = Some(event.contract_id.clone());
                return Ok(event.contract_id);
            }
        }
        Err(Error::dependency(
            "bridge admin contract not found on the ledger",
        ))
    }

    async fn lookup_mapping_cid(&self, party: &str) -> Result<Option<String>> {
        let mut contracts = self
            .ledger
            .active_contracts(party, vec![self.mapping_template.clone()])
            .await?;
        while let Some(event) = contracts.next().await? {
            let matches = event
                .template_id
                .as_ref()
                .is_some_and(|t| t.same_entity(&self.mapping_template));
            if matches {
                return Ok(Some(event.contract_id));
            }
        }
        Ok(None)
    }

    /// Remove the partially-created user record and sealed key.
    async fn rollback(&self, evm: &EvmAddress) {
        if let Err(e) = store::delete_user(&self.db, &evm.as_hex()).await {
            tracing::error!(evm_address = %evm, error = %e, "Rollback: failed to delete user row");
        }
        if let Err(e) = self.keystore.remove(evm).await {
            tracing::error!(evm_address = %evm, error = %e, "Rollback: failed to delete key record");
        }
    }
}

fn parse_private_key(hex_key: &str) -> Result<SigningKey> {
    let raw = hex_key.strip_prefix("0x").unwrap_or(hex_key);
    let bytes = hex::decode(raw)
        .map_err(|_| Error::invalid_input("canton_private_key is not valid hex"))?;
    SigningKey::from_slice(&bytes)
        .map_err(|_| Error::invalid_input("canton_private_key is not a valid secp256k1 scalar"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_private_key_accepts_prefixed_hex() {
        let key = crypto::generate_key();
        let rendered = format!("0x{}", hex::encode(key.to_bytes()));
        let parsed = parse_private_key(&rendered).unwrap();
        assert_eq!(parsed.to_bytes(), key.to_bytes());
    }

    #[test]
    fn parse_private_key_rejects_garbage() {
        assert!(parse_private_key("not-hex").is_err());
        assert!(parse_private_key("0xdead").is_err());
    }
}
