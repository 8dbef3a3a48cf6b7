//! Interactive submission for externally-hosted parties.
//!
//! The participant prepares an unsigned transaction, the service signs its
//! hash with the targeted user's custodial key, and the signed blob is
//! submitted back. The key is reached through an injected [`PartySigner`]
//! capability so this module borrows from, but does not own, the key store.

use crate::error::{Error, Result};
use crate::ledger::client::LedgerClient;
use crate::ledger::proto::{
    Commands, ExecuteSubmissionRequest, ExecuteSubmissionResponse, PartySignature,
    PrepareSubmissionRequest, PrepareSubmissionResponse,
};
use async_trait::async_trait;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};

const PREPARE_SUBMISSION: &str = "/ledgerapi.v1.InteractiveSubmissionService/PrepareSubmission";
const EXECUTE_SUBMISSION: &str = "/ledgerapi.v1.InteractiveSubmissionService/ExecuteSubmission";

/// Signature payload encoding: raw 64-byte `r ‖ s`.
pub const SIGNATURE_FORMAT_RAW: i32 = 1;
/// Signing scheme identifier for secp256k1 ECDSA.
pub const SIGNING_SCHEME_ECDSA_SECP256K1: i32 = 2;

/// A resolved custodial key: the scalar plus the cryptographic fingerprint
/// the participant knows it by.
pub struct UserKey {
    pub key: SigningKey,
    pub fingerprint: String,
}

/// Capability resolving a party id to that user's signing key.
#[async_trait]
pub trait PartySigner: Send + Sync {
    async fn resolve(&self, party: &str) -> Result<UserKey>;
}

impl LedgerClient {
    /// Submit `commands` on behalf of the externally-hosted `party`.
    ///
    /// Returns the submission id (the command id of the envelope), which the
    /// participant deduplicates exactly like a direct submission.
    pub async fn submit_interactive(
        &self,
        commands: Commands,
        party: &str,
        signer: &dyn PartySigner,
    ) -> Result<String> {
        let submission_id = commands.command_id.clone();

        let prepared: PrepareSubmissionResponse = self
            .unary(PREPARE_SUBMISSION, PrepareSubmissionRequest {
                commands: Some(commands),
            })
            .await?;

        // The participant states the hash it expects a signature over;
        // recompute it locally and refuse to sign anything else.
        let digest = Sha256::digest(&prepared.prepared_transaction);
        if prepared.prepared_transaction_hash != digest.as_slice() {
            return Err(Error::corrupt(
                "prepared transaction hash does not match its payload",
            ));
        }

        let user = signer.resolve(party).await?;
        let signature: Signature = user
            .key
            .sign_prehash(digest.as_slice())
            .map_err(|e| Error::internal(format!("user signature failed: {e}")))?;
        let signature = signature.normalize_s().unwrap_or(signature);

        let _: ExecuteSubmissionResponse = self
            .unary(EXECUTE_SUBMISSION, ExecuteSubmissionRequest {
                prepared_transaction: prepared.prepared_transaction,
                signature: Some(PartySignature {
                    signed_by_fingerprint: user.fingerprint,
                    signature: signature.to_bytes().to_vec(),
                    format: SIGNATURE_FORMAT_RAW,
                    scheme: SIGNING_SCHEME_ECDSA_SECP256K1,
                }),
                submission_id: submission_id.clone(),
            })
            .await?;

        Ok(submission_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::hazmat::PrehashVerifier;

    #[test]
    fn prehash_signature_is_64_bytes_and_verifies() {
        let key = crate::keystore::crypto::generate_key();
        let digest = Sha256::digest(b"prepared-transaction-bytes");
        let signature: Signature = key.sign_prehash(digest.as_slice()).unwrap();
        let signature = signature.normalize_s().unwrap_or(signature);

        assert_eq!(signature.to_bytes().len(), 64);
        key.verifying_key()
            .verify_prehash(digest.as_slice(), &signature)
            .unwrap();

        // Round-trip through the wire encoding
        let restored = Signature::from_slice(&signature.to_bytes()).unwrap();
        assert_eq!(restored, signature);
    }

    #[test]
    fn truncated_signature_rejected() {
        let key = crate::keystore::crypto::generate_key();
        let digest = Sha256::digest(b"payload");
        let signature: Signature = key.sign_prehash(digest.as_slice()).unwrap();
        let bytes = signature.to_bytes();
        assert!(Signature::from_slice(&bytes[..63]).is_err());
    }
}
