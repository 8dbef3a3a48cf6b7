//! Signature verification for registration.
//!
//! EVM-originated registration carries an EIP-191 personal-sign signature;
//! the address is recovered from it. Ledger-originated registration carries
//! a plain ECDSA signature over `sha256(message)` by the party's key.

use canton_rs::error::{Error, Result};
use canton_rs::hash::keccak256;
use canton_rs::keystore::crypto;
use canton_rs::types::EvmAddress;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha2::{Digest, Sha256};

/// `keccak256("\x19Ethereum Signed Message:\n" ‖ len ‖ message)`
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut input = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    input.extend_from_slice(message);
    keccak256(&input)
}

/// Recover the signing EVM address from a 65-byte `r ‖ s ‖ v` signature
/// over the EIP-191 hash of `message`.
pub fn recover_evm_address(message: &str, signature_hex: &str) -> Result<EvmAddress> {
    let raw = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let bytes = hex::decode(raw)
        .map_err(|_| Error::unauthorized("signature is not valid hex"))?;
    if bytes.len() != 65 {
        return Err(Error::unauthorized(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|_| Error::unauthorized("malformed signature"))?;
    let v = bytes[64];
    let recovery_id = RecoveryId::try_from(if v >= 27 { v - 27 } else { v })
        .map_err(|_| Error::unauthorized("invalid recovery id"))?;

    let digest = eip191_hash(message.as_bytes());
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|_| Error::unauthorized("signature recovery failed"))?;
    Ok(crypto::evm_address_of(&key))
}

/// Verify a ledger party's 64-byte signature over `sha256(message)`.
pub fn verify_party_signature(
    key: &VerifyingKey,
    message: &str,
    signature_hex: &str,
) -> Result<()> {
    let raw = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let bytes = hex::decode(raw)
        .map_err(|_| Error::unauthorized("signature is not valid hex"))?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|_| Error::unauthorized("signature must be 64 bytes of r ‖ s"))?;
    let digest = Sha256::digest(message.as_bytes());
    key.verify_prehash(&digest, &signature)
        .map_err(|_| Error::unauthorized("party signature does not verify"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::ecdsa::SigningKey;

    fn sign_eip191(key: &SigningKey, message: &str) -> String {
        let digest = eip191_hash(message.as_bytes());
        let (signature, recovery_id) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        format!("0x{}", hex::encode(bytes))
    }

    #[test]
    fn recovers_signer_address() {
        let key = crypto::generate_key();
        let expected = crypto::evm_address_of(key.verifying_key());
        let signature = sign_eip191(&key, "Register me");
        let recovered = recover_evm_address("Register me", &signature).unwrap();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn different_message_recovers_different_address() {
        let key = crypto::generate_key();
        let expected = crypto::evm_address_of(key.verifying_key());
        let signature = sign_eip191(&key, "Register me");
        let recovered = recover_evm_address("Another message", &signature).unwrap();
        assert_ne!(recovered, expected);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(recover_evm_address("msg", "0xdeadbeef").is_err());
    }

    #[test]
    fn party_signature_round_trip() {
        let key = crypto::generate_key();
        let digest = Sha256::digest(b"link my party");
        let signature: Signature = key.sign_prehash(digest.as_slice()).unwrap();
        let hex_sig = format!("0x{}", hex::encode(signature.to_bytes()));
        assert!(verify_party_signature(key.verifying_key(), "link my party", &hex_sig).is_ok());
        assert!(verify_party_signature(key.verifying_key(), "a different message", &hex_sig).is_err());
    }

    #[test]
    fn truncated_party_signature_rejected() {
        let key = crypto::generate_key();
        // 63 bytes: fails the length rule after recovery-id stripping
        let short = format!("0x{}", hex::encode([7u8; 63]));
        assert!(verify_party_signature(key.verifying_key(), "msg", &short).is_err());
    }
}
