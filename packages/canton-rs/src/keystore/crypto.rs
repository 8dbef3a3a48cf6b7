//! Sealing and derivation primitives for custodial signing keys.
//!
//! Keys are secp256k1 scalars (the EVM curve, so the same material derives
//! the user's EVM address). At rest they are AES-256-GCM sealed under a
//! master key supplied through the process environment; the blob layout is
//! `base64(nonce ‖ ciphertext ‖ tag)` with a 12-byte nonce and 16-byte tag.

use crate::error::Error;
use crate::hash::keccak256;
use crate::types::EvmAddress;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::pkcs8::EncodePublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Nonce length of AES-GCM as used here.
pub const NONCE_LEN: usize = 12;

/// Length of a raw signing key and of the master key.
pub const KEY_LEN: usize = 32;

/// The AES-256 master key. Never persisted; read from the environment at
/// startup. Anything but exactly 32 bytes is fatal.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != KEY_LEN {
            return Err(Error::invalid_input(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(MasterKey(key))
    }

    /// Read the hex-encoded master key from the named environment variable.
    pub fn from_env(var: &str) -> Result<Self, Error> {
        let raw = std::env::var(var)
            .map_err(|_| Error::invalid_input(format!("{var} environment variable is required")))?;
        let raw = raw.strip_prefix("0x").unwrap_or(&raw);
        let bytes = hex::decode(raw)
            .map_err(|e| Error::invalid_input(format!("{var} must be hex: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Seal a 32-byte signing key under the master key with a fresh nonce.
pub fn seal(master: &MasterKey, key_bytes: &[u8]) -> Result<String, Error> {
    if key_bytes.len() != KEY_LEN {
        return Err(Error::invalid_input(format!(
            "signing key must be {KEY_LEN} bytes, got {}",
            key_bytes.len()
        )));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master.0));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), key_bytes)
        .map_err(|_| Error::internal("key sealing failed"))?;
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Open a sealed key blob. GCM authentication failure surfaces as `corrupt`
/// and is never retried.
pub fn open(master: &MasterKey, blob: &str) -> Result<SigningKey, Error> {
    let bytes = BASE64
        .decode(blob)
        .map_err(|_| Error::corrupt("key blob is not valid base64"))?;
    if bytes.len() <= NONCE_LEN {
        return Err(Error::corrupt("key blob too short"));
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master.0));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::corrupt("key blob failed authentication"))?;
    SigningKey::from_slice(&plaintext).map_err(|_| Error::corrupt("sealed key is not a valid scalar"))
}

/// Sample a fresh secp256k1 signing key.
pub fn generate_key() -> SigningKey {
    SigningKey::random(&mut OsRng)
}

/// Deterministically derive a user key from a seed with HKDF-SHA256.
///
/// `info` binds the derivation to the EVM address so distinct users get
/// distinct keys from the same seed. The seed must be at least 32 bytes.
pub fn derive_key(evm: &EvmAddress, seed: &[u8]) -> Result<SigningKey, Error> {
    if seed.len() < KEY_LEN {
        return Err(Error::invalid_input(format!(
            "derivation seed must be at least {KEY_LEN} bytes"
        )));
    }
    let info = format!("canton-key-{}", evm.as_hex());
    let hk = Hkdf::<Sha256>::new(None, seed);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|_| Error::internal("HKDF expansion failed"))?;
    SigningKey::from_slice(&okm).map_err(|_| Error::internal("derived bytes are not a valid scalar"))
}

/// Derive the EVM address of a verifying key:
/// `keccak256(uncompressed_pubkey[1:])[-20:]`.
pub fn evm_address_of(key: &VerifyingKey) -> EvmAddress {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    EvmAddress(addr)
}

/// Cryptographic fingerprint of a verifying key, multihash-rendered the way
/// the participant renders party fingerprints (`0x12 0x20 ‖ sha256`).
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_encoded_point(true).as_bytes());
    format!("1220{}", hex::encode(digest))
}

/// SubjectPublicKeyInfo DER encoding, as submitted at party allocation.
pub fn spki_der(key: &VerifyingKey) -> Result<Vec<u8>, Error> {
    key.to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| Error::internal(format!("SPKI encoding failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(byte: u8) -> MasterKey {
        MasterKey::from_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn seal_open_round_trip() {
        let m = master(7);
        let key = generate_key();
        let blob = seal(&m, &key.to_bytes()).unwrap();
        let opened = open(&m, &blob).unwrap();
        assert_eq!(opened.to_bytes(), key.to_bytes());
    }

    #[test]
    fn open_with_wrong_master_fails() {
        let key = generate_key();
        let blob = seal(&master(7), &key.to_bytes()).unwrap();
        let err = open(&master(8), &blob).unwrap_err();
        assert!(err.message().contains("corrupt"));
    }

    #[test]
    fn tampered_blob_fails_authentication() {
        let m = master(7);
        let key = generate_key();
        let blob = seal(&m, &key.to_bytes()).unwrap();
        let mut bytes = BASE64.decode(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(open(&m, &BASE64.encode(bytes)).is_err());
    }

    #[test]
    fn master_key_length_enforced() {
        assert!(MasterKey::from_bytes(&[0u8; 16]).is_err());
        assert!(MasterKey::from_bytes(&[0u8; 33]).is_err());
        assert!(MasterKey::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn seal_rejects_short_keys() {
        assert!(seal(&master(1), &[0u8; 16]).is_err());
    }

    #[test]
    fn derivation_is_deterministic_per_address() {
        let seed = [42u8; 32];
        let a = EvmAddress::from_hex("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap();
        let b = EvmAddress::from_hex("0x70997970c51812dc3a010c7d01b50e0d17dc79c8").unwrap();

        let ka1 = derive_key(&a, &seed).unwrap();
        let ka2 = derive_key(&a, &seed).unwrap();
        let kb = derive_key(&b, &seed).unwrap();
        assert_eq!(ka1.to_bytes(), ka2.to_bytes());
        assert_ne!(ka1.to_bytes(), kb.to_bytes());
    }

    #[test]
    fn derivation_requires_long_seed() {
        let a = EvmAddress::from_hex("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap();
        assert!(derive_key(&a, &[0u8; 31]).is_err());
    }

    #[test]
    fn evm_address_from_known_key() {
        // Anvil's first dev account: private key 0xac09...f80 maps to
        // 0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266.
        let sk = SigningKey::from_slice(
            &hex::decode("ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80")
                .unwrap(),
        )
        .unwrap();
        let addr = evm_address_of(sk.verifying_key());
        assert_eq!(addr.as_hex(), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
    }

    #[test]
    fn key_fingerprint_is_multihash_shaped() {
        let fp = key_fingerprint(generate_key().verifying_key());
        assert!(fp.starts_with("1220"));
        assert_eq!(fp.len(), 4 + 64);
    }
}
