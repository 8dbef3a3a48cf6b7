use crate::error::Error;
use crate::hash::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bridge direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum Direction {
    /// EVM deposit minted on the ledger.
    #[sqlx(rename = "in")]
    #[serde(rename = "in")]
    Inbound,
    /// Ledger burn completed on the EVM chain.
    #[sqlx(rename = "out")]
    #[serde(rename = "out")]
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a transfer.
///
/// Transitions are monotone along observed → confirming → submitted →
/// completed; `failed` is terminal after the retry budget is spent and
/// `orphaned` marks events dropped by a chain reorganisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Observed,
    Confirming,
    Submitted,
    Completed,
    Failed,
    Orphaned,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Observed => "observed",
            TransferStatus::Confirming => "confirming",
            TransferStatus::Submitted => "submitted",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Orphaned => "orphaned",
        }
    }

    /// Whether the transfer still blocks cursor advancement.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TransferStatus::Observed | TransferStatus::Confirming | TransferStatus::Submitted
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two tokens administered by the issuer party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum TokenSymbol {
    #[sqlx(rename = "PROMPT")]
    #[serde(rename = "PROMPT")]
    Prompt,
    #[sqlx(rename = "DEMO")]
    #[serde(rename = "DEMO")]
    Demo,
}

impl TokenSymbol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSymbol::Prompt => "PROMPT",
            TokenSymbol::Demo => "DEMO",
        }
    }
}

impl FromStr for TokenSymbol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "PROMPT" => Ok(TokenSymbol::Prompt),
            "DEMO" => Ok(TokenSymbol::Demo),
            other => Err(Error::invalid_input(format!("unknown token: {other}"))),
        }
    }
}

impl fmt::Display for TokenSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// EVM address (20 bytes), canonicalised as lowercase hex with `0x` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvmAddress(pub [u8; 20]);

impl EvmAddress {
    /// Parse from hex, with or without the `0x` prefix.
    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::invalid_input(format!("invalid EVM address hex: {e}")))?;
        if bytes.len() != 20 {
            return Err(Error::invalid_input("EVM address must be 20 bytes"));
        }
        let mut result = [0u8; 20];
        result.copy_from_slice(&bytes);
        Ok(EvmAddress(result))
    }

    /// Canonical lowercase hex rendering with `0x` prefix.
    pub fn as_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

impl From<alloy::primitives::Address> for EvmAddress {
    fn from(addr: alloy::primitives::Address) -> Self {
        EvmAddress(addr.0 .0)
    }
}

impl From<EvmAddress> for alloy::primitives::Address {
    fn from(addr: EvmAddress) -> Self {
        alloy::primitives::Address::from(addr.0)
    }
}

/// 32-byte bridge routing token for a user: `keccak256(evm_address_bytes)`.
///
/// Distinct from the cryptographic key fingerprint embedded in a party id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of_evm_address(addr: &EvmAddress) -> Self {
        Fingerprint(keccak256(addr.as_bytes()))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::invalid_input(format!("invalid fingerprint hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(Error::invalid_input("fingerprint must be 32 bytes"));
        }
        let mut result = [0u8; 32];
        result.copy_from_slice(&bytes);
        Ok(Fingerprint(result))
    }

    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// The fingerprint portion of a `hint::fingerprint` party identifier.
pub fn party_fingerprint(party: &str) -> Option<&str> {
    party.split_once("::").map(|(_, fp)| fp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evm_address_round_trip() {
        let addr = EvmAddress::from_hex("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        // Canonical form is lowercase regardless of input casing
        assert_eq!(addr.as_hex(), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        let reparsed = EvmAddress::from_hex(&addr.as_hex()).unwrap();
        assert_eq!(addr, reparsed);
    }

    #[test]
    fn evm_address_rejects_bad_length() {
        assert!(EvmAddress::from_hex("0xdead").is_err());
    }

    #[test]
    fn fingerprint_is_deterministic_and_distinct() {
        let a = EvmAddress::from_hex("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap();
        let b = EvmAddress::from_hex("0x70997970c51812dc3a010c7d01b50e0d17dc79c8").unwrap();
        assert_eq!(Fingerprint::of_evm_address(&a), Fingerprint::of_evm_address(&a));
        assert_ne!(Fingerprint::of_evm_address(&a), Fingerprint::of_evm_address(&b));
    }

    #[test]
    fn fingerprint_hex_round_trip() {
        let fp = Fingerprint::of_evm_address(
            &EvmAddress::from_hex("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap(),
        );
        assert_eq!(Fingerprint::from_hex(&fp.as_hex()).unwrap(), fp);
    }

    #[test]
    fn party_fingerprint_split() {
        assert_eq!(
            party_fingerprint("user_f39fd6e5::1220abcdef"),
            Some("1220abcdef")
        );
        assert_eq!(party_fingerprint("no-separator"), None);
    }

    #[test]
    fn status_strings() {
        assert_eq!(TransferStatus::Observed.as_str(), "observed");
        assert_eq!(TransferStatus::Completed.as_str(), "completed");
        assert!(TransferStatus::Submitted.is_open());
        assert!(!TransferStatus::Failed.is_open());
    }

    #[test]
    fn token_symbol_parse() {
        assert_eq!("PROMPT".parse::<TokenSymbol>().unwrap(), TokenSymbol::Prompt);
        assert_eq!("DEMO".parse::<TokenSymbol>().unwrap(), TokenSymbol::Demo);
        assert!("WETH".parse::<TokenSymbol>().is_err());
    }
}
