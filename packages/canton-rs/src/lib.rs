//! Shared library for the Canton custodial bridge.
//!
//! The bridge mirrors EVM users onto a Canton participant as externally
//! hosted parties and shuttles two tokens (PROMPT bridged in, DEMO native)
//! between the chains. This crate holds everything both service binaries
//! need:
//!
//! - [`evm`]: bridge-contract watcher and withdrawal submitter (alloy)
//! - [`ledger`]: participant gRPC client, auth, interactive submission
//! - [`keystore`]: AES-GCM-sealed per-user secp256k1 signing keys
//! - [`store`]: PostgreSQL state (users, transfers, cursors, metrics)
//! - [`error`]: the error taxonomy shared across components

pub mod amount;
pub mod error;
pub mod evm;
pub mod hash;
pub mod keystore;
pub mod ledger;
pub mod redact;
pub mod store;
pub mod types;

pub use error::{Error, ErrorKind, Result};
