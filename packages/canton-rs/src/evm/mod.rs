//! EVM chain interaction: deposit watching and withdrawal completion.

pub mod client;
pub mod contracts;
pub mod submitter;
pub mod watcher;

pub use client::ReceiptInfo;
pub use submitter::WithdrawalSubmitter;
pub use watcher::{DepositEvent, DepositScan, DepositWatcher};
