//! Integration tests for the bridge relayer.
//!
//! Run with: cargo test --test integration_test -- --nocapture
//!
//! Prerequisites for the ignored tests:
//! - Anvil (or another EVM node) running
//! - A Canton participant with the bridge DARs loaded
//! - DATABASE_URL pointing at a migrated bridge database

use canton_rs::hash::{burn_id, deposit_command_id};
use canton_rs::store;
use canton_rs::types::{Direction, TokenSymbol};

mod helpers {
    use std::time::Duration;

    /// Test configuration loaded from environment variables
    pub struct TestConfig {
        pub evm_rpc_url: String,
        pub canton_rpc_url: String,
        pub database_url: String,
        pub bridge_address: String,
    }

    impl TestConfig {
        pub fn from_env() -> Option<Self> {
            Some(TestConfig {
                evm_rpc_url: std::env::var("EVM_RPC_URL").ok()?,
                canton_rpc_url: std::env::var("CANTON_RPC_URL").ok()?,
                database_url: std::env::var("DATABASE_URL").ok()?,
                bridge_address: std::env::var("EVM_BRIDGE_ADDRESS").ok()?,
            })
        }
    }

    /// Check EVM RPC connectivity
    pub async fn check_evm_connectivity(rpc_url: &str) -> bool {
        match reqwest::Client::new()
            .post(rpc_url)
            .header("content-type", "application/json")
            .body(r#"{"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}"#)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Check database connectivity
    pub async fn check_database_connectivity(url: &str) -> bool {
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .is_ok()
    }
}

// ============================================================================
// Environment tests (require running infrastructure)
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_environment_setup() {
    let config = helpers::TestConfig::from_env();
    assert!(
        config.is_some(),
        "Test configuration not found. Set required environment variables: \
         EVM_RPC_URL, CANTON_RPC_URL, DATABASE_URL, EVM_BRIDGE_ADDRESS"
    );

    let config = config.unwrap();

    assert!(
        helpers::check_evm_connectivity(&config.evm_rpc_url).await,
        "Failed to connect to EVM RPC at {}",
        config.evm_rpc_url
    );
    println!("EVM RPC OK: {}", config.evm_rpc_url);

    assert!(
        helpers::check_database_connectivity(&config.database_url).await,
        "Failed to connect to database"
    );
    println!("Database OK");
    println!("Bridge contract: {}", config.bridge_address);
}

#[tokio::test]
#[ignore]
async fn test_cursor_is_monotone() {
    let config = helpers::TestConfig::from_env().expect("Test configuration required");
    let pool = store::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    store::run_migrations(&pool).await.expect("migrations");

    store::ensure_cursor(&pool, Direction::Inbound, 100)
        .await
        .unwrap();
    let before = store::cursor(&pool, Direction::Inbound).await.unwrap().unwrap();

    // Forward is fine
    store::set_cursor(&pool, Direction::Inbound, before + 10)
        .await
        .unwrap();

    // Backward must fail and leave the cursor untouched
    let err = store::set_cursor(&pool, Direction::Inbound, before - 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), canton_rs::ErrorKind::Conflict);
    let after = store::cursor(&pool, Direction::Inbound).await.unwrap().unwrap();
    assert_eq!(after, before + 10);
}

#[tokio::test]
#[ignore]
async fn test_transfer_dedup_on_source_key() {
    let config = helpers::TestConfig::from_env().expect("Test configuration required");
    let pool = store::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    store::run_migrations(&pool).await.expect("migrations");

    let transfer = store::NewTransfer {
        direction: Direction::Inbound,
        source_tx_hash: format!("0xtest-{}:0", chrono::Utc::now().timestamp_nanos_opt().unwrap()),
        source_position: 42,
        recipient: "ab".repeat(32),
        token: TokenSymbol::Prompt,
        amount: "1.000000000000000000".to_string(),
        ledger_cid: None,
    };

    let first = store::upsert_transfer(&pool, &transfer).await.unwrap();
    let second = store::upsert_transfer(&pool, &transfer).await.unwrap();
    assert_eq!(first, second, "re-observing an event must not create a second row");

    let row = store::transfer_by_id(&pool, first).await.unwrap().unwrap();
    assert_eq!(row.status, canton_rs::types::TransferStatus::Observed);
}

#[tokio::test]
#[ignore]
async fn test_relayer_status_endpoint() {
    let base = std::env::var("RELAYER_URL").unwrap_or_else(|_| "http://localhost:9090".into());

    let health = reqwest::get(format!("{base}/health")).await.unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "OK");

    let status = reqwest::get(format!("{base}/api/v1/status")).await.unwrap();
    assert!(status.status().is_success());
    let body = status.text().await.unwrap();
    println!("Status: {body}");
    assert!(body.contains("cursors"));
}

// ============================================================================
// Unit tests (no infrastructure required)
// ============================================================================

#[test]
fn mint_command_id_is_stable_across_restarts() {
    // The crash-recovery property: the same source event always derives the
    // same participant command id, so a re-submission deduplicates.
    let first = deposit_command_id("0xaa11bb22", 3);
    let second = deposit_command_id("0xaa11bb22", 3);
    assert_eq!(first, second);

    assert_ne!(first, deposit_command_id("0xaa11bb22", 4));
    assert_ne!(first, deposit_command_id("0xcc33dd44", 3));
}

#[test]
fn burn_id_distinguishes_nodes_within_an_update() {
    let update = "1220-update-id";
    assert_ne!(burn_id(update, 0), burn_id(update, 1));
    assert_eq!(burn_id(update, 0), burn_id(update, 0));
}

#[test]
fn direction_round_trips_through_wire_strings() {
    assert_eq!(Direction::Inbound.as_str(), "in");
    assert_eq!(Direction::Outbound.as_str(), "out");
    assert_eq!(
        serde_json::from_str::<Direction>("\"in\"").unwrap(),
        Direction::Inbound
    );
}
