//! Canton participant interaction layer.

pub mod auth;
pub mod client;
pub mod codec;
pub mod interactive;
pub mod proto;

pub use auth::{AuthConfig, TokenProvider};
pub use client::{ActiveContractsStream, LedgerClient, LedgerConfig, TlsFiles, UpdateStream};
pub use interactive::{PartySigner, UserKey};

/// Template identities used by the bridge. Package ids come from
/// configuration; module and entity names are fixed by the deployed DARs.
pub mod templates {
    use super::proto::Identifier;

    /// Singleton admin contract of the issuer party. Carries the `Mint` and
    /// `RegisterUser` choices.
    pub fn bridge_admin(bridge_package_id: &str) -> Identifier {
        Identifier {
            package_id: bridge_package_id.to_string(),
            module_name: "Bridge.Custody".to_string(),
            entity_name: "BridgeAdmin".to_string(),
        }
    }

    /// Created when a user burns; archived by `MarkCompleted`.
    pub fn withdrawal_request(bridge_package_id: &str) -> Identifier {
        Identifier {
            package_id: bridge_package_id.to_string(),
            module_name: "Bridge.Custody".to_string(),
            entity_name: "WithdrawalRequest".to_string(),
        }
    }

    /// Token holding owned by a user, administered by the issuer.
    pub fn holding(cip56_package_id: &str) -> Identifier {
        Identifier {
            package_id: cip56_package_id.to_string(),
            module_name: "CIP56.Token".to_string(),
            entity_name: "Holding".to_string(),
        }
    }

    /// Links a user party to its EVM address and routing fingerprint.
    pub fn fingerprint_mapping(common_package_id: &str) -> Identifier {
        Identifier {
            package_id: common_package_id.to_string(),
            module_name: "Bridge.Identity".to_string(),
            entity_name: "FingerprintMapping".to_string(),
        }
    }
}
