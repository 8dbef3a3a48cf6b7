use canton_rs::ledger::{AuthConfig, LedgerConfig, TlsFiles};
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// API server configuration. Shares the YAML file with the relayer; each
/// process reads the sections it needs.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub canton: CantonConfig,
    #[serde(default)]
    pub key_management: KeyManagementConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-request deadline, seconds.
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub idle_timeout: u64,
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 120,
            shutdown_timeout: 20,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub sslmode: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            dbname: String::new(),
            sslmode: "disable".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.dbname, self.sslmode
        )
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CantonConfig {
    pub rpc_url: String,
    pub synchronizer_id: String,
    pub application_id: String,
    /// The issuer party administering custodial holdings.
    pub relayer_party: String,
    pub bridge_package_id: String,
    pub cip56_package_id: String,
    pub common_package_id: String,
    pub tls: TlsSection,
    pub auth: AuthSection,
    pub dedup_duration: u64,
    pub max_inbound_message_size: usize,
    pub request_timeout: u64,
}

impl Default for CantonConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            synchronizer_id: String::new(),
            application_id: "canton-bridge".to_string(),
            relayer_party: String::new(),
            bridge_package_id: String::new(),
            cip56_package_id: String::new(),
            common_package_id: String::new(),
            tls: TlsSection::default(),
            auth: AuthSection::default(),
            dedup_duration: 1800,
            max_inbound_message_size: 16 * 1024 * 1024,
            request_timeout: 30,
        }
    }
}

impl fmt::Debug for CantonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CantonConfig")
            .field("rpc_url", &self.rpc_url)
            .field("synchronizer_id", &self.synchronizer_id)
            .field("application_id", &self.application_id)
            .field("relayer_party", &self.relayer_party)
            .field("bridge_package_id", &self.bridge_package_id)
            .field("cip56_package_id", &self.cip56_package_id)
            .field("common_package_id", &self.common_package_id)
            .finish()
    }
}

impl CantonConfig {
    pub fn ledger_config(&self) -> LedgerConfig {
        let tls = if self.tls.enabled {
            Some(TlsFiles {
                ca_cert: self.tls.ca.clone(),
                client_cert: self.tls.cert.clone(),
                client_key: self.tls.key.clone(),
            })
        } else {
            None
        };
        LedgerConfig {
            rpc_url: self.rpc_url.clone(),
            synchronizer_id: self.synchronizer_id.clone(),
            application_id: self.application_id.clone(),
            auth: self.auth.to_auth_config(),
            tls,
            call_timeout: Duration::from_secs(self.request_timeout),
            dedup_duration: Duration::from_secs(self.dedup_duration),
            max_inbound_message_size: self.max_inbound_message_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsSection {
    pub enabled: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthSection {
    pub jwt_issuer: Option<String>,
    pub token_file: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub audience: Option<String>,
    pub token_url: Option<String>,
}

impl AuthSection {
    pub fn to_auth_config(&self) -> Option<AuthConfig> {
        if let Some(path) = &self.token_file {
            return Some(AuthConfig::TokenFile { path: path.clone() });
        }
        match (&self.client_id, &self.client_secret, &self.token_url) {
            (Some(client_id), Some(client_secret), Some(token_url)) => {
                Some(AuthConfig::ClientCredentials {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    audience: self.audience.clone().unwrap_or_default(),
                    token_url: token_url.clone(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSection")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("token_file", &self.token_file)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("audience", &self.audience)
            .field("token_url", &self.token_url)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyManagementConfig {
    /// Environment variable holding the hex master key.
    pub master_key_env: String,
    /// `generate` (fresh keys) or `derive` (HKDF from a seed).
    pub key_derivation: String,
    /// Environment variable holding the derivation seed (hex, ≥ 32 bytes).
    pub seed_env: String,
}

impl Default for KeyManagementConfig {
    fn default() -> Self {
        Self {
            master_key_env: "CANTON_MASTER_KEY".to_string(),
            key_derivation: "generate".to_string(),
            seed_env: "CANTON_KEY_SEED".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Verification of the party signature in ledger-originated
    /// registration; disabled only in development.
    pub verify_ledger_signature: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            verify_ledger_signature: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Bound on the startup reconciliation run, seconds.
    pub initial_timeout: u64,
    /// Seconds between periodic runs.
    pub interval: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            initial_timeout: 120,
            interval: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "console".to_string(),
            output_path: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("Failed to load .env file")?;
        }
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        let mut config: Config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .build()
            .wrap_err_with(|| format!("Failed to read configuration from {path}"))?
            .try_deserialize()
            .wrap_err("Failed to deserialize configuration")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("SERVER_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = env::var("SERVER_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = env::var("DATABASE_HOST") {
            self.database.host = v;
        }
        if let Ok(v) = env::var("DATABASE_PORT") {
            if let Ok(port) = v.parse() {
                self.database.port = port;
            }
        }
        if let Ok(v) = env::var("DATABASE_USER") {
            self.database.user = v;
        }
        if let Ok(v) = env::var("DATABASE_PASSWORD") {
            self.database.password = v;
        }
        if let Ok(v) = env::var("DATABASE_DBNAME") {
            self.database.dbname = v;
        }
        if let Ok(v) = env::var("DATABASE_SSLMODE") {
            self.database.sslmode = v;
        }
        if let Ok(v) = env::var("CANTON_RPC_URL") {
            self.canton.rpc_url = v;
        }
        if let Ok(v) = env::var("LOGGING_LEVEL") {
            self.logging.level = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database.user.is_empty() || self.database.dbname.is_empty() {
            return Err(eyre!("database.user and database.dbname are required"));
        }
        if self.canton.rpc_url.is_empty() {
            return Err(eyre!("canton.rpc_url is required"));
        }
        if self.canton.relayer_party.is_empty() {
            return Err(eyre!("canton.relayer_party is required"));
        }
        if self.canton.bridge_package_id.is_empty() || self.canton.common_package_id.is_empty() {
            return Err(eyre!("canton package ids (bridge, common) are required"));
        }
        match self.key_management.key_derivation.as_str() {
            "generate" | "derive" => {}
            other => {
                return Err(eyre!(
                    "key_management.key_derivation must be 'generate' or 'derive', got {other:?}"
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.key_management.master_key_env, "CANTON_MASTER_KEY");
        assert_eq!(config.key_management.key_derivation, "generate");
        assert_eq!(config.reconciliation.initial_timeout, 120);
        assert_eq!(config.reconciliation.interval, 300);
        assert!(config.registration.verify_ledger_signature);
    }

    #[test]
    fn invalid_key_derivation_rejected() {
        let mut config = Config {
            database: DatabaseConfig {
                user: "bridge".into(),
                dbname: "bridge".into(),
                ..Default::default()
            },
            canton: CantonConfig {
                rpc_url: "http://localhost:5011".into(),
                relayer_party: "issuer::1220aa".into(),
                bridge_package_id: "pkg-bridge".into(),
                common_package_id: "pkg-common".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        config.key_management.key_derivation = "hsm".into();
        assert!(config.validate().is_err());
    }
}
