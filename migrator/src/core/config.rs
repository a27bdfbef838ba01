use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::file::expand_path;

use super::constants::{
    DEFAULT_APPLICATION_NAME, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAINTENANCE_DATABASE,
    DEFAULT_PORT, DEFAULT_PROTECTED_DATABASES, DEFAULT_PROTECTED_USERS, DEFAULT_SSL_MODE,
    DEFAULT_STATEMENT_TIMEOUT_SECS, ENV_DEST_PASSWORD, ENV_SOURCE_PASSWORD,
};

// =============================================================================
// Errors
// =============================================================================

/// Missing or malformed configuration (exit code 2)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Configuration error: {0}")]
    Invalid(String),
}

// =============================================================================
// Connection Side
// =============================================================================

/// Which end of the migration a connection config describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSide {
    Source,
    Destination,
}

impl ConnectionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Destination => "destination",
        }
    }

    /// Environment variable consulted when the config has no password
    pub fn password_env(&self) -> &'static str {
        match self {
            Self::Source => ENV_SOURCE_PASSWORD,
            Self::Destination => ENV_DEST_PASSWORD,
        }
    }
}

impl fmt::Display for ConnectionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SSL Mode Enum
// =============================================================================

/// libpq-compatible SSL mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" | "verify_ca" => Ok(Self::VerifyCa),
            "verify-full" | "verify_full" => Ok(Self::VerifyFull),
            _ => Err(ConfigError::Invalid(format!(
                "Invalid server.ssl_mode '{}'. Valid options: disable, allow, prefer, require, verify-ca, verify-full",
                s
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// File Config Structs (JSON deserialization)
// =============================================================================

/// Server configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ssl_mode: Option<String>,
    /// Maintenance database to connect to
    pub database: Option<String>,
}

/// Authentication configuration section
#[derive(Default, Clone, Deserialize)]
pub struct AuthenticationFileConfig {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for AuthenticationFileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationFileConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Connection tuning section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConnectionFileConfig {
    /// Per-statement timeout in seconds (default: 30)
    pub statement_timeout_secs: Option<u64>,
    /// Connect timeout in seconds (default: 10)
    pub connect_timeout_secs: Option<u64>,
    pub application_name: Option<String>,
}

/// Names excluded from migration
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CleanupProtectionFileConfig {
    pub protected_databases: Option<Vec<String>>,
    pub protected_users: Option<Vec<String>>,
}

/// File-based connection configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub authentication: Option<AuthenticationFileConfig>,
    pub connection: Option<ConnectionFileConfig>,
    pub cleanup_protection: Option<CleanupProtectionFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }
}

// =============================================================================
// Resolved Config
// =============================================================================

/// Fully resolved connection settings for one side of the migration
#[derive(Clone)]
pub struct ConnectionConfig {
    pub side: ConnectionSide,
    pub host: String,
    pub port: u16,
    pub ssl_mode: SslMode,
    pub database: String,
    pub user: String,
    /// `None` lets libpq conventions (PGPASSWORD) apply
    pub password: Option<String>,
    pub statement_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub application_name: String,
    pub protection: ProtectionConfig,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("side", &self.side)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ssl_mode", &self.ssl_mode)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("application_name", &self.application_name)
            .field("protection", &self.protection)
            .finish()
    }
}

/// Roles and databases that are never migrated or compared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionConfig {
    pub protected_users: Vec<String>,
    pub protected_databases: Vec<String>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            protected_users: DEFAULT_PROTECTED_USERS.iter().map(|s| s.to_string()).collect(),
            protected_databases: DEFAULT_PROTECTED_DATABASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ProtectionConfig {
    pub fn is_protected_user(&self, name: &str) -> bool {
        self.protected_users.iter().any(|u| u == name)
    }

    pub fn is_protected_database(&self, name: &str) -> bool {
        self.protected_databases.iter().any(|d| d == name)
    }
}

impl ConnectionConfig {
    /// Load a connection config file
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Config file values
    /// 3. Password environment variable (only when the file has no password)
    pub fn load(path: &Path, side: ConnectionSide) -> Result<Self, ConfigError> {
        let expanded = expand_path(&path.to_string_lossy());
        if !expanded.exists() {
            return Err(ConfigError::NotFound(expanded));
        }
        let file_config = FileConfig::load_from_file(&expanded)?;
        file_config.warn_unknown_fields();
        let config = Self::resolve(file_config, side, |key| std::env::var(key).ok())?;

        tracing::debug!(
            side = %side,
            host = %config.host,
            port = config.port,
            database = %config.database,
            user = %config.user,
            ssl_mode = %config.ssl_mode,
            "Connection config loaded"
        );
        Ok(config)
    }

    /// Layer file values over defaults and validate the result
    pub fn resolve<F>(file_config: FileConfig, side: ConnectionSide, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_server = file_config.server.unwrap_or_default();
        let file_auth = file_config.authentication.unwrap_or_default();
        let file_connection = file_config.connection.unwrap_or_default();
        let file_protection = file_config.cleanup_protection.unwrap_or_default();

        let ssl_mode = match file_server.ssl_mode {
            Some(ref mode) => SslMode::parse(mode)?,
            None => SslMode::parse(DEFAULT_SSL_MODE)?,
        };

        // Empty password in the file counts as absent
        let password = file_auth
            .password
            .filter(|p| !p.is_empty())
            .or_else(|| env(side.password_env()).filter(|p| !p.is_empty()));

        let defaults = ProtectionConfig::default();
        let protection = ProtectionConfig {
            protected_users: file_protection
                .protected_users
                .unwrap_or(defaults.protected_users),
            protected_databases: file_protection
                .protected_databases
                .unwrap_or(defaults.protected_databases),
        };

        let config = Self {
            side,
            host: file_server.host.unwrap_or_default(),
            port: file_server.port.unwrap_or(DEFAULT_PORT),
            ssl_mode,
            database: file_server
                .database
                .unwrap_or_else(|| DEFAULT_MAINTENANCE_DATABASE.to_string()),
            user: file_auth.user.unwrap_or_default(),
            password,
            statement_timeout_secs: file_connection
                .statement_timeout_secs
                .unwrap_or(DEFAULT_STATEMENT_TIMEOUT_SECS),
            connect_timeout_secs: file_connection
                .connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            application_name: file_connection
                .application_name
                .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string()),
            protection,
        };

        config.validate()?;
        Ok(config)
    }

    /// `host:port`, as recorded in manifests
    pub fn server_label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the configuration for consistency and correctness
    fn validate(&self) -> Result<(), ConfigError> {
        let side = self.side;
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{side}: server.host must not be empty"
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "{side}: server.port must be greater than 0"
            )));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{side}: authentication.user must not be empty"
            )));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{side}: server.database must not be empty"
            )));
        }
        if self.statement_timeout_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "{side}: connection.statement_timeout_secs must be greater than 0"
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "{side}: connection.connect_timeout_secs must be greater than 0"
            )));
        }

        if self.password.is_none() {
            tracing::debug!(
                side = %side,
                "No password configured, relying on PGPASSWORD or trust authentication"
            );
        }

        if matches!(self.ssl_mode, SslMode::Disable | SslMode::Allow)
            && !matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
        {
            tracing::warn!(
                side = %side,
                host = %self.host,
                ssl_mode = %self.ssl_mode,
                "Connecting to a remote server without requiring TLS; password hashes will cross the network"
            );
        }

        if !self.protection.is_protected_user("postgres") {
            tracing::warn!(
                side = %side,
                "cleanup_protection.protected_users does not include 'postgres'; it will be migrated like any other role"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> FileConfig {
        serde_json::from_str(json).unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    const FULL: &str = r#"{
        "server": { "host": "db.internal", "port": 6432, "ssl_mode": "require" },
        "authentication": { "user": "migrator", "password": "s3cret" },
        "cleanup_protection": {
            "protected_databases": ["ops"],
            "protected_users": ["postgres", "botpress_user"]
        }
    }"#;

    #[test]
    fn test_file_config_parse_full() {
        let config = ConnectionConfig::resolve(parse(FULL), ConnectionSide::Source, no_env).unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6432);
        assert_eq!(config.ssl_mode, SslMode::Require);
        assert_eq!(config.user, "migrator");
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert_eq!(config.protection.protected_databases, vec!["ops"]);
        assert!(config.protection.is_protected_user("botpress_user"));
        assert_eq!(config.server_label(), "db.internal:6432");
    }

    #[test]
    fn test_defaults_applied() {
        let json = r#"{ "server": { "host": "localhost" }, "authentication": { "user": "u" } }"#;
        let config = ConnectionConfig::resolve(parse(json), ConnectionSide::Destination, no_env).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ssl_mode, SslMode::Prefer);
        assert_eq!(config.database, "postgres");
        assert_eq!(config.statement_timeout_secs, 30);
        assert!(config.password.is_none());
        assert_eq!(config.protection, ProtectionConfig::default());
    }

    #[test]
    fn test_password_env_fallback_by_side() {
        let json = r#"{ "server": { "host": "localhost" }, "authentication": { "user": "u", "password": "" } }"#;
        let env = |key: &str| (key == ENV_DEST_PASSWORD).then(|| "from-env".to_string());

        let dest = ConnectionConfig::resolve(parse(json), ConnectionSide::Destination, env).unwrap();
        assert_eq!(dest.password.as_deref(), Some("from-env"));

        let source = ConnectionConfig::resolve(parse(json), ConnectionSide::Source, env).unwrap();
        assert!(source.password.is_none());
    }

    #[test]
    fn test_file_password_wins_over_env() {
        let env = |_: &str| Some("from-env".to_string());
        let config = ConnectionConfig::resolve(parse(FULL), ConnectionSide::Source, env).unwrap();
        assert_eq!(config.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_validation_rejects_missing_host() {
        let json = r#"{ "authentication": { "user": "u" } }"#;
        let err = ConnectionConfig::resolve(parse(json), ConnectionSide::Source, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("server.host"));
    }

    #[test]
    fn test_validation_rejects_missing_user() {
        let json = r#"{ "server": { "host": "localhost" } }"#;
        let err = ConnectionConfig::resolve(parse(json), ConnectionSide::Source, no_env).unwrap_err();
        assert!(err.to_string().contains("authentication.user"));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let json = r#"{
            "server": { "host": "localhost" },
            "authentication": { "user": "u" },
            "connection": { "statement_timeout_secs": 0 }
        }"#;
        let err = ConnectionConfig::resolve(parse(json), ConnectionSide::Source, no_env).unwrap_err();
        assert!(err.to_string().contains("statement_timeout_secs"));
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let json = r#"{ "server": { "host": "localhost", "ssl_mode": "sometimes" }, "authentication": { "user": "u" } }"#;
        assert!(ConnectionConfig::resolve(parse(json), ConnectionSide::Source, no_env).is_err());
    }

    #[test]
    fn test_ssl_mode_parse_variants() {
        assert_eq!(SslMode::parse("VERIFY-FULL").unwrap(), SslMode::VerifyFull);
        assert_eq!(SslMode::parse("verify_ca").unwrap(), SslMode::VerifyCa);
        assert_eq!(SslMode::Disable.to_string(), "disable");
    }

    #[test]
    fn test_unknown_fields_captured() {
        let config = parse(r#"{ "server": {}, "sever": { "host": "typo" } }"#);
        let serde_json::Value::Object(extra) = &config.extra else {
            panic!("extra should be an object");
        };
        assert!(extra.contains_key("sever"));
    }

    #[test]
    fn test_debug_hides_password() {
        let config = ConnectionConfig::resolve(parse(FULL), ConnectionSide::Source, no_env).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConnectionConfig::load(Path::new("/nonexistent/source.json"), ConnectionSide::Source)
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.json");
        fs::write(&path, FULL).unwrap();
        let config = ConnectionConfig::load(&path, ConnectionSide::Source).unwrap();
        assert_eq!(config.host, "db.internal");
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.json");
        fs::write(&path, "{ nope").unwrap();
        let err = ConnectionConfig::load(&path, ConnectionSide::Source).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
