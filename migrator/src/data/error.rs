//! Error types for the data layer
//!
//! `DataError` covers connection setup and catalog reads. `TargetError` is what
//! the destination seam reports for a single statement; the executor classifies
//! it by SQLSTATE.

use thiserror::Error;

/// SQLSTATE `insufficient_privilege`
pub const SQLSTATE_INSUFFICIENT_PRIVILEGE: &str = "42501";

/// SQLSTATE `query_canceled` (raised by `statement_timeout`)
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Error type for connection and catalog operations
#[derive(Error, Debug)]
pub enum DataError {
    /// TCP, TLS or authentication failure
    #[error("Failed to connect to {server}: {source}")]
    Connect {
        server: String,
        source: sqlx::Error,
    },

    /// Unexpected failure of a catalog query
    #[error("Catalog query '{query}' failed: {source}")]
    CatalogQuery {
        query: &'static str,
        source: sqlx::Error,
    },

    /// Query exceeded the client-side timeout
    #[error("Query '{query}' timed out after {timeout_secs}s")]
    Timeout {
        query: &'static str,
        timeout_secs: u64,
    },

    /// Database vanished between listing and its ACL read
    #[error("Database '{0}' not found")]
    DatabaseNotFound(String),
}

impl DataError {
    pub fn connect(server: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Connect {
            server: server.into(),
            source,
        }
    }

    pub fn catalog_query(query: &'static str, source: sqlx::Error) -> Self {
        Self::CatalogQuery { query, source }
    }

    pub fn timeout(query: &'static str, timeout_secs: u64) -> Self {
        Self::Timeout {
            query,
            timeout_secs,
        }
    }

    /// SQLSTATE of the underlying server error, if any
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            Self::Connect { source, .. } | Self::CatalogQuery { source, .. } => sqlstate_of(source),
            Self::Timeout { .. } | Self::DatabaseNotFound(_) => None,
        }
    }

    /// Check if this is a connection-related error that might be transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Connect { source, .. } | Self::CatalogQuery { source, .. } => {
                is_connection_loss(source)
                    || sqlstate_of(source).as_deref() == Some(SQLSTATE_QUERY_CANCELED)
            }
            Self::DatabaseNotFound(_) => false,
        }
    }
}

/// Failure of one statement against the destination
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// The server rejected the statement
    #[error("{message} (SQLSTATE {})", .code.as_deref().unwrap_or("none"))]
    Database {
        code: Option<String>,
        message: String,
    },

    /// The connection is gone; no further statement can run
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl TargetError {
    pub fn database(code: &str, message: impl Into<String>) -> Self {
        Self::Database {
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    pub fn from_sqlx(e: sqlx::Error) -> Self {
        if is_connection_loss(&e) {
            return Self::ConnectionLost(e.to_string());
        }
        match &e {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned());
                // Class 08 and admin shutdown mean the session is over
                if code
                    .as_deref()
                    .is_some_and(|c| c.starts_with("08") || c == "57P01")
                {
                    return Self::ConnectionLost(db.message().to_string());
                }
                Self::Database {
                    code,
                    message: db.message().to_string(),
                }
            }
            _ => Self::Database {
                code: None,
                message: e.to_string(),
            },
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            Self::ConnectionLost(_) => None,
        }
    }
}

fn sqlstate_of(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn is_connection_loss(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
    )
}
