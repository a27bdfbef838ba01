//! PostgreSQL connections
//!
//! One dedicated `PgConnection` per side, no pool:
//! - the source is read through [`PgCatalog`]
//! - the destination is written through [`PgTarget`] in autocommit mode
//!
//! Every connection carries a server-side `statement_timeout` and logs its
//! statements at `trace`.

mod catalog;
mod target;

pub use catalog::PgCatalog;
pub use target::PgTarget;

use std::future::Future;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::ConnectOptions;
use tracing::log::LevelFilter;

use crate::core::config::{ConnectionConfig, SslMode};
use crate::data::error::DataError;

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// Build connect options from a resolved config
///
/// `PgConnectOptions::new()` starts from the libpq environment (`PGPASSWORD`
/// and friends), so an absent password falls through to it.
pub fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.database)
        .ssl_mode(pg_ssl_mode(config.ssl_mode))
        .application_name(&config.application_name)
        .options([(
            "statement_timeout",
            format!("{}s", config.statement_timeout_secs),
        )])
        .log_statements(LevelFilter::Trace);

    if let Some(password) = &config.password {
        options = options.password(password);
    }
    options
}

/// Open a single connection, bounded by the connect timeout
pub async fn connect(config: &ConnectionConfig) -> Result<PgConnection, DataError> {
    let options = connect_options(config);
    let server = config.server_label();

    let conn = tokio::time::timeout(
        Duration::from_secs(config.connect_timeout_secs),
        options.connect(),
    )
    .await
    .map_err(|_| DataError::timeout("connect", config.connect_timeout_secs))?
    .map_err(|e| DataError::connect(&server, e))?;

    tracing::debug!(
        side = %config.side,
        server = %server,
        database = %config.database,
        statement_timeout_secs = config.statement_timeout_secs,
        "Connected to PostgreSQL"
    );
    Ok(conn)
}

/// Run a catalog query with a client-side timeout
pub(crate) async fn with_timeout<T, F>(
    query: &'static str,
    timeout_secs: u64,
    fut: F,
) -> Result<T, DataError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
        Ok(result) => result.map_err(|e| DataError::catalog_query(query, e)),
        Err(_) => Err(DataError::timeout(query, timeout_secs)),
    }
}
