//! Seams between the pipeline and a PostgreSQL server
//!
//! `CatalogSource` is the read side used by extraction and validation.
//! `ApplyTarget` is the destination side used by the executor. Both are
//! implemented for PostgreSQL in `data::postgres` and by the in-memory cluster
//! used in tests.

use async_trait::async_trait;

use crate::data::error::{DataError, TargetError};
use crate::data::types::{DatabaseAclRow, DatabaseRow, RoleRow};
use crate::domain::plan::{Action, Statement, VerificationQuery};

/// Read-only access to the cluster catalogs
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// `host:port` of the server being read
    fn server_label(&self) -> String;

    /// All roles, `pg_`-reserved ones included
    async fn fetch_roles(&self) -> Result<Vec<RoleRow>, DataError>;

    /// All databases that accept connections
    async fn fetch_databases(&self) -> Result<Vec<DatabaseRow>, DataError>;

    /// Owner and raw `datacl` of one database
    async fn fetch_database_acl(&self, database: &str) -> Result<DatabaseAclRow, DataError>;
}

/// Autocommit statement execution on the destination
#[async_trait]
pub trait ApplyTarget: Send {
    /// Whether the action's effect already holds
    async fn exists(&mut self, action: &Action) -> Result<bool, TargetError>;

    /// Run one statement in its own implicit transaction
    async fn execute(&mut self, statement: &Statement) -> Result<(), TargetError>;

    /// Parse and describe a statement without running it
    async fn prepare(&mut self, statement: &Statement) -> Result<(), TargetError>;

    /// Run a read-only count query
    async fn count(&mut self, query: &VerificationQuery) -> Result<i64, TargetError>;
}
