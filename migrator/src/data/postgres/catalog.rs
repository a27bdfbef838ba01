//! Catalog reader for `pg_authid` / `pg_database`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use tokio::sync::Mutex;

use crate::data::error::{DataError, SQLSTATE_INSUFFICIENT_PRIVILEGE};
use crate::data::traits::CatalogSource;
use crate::data::types::{DatabaseAclRow, DatabaseRow, RoleRow};

use super::with_timeout;

/// `rolvaliduntil` of `'infinity'` or `'-infinity'` has no chrono value; both become NULL
const ROLES_FROM_AUTHID: &str = "SELECT rolname::text, rolcanlogin, rolsuper, rolinherit, \
     rolcreaterole, rolcreatedb, rolreplication, rolconnlimit, rolpassword, \
     NULLIF(NULLIF(rolvaliduntil, 'infinity'), '-infinity') \
     FROM pg_catalog.pg_authid";

/// `pg_roles` masks `rolpassword`, so no hash is read
const ROLES_FROM_PG_ROLES: &str = "SELECT rolname::text, rolcanlogin, rolsuper, rolinherit, \
     rolcreaterole, rolcreatedb, rolreplication, rolconnlimit, NULL::text, \
     NULLIF(NULLIF(rolvaliduntil, 'infinity'), '-infinity') \
     FROM pg_catalog.pg_roles";

const DATABASES: &str = "SELECT d.datname::text, pg_catalog.pg_get_userbyid(d.datdba)::text, \
     pg_catalog.pg_encoding_to_char(d.encoding)::text, d.datcollate::text, d.datctype::text, \
     d.datconnlimit, d.datistemplate, \
     CASE WHEN pg_catalog.has_database_privilege(d.oid, 'CONNECT') \
          THEN pg_catalog.pg_database_size(d.oid) ELSE 0 END \
     FROM pg_catalog.pg_database d WHERE d.datallowconn";

const DATABASE_ACL: &str = "SELECT pg_catalog.pg_get_userbyid(d.datdba)::text, d.datacl::text[] \
     FROM pg_catalog.pg_database d WHERE d.datname = $1";

type RoleTuple = (
    String,
    bool,
    bool,
    bool,
    bool,
    bool,
    bool,
    i32,
    Option<String>,
    Option<DateTime<Utc>>,
);

fn role_row(
    (
        name,
        can_login,
        superuser,
        inherit,
        create_role,
        create_db,
        replication,
        connection_limit,
        password_hash,
        valid_until,
    ): RoleTuple,
) -> RoleRow {
    RoleRow {
        name,
        can_login,
        superuser,
        inherit,
        create_role,
        create_db,
        replication,
        connection_limit,
        password_hash,
        valid_until,
    }
}

/// Read-only catalog access over one connection
pub struct PgCatalog {
    conn: Mutex<PgConnection>,
    server: String,
    timeout_secs: u64,
}

impl PgCatalog {
    pub fn new(conn: PgConnection, server: String, timeout_secs: u64) -> Self {
        Self {
            conn: Mutex::new(conn),
            server,
            timeout_secs,
        }
    }

    async fn query_roles(&self, sql: &'static str, name: &'static str) -> Result<Vec<RoleRow>, DataError> {
        let mut conn = self.conn.lock().await;
        let rows = with_timeout(
            name,
            self.timeout_secs,
            sqlx::query_as::<_, RoleTuple>(sql).fetch_all(&mut *conn),
        )
        .await?;
        Ok(rows.into_iter().map(role_row).collect())
    }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    fn server_label(&self) -> String {
        self.server.clone()
    }

    async fn fetch_roles(&self) -> Result<Vec<RoleRow>, DataError> {
        match self.query_roles(ROLES_FROM_AUTHID, "roles").await {
            Err(e) if e.sqlstate().as_deref() == Some(SQLSTATE_INSUFFICIENT_PRIVILEGE) => {
                tracing::warn!(
                    server = %self.server,
                    "pg_authid is not readable; reading pg_roles without password hashes"
                );
                self.query_roles(ROLES_FROM_PG_ROLES, "roles (pg_roles)").await
            }
            result => result,
        }
    }

    async fn fetch_databases(&self) -> Result<Vec<DatabaseRow>, DataError> {
        let mut conn = self.conn.lock().await;
        let rows = with_timeout(
            "databases",
            self.timeout_secs,
            sqlx::query_as::<_, (String, String, String, String, String, i32, bool, i64)>(
                DATABASES,
            )
            .fetch_all(&mut *conn),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(name, owner, encoding, collate, ctype, connection_limit, is_template, size_bytes)| {
                    DatabaseRow {
                        name,
                        owner,
                        encoding,
                        collate,
                        ctype,
                        connection_limit,
                        is_template,
                        size_bytes,
                    }
                },
            )
            .collect())
    }

    async fn fetch_database_acl(&self, database: &str) -> Result<DatabaseAclRow, DataError> {
        let mut conn = self.conn.lock().await;
        let (owner, datacl) = with_timeout(
            "database_acl",
            self.timeout_secs,
            sqlx::query_as::<_, (String, Option<Vec<String>>)>(DATABASE_ACL)
                .bind(database)
                .fetch_optional(&mut *conn),
        )
        .await?
        .ok_or_else(|| DataError::DatabaseNotFound(database.to_string()))?;
        Ok(DatabaseAclRow { owner, datacl })
    }
}
