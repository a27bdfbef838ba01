//! Destination side: probes, autocommit execution and dry-run preparation
//!
//! Statements run through `sqlx::raw_sql` on a bare connection. No
//! transaction is ever opened here, so `CREATE DATABASE` is legal and each
//! statement commits on its own.

use async_trait::async_trait;
use sqlx::Executor;
use sqlx::postgres::PgConnection;

use crate::data::error::TargetError;
use crate::data::traits::ApplyTarget;
use crate::domain::plan::{Action, Statement, VerificationQuery};
use crate::domain::privilege::{Privilege, PrivilegeSet};

const ROLE_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1)";

const DATABASE_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1)";

const DATABASE_OWNER: &str = "SELECT pg_catalog.pg_get_userbyid(datdba)::text \
     FROM pg_catalog.pg_database WHERE datname = $1";

const DATACL_IS_NULL: &str =
    "SELECT datacl IS NULL FROM pg_catalog.pg_database WHERE datname = $1";

/// Explicit ACL rows of one grantee; grantee OID 0 is PUBLIC
const GRANTEE_ACL: &str = "SELECT a.privilege_type, a.is_grantable \
     FROM pg_catalog.pg_database d CROSS JOIN LATERAL aclexplode(d.datacl) a \
     WHERE d.datname = $1 \
       AND CASE WHEN a.grantee = 0 THEN 'public' \
                ELSE pg_catalog.pg_get_userbyid(a.grantee)::text END = $2";

/// Explicit ACL state of one grantee on one database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct GranteeAcl {
    privileges: PrivilegeSet,
    grant_options: PrivilegeSet,
}

/// Catalog lookup that tells whether an action's effect is already present
#[derive(Debug, PartialEq, Eq)]
enum Probe<'a> {
    RoleExists(&'a str),
    DatabaseExists(&'a str),
    DatabaseOwner(&'a str),
    GranteeAcl { database: &'a str, grantee: &'a str },
}

impl<'a> Probe<'a> {
    fn for_action(action: &'a Action) -> Self {
        match action {
            Action::CreateRole(role) => Self::RoleExists(&role.name),
            Action::CreateDatabase { database, .. } => Self::DatabaseExists(&database.name),
            Action::AlterOwner { database, .. } => Self::DatabaseOwner(database),
            Action::Grant {
                database, grantee, ..
            }
            | Action::Revoke {
                database, grantee, ..
            } => Self::GranteeAcl { database, grantee },
        }
    }
}

/// What a probe found on the destination
#[derive(Debug)]
enum Observed {
    Exists(bool),
    /// `None` when the database is missing
    Owner(Option<String>),
    /// `None` when the database is missing or its `datacl` is NULL
    Acl(Option<GranteeAcl>),
}

/// Fold `aclexplode` rows into one grantee's ACL
///
/// `datacl_is_null` is `None` for a missing database. A NULL `datacl` yields
/// `None` so the statement runs and the ACL becomes explicit.
fn grantee_acl_from_rows(
    datacl_is_null: Option<bool>,
    rows: &[(String, bool)],
) -> Option<GranteeAcl> {
    if datacl_is_null != Some(false) {
        return None;
    }
    let mut acl = GranteeAcl::default();
    for (privilege_type, is_grantable) in rows {
        if let Ok(privilege) = privilege_type.parse::<Privilege>() {
            acl.privileges.insert(privilege);
            if *is_grantable {
                acl.grant_options.insert(privilege);
            }
        }
    }
    Some(acl)
}

/// Whether `action` can be skipped given what its probe observed
fn already_applied(action: &Action, observed: &Observed) -> bool {
    match (action, observed) {
        (Action::CreateRole(_) | Action::CreateDatabase { .. }, Observed::Exists(found)) => {
            *found
        }
        (Action::AlterOwner { owner, .. }, Observed::Owner(current)) => {
            current.as_deref() == Some(owner.as_str())
        }
        (
            Action::Grant {
                privileges,
                grantable,
                ..
            },
            Observed::Acl(Some(acl)),
        ) => {
            acl.privileges.is_superset(privileges)
                && (!grantable || acl.grant_options.is_superset(privileges))
        }
        (Action::Revoke { privileges, .. }, Observed::Acl(Some(acl))) => {
            privileges.iter().all(|p| !acl.privileges.contains(p))
        }
        _ => false,
    }
}

pub struct PgTarget {
    conn: PgConnection,
}

impl PgTarget {
    pub fn new(conn: PgConnection) -> Self {
        Self { conn }
    }

    pub fn into_connection(self) -> PgConnection {
        self.conn
    }

    async fn observe(&mut self, probe: &Probe<'_>) -> Result<Observed, TargetError> {
        match probe {
            Probe::RoleExists(name) => sqlx::query_scalar(ROLE_EXISTS)
                .bind(*name)
                .fetch_one(&mut self.conn)
                .await
                .map(Observed::Exists)
                .map_err(TargetError::from_sqlx),
            Probe::DatabaseExists(name) => sqlx::query_scalar(DATABASE_EXISTS)
                .bind(*name)
                .fetch_one(&mut self.conn)
                .await
                .map(Observed::Exists)
                .map_err(TargetError::from_sqlx),
            Probe::DatabaseOwner(database) => sqlx::query_scalar(DATABASE_OWNER)
                .bind(*database)
                .fetch_optional(&mut self.conn)
                .await
                .map(Observed::Owner)
                .map_err(TargetError::from_sqlx),
            Probe::GranteeAcl { database, grantee } => {
                let is_null: Option<bool> = sqlx::query_scalar(DATACL_IS_NULL)
                    .bind(*database)
                    .fetch_optional(&mut self.conn)
                    .await
                    .map_err(TargetError::from_sqlx)?;
                let rows: Vec<(String, bool)> = if is_null == Some(false) {
                    sqlx::query_as(GRANTEE_ACL)
                        .bind(*database)
                        .bind(*grantee)
                        .fetch_all(&mut self.conn)
                        .await
                        .map_err(TargetError::from_sqlx)?
                } else {
                    Vec::new()
                };
                Ok(Observed::Acl(grantee_acl_from_rows(is_null, &rows)))
            }
        }
    }
}

#[async_trait]
impl ApplyTarget for PgTarget {
    async fn exists(&mut self, action: &Action) -> Result<bool, TargetError> {
        let probe = Probe::for_action(action);
        let observed = self.observe(&probe).await?;
        tracing::trace!(?probe, ?observed, "Probed destination state");
        Ok(already_applied(action, &observed))
    }

    async fn execute(&mut self, statement: &Statement) -> Result<(), TargetError> {
        (&mut self.conn)
            .execute(sqlx::raw_sql(&statement.sql))
            .await
            .map(|_| ())
            .map_err(TargetError::from_sqlx)
    }

    async fn prepare(&mut self, statement: &Statement) -> Result<(), TargetError> {
        (&mut self.conn)
            .prepare(statement.sql.as_str())
            .await
            .map(|_| ())
            .map_err(TargetError::from_sqlx)
    }

    async fn count(&mut self, query: &VerificationQuery) -> Result<i64, TargetError> {
        sqlx::query_scalar::<_, i64>(query.sql.as_str())
            .fetch_one(&mut self.conn)
            .await
            .map_err(TargetError::from_sqlx)
    }
}
