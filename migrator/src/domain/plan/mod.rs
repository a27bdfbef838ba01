//! Planner: manifest to ordered, idempotent statements
//!
//! A plan has three statement groups that must run in order (roles,
//! databases, grants) plus read-only verification queries. Each statement
//! carries its structured [`Action`] next to the rendered SQL so the executor
//! can probe whether the effect already holds.

pub mod render;
pub mod sql;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::core::constants::{DEFAULT_BOOTSTRAP_OWNER, PUBLIC_GRANTEE};
use crate::domain::manifest::{Database, GrantEntry, Manifest, Role};
use crate::domain::privilege::{Privilege, PrivilegeSet};

/// Statement group, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Roles,
    Databases,
    Grants,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Roles => "roles",
            Self::Databases => "databases",
            Self::Grants => "grants",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a statement does, independent of its SQL text
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CreateRole(Role),
    CreateDatabase {
        database: Database,
        /// Owner at creation time; the manifest owner is set later
        owner: String,
    },
    AlterOwner {
        database: String,
        owner: String,
    },
    Grant {
        database: String,
        grantee: String,
        privileges: PrivilegeSet,
        grantable: bool,
    },
    Revoke {
        database: String,
        grantee: String,
        privileges: PrivilegeSet,
    },
}

impl Action {
    /// Short human-readable target (`role app_user`, `database app_db`)
    pub fn describe(&self) -> String {
        match self {
            Self::CreateRole(role) => format!("role {}", role.name),
            Self::CreateDatabase { database, .. } => format!("database {}", database.name),
            Self::AlterOwner { database, owner } => {
                format!("owner of {} -> {}", database, owner)
            }
            Self::Grant {
                database,
                grantee,
                privileges,
                ..
            } => format!("grant {} on {} to {}", privileges, database, grantee),
            Self::Revoke {
                database,
                grantee,
                privileges,
            } => format!("revoke {} on {} from {}", privileges, database, grantee),
        }
    }

    fn render(&self, redact: bool) -> String {
        match self {
            Self::CreateRole(role) => sql::create_role(role, redact),
            Self::CreateDatabase { database, owner } => {
                sql::create_database(&sql::CreateDatabaseSql {
                    name: &database.name,
                    owner,
                    encoding: &database.encoding,
                    collate: &database.collate,
                    ctype: &database.ctype,
                    connection_limit: database.connection_limit,
                    is_template: database.is_template,
                })
            }
            Self::AlterOwner { database, owner } => sql::alter_owner(database, owner),
            Self::Grant {
                database,
                grantee,
                privileges,
                grantable,
            } => sql::grant(database, grantee, privileges, *grantable),
            Self::Revoke {
                database,
                grantee,
                privileges,
            } => sql::revoke(database, grantee, privileges),
        }
    }

    pub fn has_secret(&self) -> bool {
        matches!(self, Self::CreateRole(role) if role.password_hash.is_some())
    }
}

/// One plan statement
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub phase: Phase,
    pub action: Action,
    /// Executable SQL (contains password hashes)
    pub sql: String,
}

impl Statement {
    pub fn new(phase: Phase, action: Action) -> Self {
        let sql = action.render(false);
        Self { phase, action, sql }
    }

    /// SQL safe for logs and reports; plan files keep the real hashes
    pub fn redacted_sql(&self) -> Cow<'_, str> {
        if self.action.has_secret() {
            Cow::Owned(self.action.render(true))
        } else {
            Cow::Borrowed(&self.sql)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationKind {
    RoleCount,
    UserDatabaseCount,
    GrantPairCount,
}

impl VerificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoleCount => "role_count",
            Self::UserDatabaseCount => "user_database_count",
            Self::GrantPairCount => "grant_pair_count",
        }
    }
}

/// Read-only count query run after the grant phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationQuery {
    pub kind: VerificationKind,
    pub sql: String,
}

impl VerificationQuery {
    pub fn all() -> Vec<Self> {
        vec![
            Self {
                kind: VerificationKind::RoleCount,
                sql: sql::role_count(),
            },
            Self {
                kind: VerificationKind::UserDatabaseCount,
                sql: sql::user_database_count(),
            },
            Self {
                kind: VerificationKind::GrantPairCount,
                sql: sql::grant_pair_count(),
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOptions {
    /// Role every database is created with
    pub bootstrap_owner: String,
    /// Also emit grants to roles that were not migrated
    pub strict: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            bootstrap_owner: DEFAULT_BOOTSTRAP_OWNER.to_string(),
            strict: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub roles: Vec<Statement>,
    pub databases: Vec<Statement>,
    pub grants: Vec<Statement>,
    pub validation: Vec<VerificationQuery>,
}

impl Plan {
    /// Executable statements in execution order
    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.roles
            .iter()
            .chain(self.databases.iter())
            .chain(self.grants.iter())
    }

    pub fn len(&self) -> usize {
        self.roles.len() + self.databases.len() + self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the plan for a manifest
pub fn plan(manifest: &Manifest, options: &PlanOptions) -> Plan {
    let roles: Vec<Statement> = manifest
        .roles
        .iter()
        .map(|role| Statement::new(Phase::Roles, Action::CreateRole(role.clone())))
        .collect();

    let databases: Vec<&Database> = manifest
        .user_databases()
        .filter(|db| !Database::is_system_name(&db.name))
        .collect();

    let database_statements = databases
        .iter()
        .map(|db| {
            Statement::new(
                Phase::Databases,
                Action::CreateDatabase {
                    database: (*db).clone(),
                    owner: options.bootstrap_owner.clone(),
                },
            )
        })
        .collect();

    let mut grants = Vec::new();
    for db in &databases {
        plan_database_grants(manifest, db, options, &mut grants);
    }

    let plan = Plan {
        roles,
        databases: database_statements,
        grants,
        validation: VerificationQuery::all(),
    };

    tracing::debug!(
        roles = plan.roles.len(),
        databases = plan.databases.len(),
        grants = plan.grants.len(),
        strict = options.strict,
        "Plan built"
    );
    plan
}

fn plan_database_grants(
    manifest: &Manifest,
    db: &Database,
    options: &PlanOptions,
    out: &mut Vec<Statement>,
) {
    if db.owner != options.bootstrap_owner {
        out.push(Statement::new(
            Phase::Grants,
            Action::AlterOwner {
                database: db.name.clone(),
                owner: db.owner.clone(),
            },
        ));
    }

    if let Some(error) = manifest.extraction_errors.get(&db.name) {
        // Grants are unknown: restore the defaults and leave the rest alone
        tracing::warn!(
            database = %db.name,
            error = %error,
            "Grants could not be extracted; only PUBLIC defaults are planned"
        );
        out.push(grant_statement(
            &db.name,
            PUBLIC_GRANTEE,
            PrivilegeSet::public_default(),
            false,
        ));
        return;
    }

    let public = manifest
        .explicit_privileges(&db.name)
        .remove(PUBLIC_GRANTEE)
        .unwrap_or_default();
    if !public.is_empty() {
        out.push(grant_statement(&db.name, PUBLIC_GRANTEE, public.clone(), false));
    }
    let revoked = PrivilegeSet::public_default().difference(&public);
    if !revoked.is_empty() {
        out.push(Statement::new(
            Phase::Grants,
            Action::Revoke {
                database: db.name.clone(),
                grantee: PUBLIC_GRANTEE.to_string(),
                privileges: revoked,
            },
        ));
    }

    let unresolved = manifest.unresolved_for(&db.name);
    if !options.strict && !unresolved.is_empty() {
        tracing::info!(
            database = %db.name,
            skipped = unresolved.len(),
            "Skipping grants to roles that are not migrated"
        );
    }
    let entries: Vec<&GrantEntry> = manifest
        .grants_for(&db.name)
        .iter()
        .chain(unresolved.iter().filter(|_| options.strict))
        .collect();

    // (grantee, privilege) -> grantable; a grantable copy subsumes a plain one
    let mut explicit: BTreeMap<(&str, Privilege), bool> = BTreeMap::new();
    for entry in entries {
        if entry.is_public() || entry.grantee == db.owner {
            continue;
        }
        for privilege in entry.privileges.iter() {
            let grantable = explicit
                .entry((entry.grantee.as_str(), privilege))
                .or_insert(false);
            *grantable |= entry.grantable;
        }
    }

    for ((grantee, privilege), grantable) in explicit {
        out.push(grant_statement(
            &db.name,
            grantee,
            PrivilegeSet::from_iter([privilege]),
            grantable,
        ));
    }
}

fn grant_statement(
    database: &str,
    grantee: &str,
    privileges: PrivilegeSet,
    grantable: bool,
) -> Statement {
    Statement::new(
        Phase::Grants,
        Action::Grant {
            database: database.to_string(),
            grantee: grantee.to_string(),
            privileges,
            grantable,
        },
    )
}
