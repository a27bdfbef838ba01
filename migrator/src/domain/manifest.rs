//! Migration manifest
//!
//! The manifest is the snapshot written by the extractor and read by the
//! planner and validator. Its JSON layout is the file format on disk.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::constants::{
    DEFAULT_BOOTSTRAP_OWNER, PUBLIC_GRANTEE, REDACTED, RESERVED_ROLE_PREFIX, SYSTEM_DATABASES,
};
use crate::domain::acl::GranteePrivileges;
use crate::domain::privilege::{Privilege, PrivilegeSet};
use crate::utils::json;

/// A cluster-wide role
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    pub can_login: bool,
    pub superuser: bool,
    pub inherit: bool,
    pub create_role: bool,
    pub create_db: bool,
    pub replication: bool,
    /// -1 means unlimited
    pub connection_limit: i32,
    /// Pre-hashed SCRAM/MD5 secret, copied verbatim
    pub password_hash: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Role")
            .field("name", &self.name)
            .field("can_login", &self.can_login)
            .field("superuser", &self.superuser)
            .field("inherit", &self.inherit)
            .field("create_role", &self.create_role)
            .field("create_db", &self.create_db)
            .field("replication", &self.replication)
            .field("connection_limit", &self.connection_limit)
            .field("password_hash", &self.password_hash.as_ref().map(|_| REDACTED))
            .field("valid_until", &self.valid_until)
            .finish()
    }
}

impl Role {
    /// A login role with PostgreSQL's default attributes
    pub fn login(name: &str) -> Self {
        Self {
            name: name.to_string(),
            can_login: true,
            superuser: false,
            inherit: true,
            create_role: false,
            create_db: false,
            replication: false,
            connection_limit: -1,
            password_hash: None,
            valid_until: None,
        }
    }
}

/// A database as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub name: String,
    pub owner: String,
    pub encoding: String,
    pub collate: String,
    pub ctype: String,
    pub connection_limit: i32,
    pub is_system: bool,
    #[serde(default)]
    pub is_template: bool,
    #[serde(rename = "sizeMB", default)]
    pub size_mb: f64,
}

impl Database {
    pub fn is_system_name(name: &str) -> bool {
        SYSTEM_DATABASES.contains(&name)
    }
}

/// Privileges of one grantee on one database, as stored in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantEntry {
    /// Role name, or `"public"`
    pub grantee: String,
    pub privileges: PrivilegeSet,
    pub grantable: bool,
}

impl GrantEntry {
    /// Split a grantee's merged privileges into non-grantable and grantable entries
    pub fn from_privileges(grantee: &str, held: &GranteePrivileges) -> Vec<GrantEntry> {
        let plain = held.privileges.difference(&held.grant_options);
        let grantable = held.grant_options.clone();

        let mut entries = Vec::new();
        if !plain.is_empty() {
            entries.push(GrantEntry {
                grantee: grantee.to_string(),
                privileges: plain,
                grantable: false,
            });
        }
        if !grantable.is_empty() {
            entries.push(GrantEntry {
                grantee: grantee.to_string(),
                privileges: grantable,
                grantable: true,
            });
        }
        entries
    }

    pub fn is_public(&self) -> bool {
        self.grantee == PUBLIC_GRANTEE
    }
}

/// Flattened `(database, grantee, privilege)` triple
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Grant {
    pub database: String,
    pub grantee: String,
    pub privilege: Privilege,
    pub grantable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionInfo {
    /// `host:port`
    pub source_server: String,
    pub extracted_at: DateTime<Utc>,
    pub extractor_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    pub total_roles: usize,
    pub total_databases: usize,
    pub user_databases: usize,
    pub total_grants: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub extraction_info: ExtractionInfo,
    pub roles: Vec<Role>,
    pub databases: Vec<Database>,
    pub grants_by_database: BTreeMap<String, Vec<GrantEntry>>,
    /// Grants whose grantee is not migrated (protected, reserved or dropped roles)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unresolved_grants: BTreeMap<String, Vec<GrantEntry>>,
    /// Databases whose grants could not be read; their grant lists are unknown
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extraction_errors: BTreeMap<String, String>,
    pub summary: ManifestSummary,
}

/// A broken manifest invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    UnknownGrantee { database: String, grantee: String },
    UnknownDatabase { database: String },
    SystemDatabaseGrants { database: String },
    MissingOwner { database: String, owner: String },
    ReservedRole { role: String },
}

impl InvariantViolation {
    /// Violations that make a manifest unusable for planning
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownGrantee { .. } | Self::UnknownDatabase { .. } | Self::SystemDatabaseGrants { .. }
        )
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownGrantee { database, grantee } => write!(
                f,
                "grantee '{}' on database '{}' is neither a manifest role nor public",
                grantee, database
            ),
            Self::UnknownDatabase { database } => {
                write!(f, "grants listed for unknown database '{}'", database)
            }
            Self::SystemDatabaseGrants { database } => {
                write!(f, "grants listed for system database '{}'", database)
            }
            Self::MissingOwner { database, owner } => write!(
                f,
                "owner '{}' of database '{}' is not a manifest role",
                owner, database
            ),
            Self::ReservedRole { role } => write!(f, "role '{}' uses the reserved pg_ prefix", role),
        }
    }
}

impl Manifest {
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn database(&self, name: &str) -> Option<&Database> {
        self.databases.iter().find(|d| d.name == name)
    }

    /// Non-system databases in manifest order
    pub fn user_databases(&self) -> impl Iterator<Item = &Database> {
        self.databases.iter().filter(|d| !d.is_system)
    }

    pub fn grants_for(&self, database: &str) -> &[GrantEntry] {
        self.grants_by_database
            .get(database)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn unresolved_for(&self, database: &str) -> &[GrantEntry] {
        self.unresolved_grants
            .get(database)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Explicit privileges per grantee on a database, merged across entries
    pub fn explicit_privileges(&self, database: &str) -> BTreeMap<&str, PrivilegeSet> {
        let mut merged: BTreeMap<&str, PrivilegeSet> = BTreeMap::new();
        for entry in self.grants_for(database) {
            merged
                .entry(entry.grantee.as_str())
                .or_default()
                .extend(entry.privileges.iter());
        }
        merged
    }

    /// All grants flattened into sorted triples
    pub fn grants(&self) -> Vec<Grant> {
        let mut grants: Vec<Grant> = self
            .grants_by_database
            .iter()
            .flat_map(|(database, entries)| {
                entries.iter().flat_map(move |entry| {
                    entry.privileges.iter().map(move |privilege| Grant {
                        database: database.clone(),
                        grantee: entry.grantee.clone(),
                        privilege,
                        grantable: entry.grantable,
                    })
                })
            })
            .collect();
        grants.sort();
        grants
    }

    pub fn compute_summary(&self) -> ManifestSummary {
        ManifestSummary {
            total_roles: self.roles.len(),
            total_databases: self.databases.len(),
            user_databases: self.user_databases().count(),
            total_grants: self.grants().len(),
        }
    }

    /// Check invariants I1-I4 (I5 is enforced by `PrivilegeSet`)
    pub fn invariant_violations(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        for (database, entries) in &self.grants_by_database {
            match self.database(database) {
                None => violations.push(InvariantViolation::UnknownDatabase {
                    database: database.clone(),
                }),
                Some(db) if db.is_system => violations.push(InvariantViolation::SystemDatabaseGrants {
                    database: database.clone(),
                }),
                Some(_) => {}
            }
            for entry in entries {
                if !entry.is_public() && self.role(&entry.grantee).is_none() {
                    violations.push(InvariantViolation::UnknownGrantee {
                        database: database.clone(),
                        grantee: entry.grantee.clone(),
                    });
                }
            }
        }

        for db in self.user_databases() {
            if db.owner != DEFAULT_BOOTSTRAP_OWNER && self.role(&db.owner).is_none() {
                violations.push(InvariantViolation::MissingOwner {
                    database: db.name.clone(),
                    owner: db.owner.clone(),
                });
            }
        }

        for role in &self.roles {
            if role.name.starts_with(RESERVED_ROLE_PREFIX) {
                violations.push(InvariantViolation::ReservedRole {
                    role: role.name.clone(),
                });
            }
        }

        violations
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        json::read_json(path)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        json::write_json(path, self)
    }
}
