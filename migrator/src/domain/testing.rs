//! In-memory cluster and manifest builders for tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;

use crate::core::constants::{DEFAULT_BOOTSTRAP_OWNER, PUBLIC_GRANTEE, SYSTEM_DATABASES};
use crate::data::error::{DataError, SQLSTATE_INSUFFICIENT_PRIVILEGE, TargetError};
use crate::data::traits::{ApplyTarget, CatalogSource};
use crate::data::types::{DatabaseAclRow, DatabaseRow, RoleRow};
use crate::domain::acl::{AclItem, decode_acl, encode_item};
use crate::domain::manifest::{Database, ExtractionInfo, GrantEntry, Manifest, ManifestSummary, Role};
use crate::domain::plan::{Action, Statement, VerificationKind, VerificationQuery};
use crate::domain::privilege::PrivilegeSet;

pub fn database(name: &str, owner: &str) -> Database {
    Database {
        name: name.to_string(),
        owner: owner.to_string(),
        encoding: "UTF8".to_string(),
        collate: "en_US.UTF-8".to_string(),
        ctype: "en_US.UTF-8".to_string(),
        connection_limit: -1,
        is_system: Database::is_system_name(name),
        is_template: false,
        size_mb: 0.0,
    }
}

pub fn entry(grantee: &str, privileges: PrivilegeSet, grantable: bool) -> GrantEntry {
    GrantEntry {
        grantee: grantee.to_string(),
        privileges,
        grantable,
    }
}

pub fn manifest(
    roles: Vec<Role>,
    databases: Vec<Database>,
    grants: Vec<(&str, Vec<GrantEntry>)>,
) -> Manifest {
    let mut manifest = Manifest {
        extraction_info: ExtractionInfo {
            source_server: "test:5432".to_string(),
            extracted_at: DateTime::UNIX_EPOCH,
            extractor_version: "0.0.0".to_string(),
        },
        roles,
        databases,
        grants_by_database: grants
            .into_iter()
            .map(|(db, entries)| (db.to_string(), entries))
            .collect(),
        unresolved_grants: BTreeMap::new(),
        extraction_errors: BTreeMap::new(),
        summary: ManifestSummary::default(),
    };
    manifest.summary = manifest.compute_summary();
    manifest
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeDatabase {
    pub row: DatabaseRow,
    pub datacl: Option<Vec<String>>,
    pub allow_connections: bool,
}

/// Catalog contents; compared before and after a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub roles: BTreeMap<String, Role>,
    pub databases: BTreeMap<String, FakeDatabase>,
}

#[derive(Debug, Default)]
struct Faults {
    acl_failures: BTreeMap<String, u32>,
    role_reads: bool,
    denied: Vec<String>,
    hanging: Vec<String>,
    /// Executions left before the connection drops
    connection_budget: Option<usize>,
}

/// A cluster that interprets plan actions against an in-memory catalog
pub struct FakeCluster {
    server: String,
    catalog: Mutex<Catalog>,
    faults: Mutex<Faults>,
}

fn role_row(role: &Role) -> RoleRow {
    RoleRow {
        name: role.name.clone(),
        can_login: role.can_login,
        superuser: role.superuser,
        inherit: role.inherit,
        create_role: role.create_role,
        create_db: role.create_db,
        replication: role.replication,
        connection_limit: role.connection_limit,
        password_hash: role.password_hash.clone(),
        valid_until: role.valid_until,
    }
}

fn database_row(name: &str, owner: &str) -> DatabaseRow {
    let db = database(name, owner);
    DatabaseRow {
        name: db.name,
        owner: db.owner,
        encoding: db.encoding,
        collate: db.collate,
        ctype: db.ctype,
        connection_limit: db.connection_limit,
        is_template: false,
        size_bytes: 0,
    }
}

impl FakeCluster {
    /// A fresh cluster: `postgres` superuser plus the three system databases
    pub fn new(server: &str) -> Self {
        let mut postgres = Role::login(DEFAULT_BOOTSTRAP_OWNER);
        postgres.superuser = true;
        postgres.create_role = true;
        postgres.create_db = true;
        postgres.replication = true;

        let mut catalog = Catalog::default();
        catalog.roles.insert(postgres.name.clone(), postgres);
        for name in SYSTEM_DATABASES {
            catalog.databases.insert(
                name.to_string(),
                FakeDatabase {
                    row: database_row(name, DEFAULT_BOOTSTRAP_OWNER),
                    datacl: None,
                    allow_connections: name != "template0",
                },
            );
        }

        Self {
            server: server.to_string(),
            catalog: Mutex::new(catalog),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn add_role(&self, role: Role) {
        let mut catalog = self.catalog.lock().unwrap();
        catalog.roles.insert(role.name.clone(), role);
    }

    pub fn add_database(&self, name: &str, owner: &str, datacl: Option<Vec<String>>) {
        let mut catalog = self.catalog.lock().unwrap();
        catalog.databases.insert(
            name.to_string(),
            FakeDatabase {
                row: database_row(name, owner),
                datacl,
                allow_connections: true,
            },
        );
    }

    /// Fail the next `times` ACL reads of `database`
    pub fn fail_acl_reads(&self, database: &str, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .acl_failures
            .insert(database.to_string(), times);
    }

    pub fn fail_role_reads(&self) {
        self.faults.lock().unwrap().role_reads = true;
    }

    /// Statements containing `pattern` fail with insufficient_privilege
    pub fn deny_statements_matching(&self, pattern: &str) {
        self.faults.lock().unwrap().denied.push(pattern.to_string());
    }

    /// Statements containing `pattern` never complete
    pub fn hang_on_statements_matching(&self, pattern: &str) {
        self.faults.lock().unwrap().hanging.push(pattern.to_string());
    }

    /// Drop the connection after `executions` statements ran
    pub fn lose_connection_after(&self, executions: usize) {
        self.faults.lock().unwrap().connection_budget = Some(executions);
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.catalog.lock().unwrap().roles.contains_key(name)
    }

    pub fn role_password(&self, name: &str) -> Option<String> {
        self.catalog
            .lock()
            .unwrap()
            .roles
            .get(name)
            .and_then(|r| r.password_hash.clone())
    }

    pub fn database_owner(&self, name: &str) -> Option<String> {
        self.catalog
            .lock()
            .unwrap()
            .databases
            .get(name)
            .map(|d| d.row.owner.clone())
    }

    pub fn database_acl(&self, name: &str) -> Option<Vec<String>> {
        self.catalog
            .lock()
            .unwrap()
            .databases
            .get(name)
            .and_then(|d| d.datacl.clone())
    }

    pub fn snapshot(&self) -> Catalog {
        self.catalog.lock().unwrap().clone()
    }

    fn check_connection(&self) -> Result<(), TargetError> {
        match self.faults.lock().unwrap().connection_budget {
            Some(0) => Err(TargetError::ConnectionLost(
                "server closed the connection unexpectedly".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn apply_action(&self, action: &Action) -> Result<(), TargetError> {
        let mut catalog = self.catalog.lock().unwrap();
        let Catalog { roles, databases } = &mut *catalog;

        match action {
            Action::CreateRole(role) => {
                if roles.contains_key(&role.name) {
                    return Err(TargetError::database(
                        "42710",
                        format!("role \"{}\" already exists", role.name),
                    ));
                }
                roles.insert(role.name.clone(), role.clone());
            }
            Action::CreateDatabase { database, owner } => {
                if databases.contains_key(&database.name) {
                    return Err(TargetError::database(
                        "42P04",
                        format!("database \"{}\" already exists", database.name),
                    ));
                }
                if !roles.contains_key(owner) {
                    return Err(missing_role(owner));
                }
                let mut row = database_row(&database.name, owner);
                row.connection_limit = database.connection_limit;
                row.is_template = database.is_template;
                databases.insert(
                    database.name.clone(),
                    FakeDatabase {
                        row,
                        datacl: None,
                        allow_connections: true,
                    },
                );
            }
            Action::AlterOwner { database, owner } => {
                if !roles.contains_key(owner) {
                    return Err(missing_role(owner));
                }
                let db = databases.get_mut(database).ok_or_else(|| missing_database(database))?;
                db.row.owner = owner.clone();
            }
            Action::Grant {
                database,
                grantee,
                privileges,
                grantable,
            } => {
                if grantee != PUBLIC_GRANTEE && !roles.contains_key(grantee) {
                    return Err(missing_role(grantee));
                }
                let db = databases.get_mut(database).ok_or_else(|| missing_database(database))?;
                let owner = db.row.owner.clone();
                let mut items = decode_acl(db.datacl.as_deref(), &owner).items;
                let mut item = AclItem::new(grantee, &owner, privileges.clone());
                if *grantable {
                    item.grant_options = privileges.clone();
                }
                match items
                    .iter_mut()
                    .find(|i| i.grantee == *grantee && i.grantor == owner)
                {
                    Some(existing) => {
                        existing.privileges.extend(item.privileges.iter());
                        existing.grant_options.extend(item.grant_options.iter());
                    }
                    None => items.push(item),
                }
                db.datacl = Some(items.iter().map(encode_item).collect());
            }
            Action::Revoke {
                database,
                grantee,
                privileges,
            } => {
                let db = databases.get_mut(database).ok_or_else(|| missing_database(database))?;
                let owner = db.row.owner.clone();
                let mut items = decode_acl(db.datacl.as_deref(), &owner).items;
                for item in items.iter_mut().filter(|i| i.grantee == *grantee) {
                    item.privileges = item.privileges.difference(privileges);
                    item.grant_options = item.grant_options.difference(privileges);
                }
                items.retain(|i| !i.privileges.is_empty());
                db.datacl = Some(items.iter().map(encode_item).collect());
            }
        }
        Ok(())
    }
}

fn missing_role(name: &str) -> TargetError {
    TargetError::database("42704", format!("role \"{}\" does not exist", name))
}

fn missing_database(name: &str) -> TargetError {
    TargetError::database("3D000", format!("database \"{}\" does not exist", name))
}

#[async_trait]
impl CatalogSource for FakeCluster {
    fn server_label(&self) -> String {
        self.server.clone()
    }

    async fn fetch_roles(&self) -> Result<Vec<RoleRow>, DataError> {
        if self.faults.lock().unwrap().role_reads {
            return Err(DataError::timeout("roles", 1));
        }
        Ok(self.catalog.lock().unwrap().roles.values().map(role_row).collect())
    }

    async fn fetch_databases(&self) -> Result<Vec<DatabaseRow>, DataError> {
        Ok(self
            .catalog
            .lock()
            .unwrap()
            .databases
            .values()
            .filter(|d| d.allow_connections)
            .map(|d| d.row.clone())
            .collect())
    }

    async fn fetch_database_acl(&self, database: &str) -> Result<DatabaseAclRow, DataError> {
        {
            let mut faults = self.faults.lock().unwrap();
            if let Some(remaining) = faults.acl_failures.get_mut(database)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(DataError::timeout("database_acl", 1));
            }
        }
        let catalog = self.catalog.lock().unwrap();
        let db = catalog
            .databases
            .get(database)
            .ok_or_else(|| DataError::DatabaseNotFound(database.to_string()))?;
        Ok(DatabaseAclRow {
            owner: db.row.owner.clone(),
            datacl: db.datacl.clone(),
        })
    }
}

#[async_trait]
impl ApplyTarget for FakeCluster {
    async fn exists(&mut self, action: &Action) -> Result<bool, TargetError> {
        self.check_connection()?;
        let catalog = self.catalog.lock().unwrap();
        Ok(match action {
            Action::CreateRole(role) => catalog.roles.contains_key(&role.name),
            Action::CreateDatabase { database, .. } => catalog.databases.contains_key(&database.name),
            Action::AlterOwner { database, owner } => catalog
                .databases
                .get(database)
                .is_some_and(|d| d.row.owner == *owner),
            Action::Grant {
                database,
                grantee,
                privileges,
                grantable,
            } => catalog.databases.get(database).is_some_and(|d| {
                d.datacl.as_ref().is_some_and(|acl| {
                    let held = decode_acl(Some(acl.as_slice()), &d.row.owner).by_grantee();
                    held.get(grantee).is_some_and(|g| {
                        g.privileges.is_superset(privileges)
                            && (!grantable || g.grant_options.is_superset(privileges))
                    })
                })
            }),
            Action::Revoke {
                database,
                grantee,
                privileges,
            } => catalog.databases.get(database).is_some_and(|d| {
                d.datacl.as_ref().is_some_and(|acl| {
                    let held = decode_acl(Some(acl.as_slice()), &d.row.owner).by_grantee();
                    held.get(grantee)
                        .is_none_or(|g| privileges.iter().all(|p| !g.privileges.contains(p)))
                })
            }),
        })
    }

    async fn execute(&mut self, statement: &Statement) -> Result<(), TargetError> {
        self.check_connection()?;
        let (denied, hangs) = {
            let mut faults = self.faults.lock().unwrap();
            if let Some(budget) = faults.connection_budget.as_mut() {
                *budget -= 1;
            }
            (
                faults.denied.iter().any(|p| statement.sql.contains(p.as_str())),
                faults.hanging.iter().any(|p| statement.sql.contains(p.as_str())),
            )
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        if denied {
            return Err(TargetError::database(
                SQLSTATE_INSUFFICIENT_PRIVILEGE,
                "permission denied",
            ));
        }
        self.apply_action(&statement.action)
    }

    async fn prepare(&mut self, _statement: &Statement) -> Result<(), TargetError> {
        self.check_connection()
    }

    async fn count(&mut self, query: &VerificationQuery) -> Result<i64, TargetError> {
        self.check_connection()?;
        let catalog = self.catalog.lock().unwrap();
        let user_databases = catalog
            .databases
            .values()
            .filter(|d| !SYSTEM_DATABASES.contains(&d.row.name.as_str()));
        let count = match query.kind {
            VerificationKind::RoleCount => catalog.roles.len(),
            VerificationKind::UserDatabaseCount => user_databases.filter(|d| d.allow_connections).count(),
            VerificationKind::GrantPairCount => user_databases
                .map(|d| {
                    let grantees: BTreeSet<String> = d
                        .datacl
                        .as_ref()
                        .map(|acl| decode_acl(Some(acl.as_slice()), &d.row.owner).by_grantee().into_keys().collect())
                        .unwrap_or_default();
                    grantees.len()
                })
                .sum(),
        };
        Ok(count as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plan::Phase;
    use crate::domain::privilege::Privilege;

    #[tokio::test]
    async fn test_grant_materializes_default_acl() {
        let mut cluster = FakeCluster::new("fake:5432");
        cluster.add_role(Role::login("reader"));
        cluster.add_database("app_db", "postgres", None);

        let grant = Statement::new(
            Phase::Grants,
            Action::Grant {
                database: "app_db".into(),
                grantee: "reader".into(),
                privileges: PrivilegeSet::from_iter([Privilege::Connect]),
                grantable: false,
            },
        );
        assert!(!cluster.exists(&grant.action).await.unwrap());
        cluster.execute(&grant).await.unwrap();
        assert!(cluster.exists(&grant.action).await.unwrap());

        let acl = cluster.database_acl("app_db").unwrap();
        assert!(acl.contains(&"=Tc/postgres".to_string()));
        assert!(acl.contains(&"reader=c/postgres".to_string()));
    }

    #[tokio::test]
    async fn test_grant_to_missing_role() {
        let mut cluster = FakeCluster::new("fake:5432");
        cluster.add_database("app_db", "postgres", None);
        let grant = Statement::new(
            Phase::Grants,
            Action::Grant {
                database: "app_db".into(),
                grantee: "ghost".into(),
                privileges: PrivilegeSet::all(),
                grantable: false,
            },
        );
        let err = cluster.execute(&grant).await.unwrap_err();
        assert_eq!(err.code(), Some("42704"));
    }

    #[tokio::test]
    async fn test_acl_read_of_unknown_database() {
        let cluster = FakeCluster::new("fake:5432");
        let err = cluster.fetch_database_acl("gone").await.unwrap_err();
        assert!(matches!(err, DataError::DatabaseNotFound(ref name) if name == "gone"));
    }
}
