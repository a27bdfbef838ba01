//! Extractor: catalog snapshot to manifest
//!
//! Role and database reads are all-or-nothing. Per-database ACL reads are
//! retried once; a database whose ACL still cannot be read keeps an empty grant
//! list and an `extractionErrors` entry.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;

use crate::core::config::ProtectionConfig;
use crate::core::constants::{
    APP_VERSION, GRANT_QUERY_ATTEMPTS, GRANT_QUERY_RETRY_DELAY_MS, PUBLIC_GRANTEE,
    RESERVED_ROLE_PREFIX,
};
use crate::data::error::DataError;
use crate::data::traits::CatalogSource;
use crate::data::types::{DatabaseRow, RoleRow};
use crate::domain::acl::{GranteePrivileges, decode_acl};
use crate::domain::manifest::{
    Database, ExtractionInfo, GrantEntry, Manifest, ManifestSummary, Role,
};
use crate::domain::privilege::PrivilegeSet;
use crate::utils::retry::retry_with_backoff;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub protection: ProtectionConfig,
    pub retry_delay_ms: u64,
}

impl ExtractOptions {
    pub fn new(protection: ProtectionConfig) -> Self {
        Self {
            protection,
            retry_delay_ms: GRANT_QUERY_RETRY_DELAY_MS,
        }
    }
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Self {
            name: row.name,
            can_login: row.can_login,
            superuser: row.superuser,
            inherit: row.inherit,
            create_role: row.create_role,
            create_db: row.create_db,
            replication: row.replication,
            connection_limit: row.connection_limit,
            password_hash: row.password_hash,
            valid_until: row.valid_until,
        }
    }
}

impl From<DatabaseRow> for Database {
    fn from(row: DatabaseRow) -> Self {
        Self {
            is_system: Database::is_system_name(&row.name),
            name: row.name,
            owner: row.owner,
            encoding: row.encoding,
            collate: row.collate,
            ctype: row.ctype,
            connection_limit: row.connection_limit,
            is_template: row.is_template,
            size_mb: (row.size_bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0,
        }
    }
}

/// Grants of one database split by whether the grantee is migrated
#[derive(Debug, Default, PartialEq)]
struct DatabaseGrants {
    resolved: Vec<GrantEntry>,
    unresolved: Vec<GrantEntry>,
}

/// Apply the owner-materialization rule and split entries by grantee
fn database_grants(
    datacl: Option<&[String]>,
    owner: &str,
    migrated_roles: &BTreeSet<&str>,
) -> DatabaseGrants {
    let decoded = decode_acl(datacl, owner);
    let mut held = decoded.by_grantee();

    // The owner's rights are implicit when datacl does not mention it
    held.entry(owner.to_string())
        .or_insert_with(|| GranteePrivileges {
            privileges: PrivilegeSet::all(),
            grant_options: PrivilegeSet::empty(),
        });

    let mut grants = DatabaseGrants::default();
    for (grantee, privileges) in &held {
        let entries = GrantEntry::from_privileges(grantee, privileges);
        if grantee == PUBLIC_GRANTEE || migrated_roles.contains(grantee.as_str()) {
            grants.resolved.extend(entries);
        } else {
            grants.unresolved.extend(entries);
        }
    }
    grants
}

/// Read the catalogs of `source` into a manifest
pub async fn extract<S>(source: &S, options: &ExtractOptions) -> Result<Manifest, DataError>
where
    S: CatalogSource + ?Sized,
{
    let server = source.server_label();
    tracing::info!(server = %server, "Extracting catalog");

    let mut roles: Vec<Role> = source
        .fetch_roles()
        .await?
        .into_iter()
        .filter(|row| {
            if row.name.starts_with(RESERVED_ROLE_PREFIX) {
                return false;
            }
            if options.protection.is_protected_user(&row.name) {
                tracing::debug!(role = %row.name, "Skipping protected role");
                return false;
            }
            true
        })
        .map(Role::from)
        .collect();
    roles.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    let mut databases: Vec<Database> = source
        .fetch_databases()
        .await?
        .into_iter()
        .filter(|row| {
            if options.protection.is_protected_database(&row.name) {
                tracing::debug!(database = %row.name, "Skipping protected database");
                return false;
            }
            true
        })
        .map(Database::from)
        .collect();
    databases.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    let migrated_roles: BTreeSet<&str> = roles.iter().map(|r| r.name.as_str()).collect();
    let mut grants_by_database = BTreeMap::new();
    let mut unresolved_grants = BTreeMap::new();
    let mut extraction_errors = BTreeMap::new();

    for db in databases.iter().filter(|d| !d.is_system) {
        let name = db.name.as_str();
        let result = retry_with_backoff(
            GRANT_QUERY_ATTEMPTS,
            options.retry_delay_ms,
            |_: &DataError| true,
            move || source.fetch_database_acl(name),
        )
        .await;

        match result {
            Ok(acl) => {
                let grants = database_grants(acl.datacl.as_deref(), &acl.owner, &migrated_roles);
                if !grants.unresolved.is_empty() {
                    tracing::debug!(
                        database = %name,
                        count = grants.unresolved.len(),
                        "Grants to roles that are not migrated"
                    );
                    unresolved_grants.insert(db.name.clone(), grants.unresolved);
                }
                grants_by_database.insert(db.name.clone(), grants.resolved);
            }
            Err((e, attempts)) => {
                tracing::warn!(
                    database = %name,
                    attempts,
                    transient = e.is_transient(),
                    error = %e,
                    "Failed to read database grants; recording as unknown"
                );
                extraction_errors.insert(db.name.clone(), e.to_string());
                grants_by_database.insert(db.name.clone(), Vec::new());
            }
        }
    }

    let mut manifest = Manifest {
        extraction_info: ExtractionInfo {
            source_server: server,
            extracted_at: Utc::now(),
            extractor_version: APP_VERSION.to_string(),
        },
        roles,
        databases,
        grants_by_database,
        unresolved_grants,
        extraction_errors,
        summary: ManifestSummary::default(),
    };
    manifest.summary = manifest.compute_summary();

    for violation in manifest.invariant_violations() {
        tracing::warn!(violation = %violation, "Manifest invariant violated");
    }

    tracing::info!(
        roles = manifest.summary.total_roles,
        databases = manifest.summary.user_databases,
        grants = manifest.summary.total_grants,
        errors = manifest.extraction_errors.len(),
        "Extraction complete"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::privilege::Privilege;
    use crate::domain::testing::FakeCluster;

    fn options() -> ExtractOptions {
        ExtractOptions {
            protection: ProtectionConfig::default(),
            retry_delay_ms: 1,
        }
    }

    fn migrated<'a>(names: &[&'a str]) -> BTreeSet<&'a str> {
        names.iter().copied().collect()
    }

    #[test]
    fn test_null_acl_materializes_owner_and_public() {
        let grants = database_grants(None, "app_user", &migrated(&["app_user"]));
        assert_eq!(grants.resolved.len(), 2);
        assert_eq!(grants.resolved[0].grantee, "app_user");
        assert!(grants.resolved[0].privileges.is_all());
        assert_eq!(grants.resolved[1].grantee, "public");
        assert_eq!(grants.resolved[1].privileges, PrivilegeSet::public_default());
        assert!(grants.unresolved.is_empty());
    }

    #[test]
    fn test_owner_added_when_missing_from_acl() {
        let acl = vec!["=Tc/owner".to_string(), "reader=c/owner".to_string()];
        let grants = database_grants(Some(&acl), "owner", &migrated(&["owner", "reader"]));
        let grantees: Vec<&str> = grants.resolved.iter().map(|g| g.grantee.as_str()).collect();
        assert_eq!(grantees, vec!["owner", "public", "reader"]);
        assert!(grants.resolved[0].privileges.is_all());
    }

    #[test]
    fn test_owner_entry_kept_when_present() {
        let acl = vec!["owner=c/owner".to_string()];
        let grants = database_grants(Some(&acl), "owner", &migrated(&["owner"]));
        assert_eq!(
            grants.resolved[0].privileges,
            PrivilegeSet::from_iter([Privilege::Connect])
        );
    }

    #[test]
    fn test_public_only_acl() {
        let acl = vec!["=Tc/postgres".to_string()];
        let grants = database_grants(Some(&acl), "postgres", &migrated(&[]));
        assert_eq!(grants.resolved.len(), 1);
        assert!(grants.resolved[0].is_public());
        assert_eq!(grants.resolved[0].privileges.to_sql_list(), "CONNECT, TEMPORARY");
        // postgres is not migrated; its implicit entry is unresolved
        assert_eq!(grants.unresolved.len(), 1);
        assert_eq!(grants.unresolved[0].grantee, "postgres");
    }

    #[test]
    fn test_grants_to_unmigrated_roles_are_unresolved() {
        let acl = vec!["botpress_user=c/owner".to_string()];
        let grants = database_grants(Some(&acl), "owner", &migrated(&["owner"]));
        assert_eq!(grants.unresolved.len(), 1);
        assert_eq!(grants.unresolved[0].grantee, "botpress_user");
    }

    #[tokio::test]
    async fn test_extract_filters_and_sorts() {
        let cluster = FakeCluster::new("src:5432");
        cluster.add_role(Role::login("zeta"));
        cluster.add_role(Role::login("Alpha"));
        cluster.add_role(Role::login("pg_monitor_custom"));
        cluster.add_role(Role::login("rdsadmin"));
        cluster.add_database("b_db", "zeta", None);
        cluster.add_database("a_db", "Alpha", Some(vec!["=Tc/Alpha".into()]));
        cluster.add_database("rdsadmin", "rdsadmin", None);

        let manifest = extract(&cluster, &options()).await.unwrap();
        let roles: Vec<&str> = manifest.roles.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(roles, vec!["Alpha", "zeta"]);
        let databases: Vec<&str> = manifest.databases.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(databases, vec!["a_db", "b_db", "postgres", "template1"]);
        assert!(manifest.invariant_violations().is_empty());
        assert_eq!(manifest.summary.user_databases, 2);
        assert_eq!(manifest.summary.total_databases, 4);
        assert!(!manifest.grants_by_database.contains_key("postgres"));
    }

    #[tokio::test]
    async fn test_extract_retries_acl_query_once() {
        let cluster = FakeCluster::new("src:5432");
        cluster.add_role(Role::login("app_user"));
        cluster.add_database("app_db", "app_user", None);
        cluster.fail_acl_reads("app_db", 1);

        let manifest = extract(&cluster, &options()).await.unwrap();
        assert!(manifest.extraction_errors.is_empty());
        assert_eq!(manifest.grants_for("app_db").len(), 2);
    }

    #[tokio::test]
    async fn test_extract_records_error_after_second_failure() {
        let cluster = FakeCluster::new("src:5432");
        cluster.add_role(Role::login("app_user"));
        cluster.add_database("app_db", "app_user", None);
        cluster.fail_acl_reads("app_db", 2);

        let manifest = extract(&cluster, &options()).await.unwrap();
        assert!(manifest.extraction_errors.contains_key("app_db"));
        assert!(manifest.grants_for("app_db").is_empty());
        assert!(manifest.grants_by_database.contains_key("app_db"));
    }

    #[tokio::test]
    async fn test_extract_aborts_when_roles_fail() {
        let cluster = FakeCluster::new("src:5432");
        cluster.fail_role_reads();
        assert!(extract(&cluster, &options()).await.is_err());
    }

    #[tokio::test]
    async fn test_manifest_invariants_hold() {
        let cluster = FakeCluster::new("src:5432");
        cluster.add_role(Role::login("owner"));
        cluster.add_role(Role::login("reader"));
        cluster.add_database(
            "app_db",
            "owner",
            Some(vec![
                "=c/owner".into(),
                "reader=cT/owner".into(),
                "ghost=C/owner".into(),
                "broken".into(),
            ]),
        );

        let manifest = extract(&cluster, &options()).await.unwrap();
        for entries in manifest.grants_by_database.values() {
            for entry in entries {
                assert!(entry.is_public() || manifest.role(&entry.grantee).is_some());
            }
        }
        assert_eq!(manifest.unresolved_for("app_db")[0].grantee, "ghost");
    }

    #[test]
    fn test_size_in_megabytes() {
        let db = Database::from(DatabaseRow {
            name: "app_db".into(),
            owner: "app".into(),
            encoding: "UTF8".into(),
            collate: "C".into(),
            ctype: "C".into(),
            connection_limit: -1,
            is_template: false,
            size_bytes: 8_912_896,
        });
        assert_eq!(db.size_mb, 8.5);
        assert!(!db.is_system);
    }
}
