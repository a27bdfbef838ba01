//! Validator: privilege equivalence between two clusters
//!
//! Both sides are re-extracted and compared per database on *effective*
//! privileges (explicit entries, PUBLIC inheritance, superuser bypass) rather
//! than on `datacl` text.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::config::ProtectionConfig;
use crate::core::constants::{DEFAULT_BOOTSTRAP_OWNER, PUBLIC_GRANTEE, RESERVED_ROLE_PREFIX};
use crate::data::error::DataError;
use crate::data::traits::CatalogSource;
use crate::domain::extract::{ExtractOptions, extract};
use crate::domain::manifest::{Database, Manifest};
use crate::domain::privilege::PrivilegeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    ExactOwner,
    /// Destination kept the bootstrap owner; the source owner holds ALL explicitly
    OwnerConsolidation,
    OwnerMismatch,
    MissingDatabase,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Conformance {
    Conforming,
    Divergent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeltaKind {
    /// Explicit on the source only
    MissingGrantee,
    /// Explicit on the destination only
    ExtraGrantee,
    /// Explicit on both, effective sets differ
    PrivilegeDelta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub kind: DeltaKind,
    pub grantee: String,
    pub source_privileges: PrivilegeSet,
    pub destination_privileges: PrivilegeSet,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEquivalence {
    pub database: String,
    pub strategy: Strategy,
    pub conformance: Conformance,
    pub source_owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_owner: Option<String>,
    pub deltas: Vec<Delta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EquivalenceSummary {
    pub total: usize,
    pub conforming: usize,
    pub divergent: usize,
    pub unknown: usize,
    pub conformity_rate: f64,
}

impl EquivalenceSummary {
    fn from_records(records: &[DatabaseEquivalence]) -> Self {
        let count = |c: Conformance| records.iter().filter(|r| r.conformance == c).count();
        let total = records.len();
        let conforming = count(Conformance::Conforming);
        Self {
            total,
            conforming,
            divergent: count(Conformance::Divergent),
            unknown: count(Conformance::Unknown),
            conformity_rate: if total == 0 {
                1.0
            } else {
                conforming as f64 / total as f64
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EquivalenceReport {
    pub source_server: String,
    pub destination_server: String,
    pub generated_at: DateTime<Utc>,
    pub databases: Vec<DatabaseEquivalence>,
    /// Present on the destination only; not counted in the summary
    pub extra_databases: Vec<String>,
    pub summary: EquivalenceSummary,
}

impl EquivalenceReport {
    pub fn is_conforming(&self) -> bool {
        self.summary.divergent == 0 && self.summary.unknown == 0
    }
}

/// One side of the comparison for a single database
struct Side<'a> {
    manifest: &'a Manifest,
    explicit: BTreeMap<&'a str, PrivilegeSet>,
}

impl<'a> Side<'a> {
    fn new(manifest: &'a Manifest, database: &str) -> Self {
        Self {
            manifest,
            explicit: manifest.explicit_privileges(database),
        }
    }

    fn is_explicit(&self, grantee: &str) -> bool {
        self.explicit.contains_key(grantee)
    }

    fn effective(&self, grantee: &str) -> PrivilegeSet {
        let own = self.explicit.get(grantee).cloned().unwrap_or_default();
        if grantee == PUBLIC_GRANTEE {
            return own;
        }
        let Some(role) = self.manifest.role(grantee) else {
            return PrivilegeSet::empty();
        };
        if role.superuser {
            return PrivilegeSet::all();
        }
        match self.explicit.get(PUBLIC_GRANTEE) {
            Some(public) => own.union(public),
            None => own,
        }
    }
}

fn compared_grantees<'a>(
    source: &Side<'a>,
    dest: &Side<'a>,
    protection: &ProtectionConfig,
) -> BTreeSet<&'a str> {
    source
        .explicit
        .keys()
        .chain(dest.explicit.keys())
        .copied()
        .chain([PUBLIC_GRANTEE])
        .filter(|g| !protection.is_protected_user(g) && !g.starts_with(RESERVED_ROLE_PREFIX))
        .collect()
}

fn deltas(source: &Side<'_>, dest: &Side<'_>, protection: &ProtectionConfig) -> Vec<Delta> {
    compared_grantees(source, dest, protection)
        .into_iter()
        .filter_map(|grantee| {
            let source_privileges = source.effective(grantee);
            let destination_privileges = dest.effective(grantee);
            if source_privileges == destination_privileges {
                return None;
            }
            let kind = match (source.is_explicit(grantee), dest.is_explicit(grantee)) {
                (true, false) => DeltaKind::MissingGrantee,
                (false, true) => DeltaKind::ExtraGrantee,
                _ => DeltaKind::PrivilegeDelta,
            };
            Some(Delta {
                kind,
                grantee: grantee.to_string(),
                source_privileges,
                destination_privileges,
            })
        })
        .collect()
}

fn compare_database(
    db: &Database,
    source: &Manifest,
    dest: &Manifest,
    protection: &ProtectionConfig,
) -> DatabaseEquivalence {
    let mut record = DatabaseEquivalence {
        database: db.name.clone(),
        strategy: Strategy::Unknown,
        conformance: Conformance::Unknown,
        source_owner: db.owner.clone(),
        destination_owner: None,
        deltas: Vec::new(),
        error: None,
    };

    let Some(dest_db) = dest.database(&db.name) else {
        record.strategy = Strategy::MissingDatabase;
        record.conformance = Conformance::Divergent;
        return record;
    };
    record.destination_owner = Some(dest_db.owner.clone());

    let error = source
        .extraction_errors
        .get(&db.name)
        .or_else(|| dest.extraction_errors.get(&db.name));
    if let Some(error) = error {
        record.error = Some(error.clone());
        return record;
    }

    let source_side = Side::new(source, &db.name);
    let dest_side = Side::new(dest, &db.name);
    record.deltas = deltas(&source_side, &dest_side, protection);

    record.strategy = if dest_db.owner == db.owner {
        Strategy::ExactOwner
    } else if dest_db.owner == DEFAULT_BOOTSTRAP_OWNER
        && dest_side
            .explicit
            .get(db.owner.as_str())
            .is_some_and(PrivilegeSet::is_all)
    {
        Strategy::OwnerConsolidation
    } else {
        Strategy::OwnerMismatch
    };

    record.conformance = match record.strategy {
        Strategy::OwnerMismatch => Conformance::Divergent,
        _ if record.deltas.is_empty() => Conformance::Conforming,
        _ => Conformance::Divergent,
    };
    record
}

/// Compare two manifests database by database
pub fn compare(source: &Manifest, dest: &Manifest, protection: &ProtectionConfig) -> EquivalenceReport {
    let databases: Vec<DatabaseEquivalence> = source
        .user_databases()
        .map(|db| compare_database(db, source, dest, protection))
        .collect();

    let extra_databases = dest
        .user_databases()
        .filter(|db| source.database(&db.name).is_none())
        .map(|db| db.name.clone())
        .collect();

    for record in databases.iter().filter(|r| r.conformance != Conformance::Conforming) {
        tracing::warn!(
            database = %record.database,
            strategy = ?record.strategy,
            conformance = ?record.conformance,
            deltas = record.deltas.len(),
            "Database is not equivalent"
        );
    }

    EquivalenceReport {
        source_server: source.extraction_info.source_server.clone(),
        destination_server: dest.extraction_info.source_server.clone(),
        generated_at: Utc::now(),
        summary: EquivalenceSummary::from_records(&databases),
        databases,
        extra_databases,
    }
}

/// Re-extract both clusters and compare them
pub async fn validate<S, D>(
    source: &S,
    dest: &D,
    options: &ExtractOptions,
) -> Result<EquivalenceReport, DataError>
where
    S: CatalogSource + ?Sized,
    D: CatalogSource + ?Sized,
{
    let source_manifest = extract(source, options).await?;
    let dest_manifest = extract(dest, options).await?;
    let report = compare(&source_manifest, &dest_manifest, &options.protection);

    tracing::info!(
        total = report.summary.total,
        conforming = report.summary.conforming,
        divergent = report.summary.divergent,
        unknown = report.summary.unknown,
        "Validation finished"
    );
    Ok(report)
}
