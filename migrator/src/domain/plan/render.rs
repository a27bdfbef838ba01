//! Plan files (`01_roles.sql` .. `04_validate.sql`)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::core::constants::{
    APP_NAME_LOWER, APP_VERSION, PLAN_FILE_DATABASES, PLAN_FILE_GRANTS, PLAN_FILE_ROLES,
    PLAN_FILE_VALIDATE,
};
use crate::domain::manifest::Manifest;

use super::{Plan, Statement, VerificationQuery};

/// Provenance written at the top of every plan file
#[derive(Debug, Clone)]
pub struct PlanHeader {
    pub source_server: String,
    pub extracted_at: DateTime<Utc>,
}

impl PlanHeader {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            source_server: manifest.extraction_info.source_server.clone(),
            extracted_at: manifest.extraction_info.extracted_at,
        }
    }

    fn comment(&self, title: &str, count: usize) -> String {
        format!(
            "-- {} {}: {}\n-- Source server: {}\n-- Extracted at: {}\n-- Statements: {}\n",
            APP_NAME_LOWER,
            APP_VERSION,
            title,
            self.source_server,
            self.extracted_at.to_rfc3339(),
            count
        )
    }
}

fn render_statements(header: &PlanHeader, title: &str, statements: &[Statement]) -> String {
    let mut out = header.comment(title, statements.len());
    for statement in statements {
        out.push('\n');
        out.push_str(&statement.sql);
        out.push_str(";\n");
    }
    out
}

fn render_validation(header: &PlanHeader, queries: &[VerificationQuery]) -> String {
    let mut out = header.comment("verification queries (read-only)", queries.len());
    for query in queries {
        out.push_str(&format!("\n-- {}\n{};\n", query.kind.as_str(), query.sql));
    }
    out
}

/// Render the four plan files as `(file name, contents)`
pub fn render_plan(plan: &Plan, header: &PlanHeader) -> Vec<(&'static str, String)> {
    vec![
        (
            PLAN_FILE_ROLES,
            render_statements(header, "roles", &plan.roles),
        ),
        (
            PLAN_FILE_DATABASES,
            render_statements(header, "databases", &plan.databases),
        ),
        (
            PLAN_FILE_GRANTS,
            render_statements(header, "grants", &plan.grants),
        ),
        (PLAN_FILE_VALIDATE, render_validation(header, &plan.validation)),
    ]
}

/// Role statements whose rendered SQL carries a password hash
fn credential_statements(plan: &Plan) -> usize {
    plan.roles.iter().filter(|s| s.action.has_secret()).count()
}

/// Write the plan files into `dir`, creating it if needed
pub fn write_plan(plan: &Plan, dir: &Path, header: &PlanHeader) -> anyhow::Result<Vec<PathBuf>> {
    let credentials = credential_statements(plan);
    if credentials > 0 {
        tracing::warn!(
            dir = %dir.display(),
            roles = credentials,
            "Plan files contain password hashes; restrict access to them"
        );
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create plan directory {}", dir.display()))?;

    let mut written = Vec::new();
    for (name, contents) in render_plan(plan, header) {
        let path = dir.join(name);
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Wrote plan file");
        written.push(path);
    }
    Ok(written)
}
