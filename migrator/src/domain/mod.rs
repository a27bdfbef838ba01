//! Migration pipeline
//!
//! - `acl` - `aclitem` codec for database-scope privileges
//! - `extract` - catalog snapshot into a manifest
//! - `plan` - manifest into ordered, idempotent statements
//! - `apply` - statement execution with classification and reporting
//! - `validate` - effective-privilege equivalence between two clusters

pub mod acl;
pub mod apply;
pub mod extract;
pub mod manifest;
pub mod plan;
pub mod privilege;
pub mod validate;

#[cfg(test)]
pub mod testing;

pub use apply::{ApplyMode, ApplyOptions, ApplyReport, ErrorPolicy};
pub use extract::ExtractOptions;
pub use manifest::Manifest;
pub use plan::{Plan, PlanOptions};
pub use validate::EquivalenceReport;
