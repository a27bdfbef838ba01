//! Catalog rows shared by the PostgreSQL reader and the test doubles

use chrono::{DateTime, Utc};

/// A row of `pg_authid` (or `pg_roles` when `pg_authid` is not readable)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRow {
    pub name: String,
    pub can_login: bool,
    pub superuser: bool,
    pub inherit: bool,
    pub create_role: bool,
    pub create_db: bool,
    pub replication: bool,
    pub connection_limit: i32,
    pub password_hash: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// A connectable row of `pg_database`
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseRow {
    pub name: String,
    pub owner: String,
    pub encoding: String,
    pub collate: String,
    pub ctype: String,
    pub connection_limit: i32,
    pub is_template: bool,
    pub size_bytes: i64,
}

/// Ownership and raw ACL of one database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseAclRow {
    pub owner: String,
    /// `datacl::text[]`; `None` when the column is NULL
    pub datacl: Option<Vec<String>>,
}
