//! SQL text for plan statements
//!
//! Identifiers go through `pg_escape::quote_identifier`, literals through
//! `pg_escape::quote_literal`. Statements are rendered without the trailing
//! semicolon; `render` adds it when writing files.

use pg_escape::{quote_identifier, quote_literal};

use crate::core::constants::{
    CREATE_DATABASE_TEMPLATE, PUBLIC_GRANTEE, REDACTED, SYSTEM_DATABASES,
};
use crate::domain::manifest::Role;
use crate::domain::privilege::PrivilegeSet;

/// Dollar-quote tag for role creation blocks
const DO_TAG: &str = "$pgcatalog$";

/// `PUBLIC` for the pseudo-role, a quoted identifier otherwise
pub fn grantee(name: &str) -> String {
    if name == PUBLIC_GRANTEE {
        "PUBLIC".to_string()
    } else {
        quote_identifier(name).to_string()
    }
}

fn flag(enabled: bool, keyword: &str) -> String {
    if enabled {
        keyword.to_string()
    } else {
        format!("NO{}", keyword)
    }
}

/// Attribute clause of `CREATE ROLE`, every attribute spelled out
pub fn role_options(role: &Role, redact: bool) -> String {
    let mut options = vec![
        flag(role.can_login, "LOGIN"),
        flag(role.superuser, "SUPERUSER"),
        flag(role.inherit, "INHERIT"),
        flag(role.create_role, "CREATEROLE"),
        flag(role.create_db, "CREATEDB"),
        flag(role.replication, "REPLICATION"),
    ];
    if role.connection_limit != -1 {
        options.push(format!("CONNECTION LIMIT {}", role.connection_limit));
    }
    if let Some(hash) = &role.password_hash {
        if redact {
            options.push(format!("PASSWORD '{}'", REDACTED));
        } else {
            options.push(format!("PASSWORD {}", quote_literal(hash)));
        }
    }
    if let Some(valid_until) = role.valid_until {
        options.push(format!(
            "VALID UNTIL {}",
            quote_literal(&valid_until.to_rfc3339())
        ));
    }
    options.join(" ")
}

/// Conditional role creation as a `DO` block
pub fn create_role(role: &Role, redact: bool) -> String {
    format!(
        "DO {tag}\nBEGIN\n    IF NOT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = {name_lit}) THEN\n        CREATE ROLE {name} WITH {options};\n    END IF;\nEND\n{tag}",
        tag = DO_TAG,
        name_lit = quote_literal(&role.name),
        name = quote_identifier(&role.name),
        options = role_options(role, redact),
    )
}

pub struct CreateDatabaseSql<'a> {
    pub name: &'a str,
    pub owner: &'a str,
    pub encoding: &'a str,
    pub collate: &'a str,
    pub ctype: &'a str,
    pub connection_limit: i32,
    pub is_template: bool,
}

pub fn create_database(db: &CreateDatabaseSql<'_>) -> String {
    let mut sql = format!(
        "CREATE DATABASE {} WITH OWNER = {} TEMPLATE = {} ENCODING = {} LC_COLLATE = {} LC_CTYPE = {}",
        quote_identifier(db.name),
        quote_identifier(db.owner),
        CREATE_DATABASE_TEMPLATE,
        quote_literal(db.encoding),
        quote_literal(db.collate),
        quote_literal(db.ctype),
    );
    if db.connection_limit != -1 {
        sql.push_str(&format!(" CONNECTION LIMIT = {}", db.connection_limit));
    }
    if db.is_template {
        sql.push_str(" IS_TEMPLATE = true");
    }
    sql
}

pub fn alter_owner(database: &str, owner: &str) -> String {
    format!(
        "ALTER DATABASE {} OWNER TO {}",
        quote_identifier(database),
        quote_identifier(owner)
    )
}

pub fn grant(database: &str, to: &str, privileges: &PrivilegeSet, grantable: bool) -> String {
    let mut sql = format!(
        "GRANT {} ON DATABASE {} TO {}",
        privileges.to_sql_list(),
        quote_identifier(database),
        grantee(to)
    );
    if grantable {
        sql.push_str(" WITH GRANT OPTION");
    }
    sql
}

pub fn revoke(database: &str, from: &str, privileges: &PrivilegeSet) -> String {
    format!(
        "REVOKE {} ON DATABASE {} FROM {}",
        privileges.to_sql_list(),
        quote_identifier(database),
        grantee(from)
    )
}

fn system_database_list() -> String {
    SYSTEM_DATABASES
        .iter()
        .map(|name| quote_literal(name).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn role_count() -> String {
    "SELECT count(*) AS role_count FROM pg_catalog.pg_roles WHERE rolname !~ '^pg_'".to_string()
}

pub fn user_database_count() -> String {
    format!(
        "SELECT count(*) AS user_database_count FROM pg_catalog.pg_database WHERE datallowconn AND datname NOT IN ({})",
        system_database_list()
    )
}

pub fn grant_pair_count() -> String {
    format!(
        "SELECT count(*) AS grant_pair_count FROM (SELECT DISTINCT d.datname, a.grantee FROM pg_catalog.pg_database d, aclexplode(d.datacl) a WHERE d.datname NOT IN ({})) AS pairs",
        system_database_list()
    )
}
