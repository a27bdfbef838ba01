// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths, identifiers and log filters)
pub const APP_NAME_LOWER: &str = "pgcatalog";

/// Version recorded in manifests and SQL file headers
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "PGCATALOG_LOG";

/// Environment variable for log output format (text or json)
pub const ENV_LOG_FORMAT: &str = "PGCATALOG_LOG_FORMAT";

/// Environment variable for the source connection config path
pub const ENV_SOURCE_CONFIG: &str = "PGCATALOG_SOURCE_CONFIG";

/// Environment variable for the destination connection config path
pub const ENV_DEST_CONFIG: &str = "PGCATALOG_DEST_CONFIG";

/// Password fallback for the source connection
pub const ENV_SOURCE_PASSWORD: &str = "PGCATALOG_SOURCE_PASSWORD";

/// Password fallback for the destination connection
pub const ENV_DEST_PASSWORD: &str = "PGCATALOG_DEST_PASSWORD";

// =============================================================================
// Connection Defaults
// =============================================================================

/// Default PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

/// Default maintenance database to connect to
pub const DEFAULT_MAINTENANCE_DATABASE: &str = "postgres";

/// Default SSL mode
pub const DEFAULT_SSL_MODE: &str = "prefer";

/// Default per-statement timeout
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Application name reported to the server (pg_stat_activity)
pub const DEFAULT_APPLICATION_NAME: &str = "pgcatalog";

// =============================================================================
// Catalog
// =============================================================================

/// Databases that exist on every cluster and are never migrated
pub const SYSTEM_DATABASES: [&str; 3] = ["postgres", "template0", "template1"];

/// Reserved role-name prefix
pub const RESERVED_ROLE_PREFIX: &str = "pg_";

/// Grantee name used for PUBLIC in manifests
pub const PUBLIC_GRANTEE: &str = "public";

/// Administrative role databases are created with before owner reassignment
pub const DEFAULT_BOOTSTRAP_OWNER: &str = "postgres";

/// Template every database is created from
pub const CREATE_DATABASE_TEMPLATE: &str = "template0";

/// Roles excluded from migration unless the config says otherwise
pub const DEFAULT_PROTECTED_USERS: [&str; 7] = [
    "postgres",
    "rdsadmin",
    "rds_superuser",
    "azure_superuser",
    "azure_pg_admin",
    "cloudsqladmin",
    "cloudsqlsuperuser",
];

/// Databases excluded from migration unless the config says otherwise
pub const DEFAULT_PROTECTED_DATABASES: [&str; 4] =
    ["rdsadmin", "azure_maintenance", "azure_sys", "cloudsqladmin"];

// =============================================================================
// Extraction
// =============================================================================

/// Attempts for a per-database grant query (first try plus one retry)
pub const GRANT_QUERY_ATTEMPTS: u32 = 2;

/// Base backoff delay between grant query attempts
pub const GRANT_QUERY_RETRY_DELAY_MS: u64 = 250;

// =============================================================================
// Output Files
// =============================================================================

/// Default manifest output path
pub const DEFAULT_MANIFEST_FILE: &str = "manifest.json";

/// Default plan output directory
pub const DEFAULT_PLAN_DIR: &str = "plan";

pub const PLAN_FILE_ROLES: &str = "01_roles.sql";
pub const PLAN_FILE_DATABASES: &str = "02_databases.sql";
pub const PLAN_FILE_GRANTS: &str = "03_grants.sql";
pub const PLAN_FILE_VALIDATE: &str = "04_validate.sql";

/// File names used by `migrate --out-dir`
pub const APPLY_REPORT_FILE: &str = "apply-report.json";
pub const VALIDATION_REPORT_FILE: &str = "validation-report.json";

/// Placeholder written instead of password hashes in logs and reports
pub const REDACTED: &str = "<redacted>";
