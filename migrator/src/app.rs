//! Core application

use std::future::Future;
use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::cli::{self, ApplyArgs, CliConfig, Commands, LogFormat};
use crate::core::config::{ConfigError, ConnectionConfig, ConnectionSide};
use crate::core::constants::{
    APPLY_REPORT_FILE, DEFAULT_MANIFEST_FILE, ENV_LOG, VALIDATION_REPORT_FILE,
};
use crate::core::exit::ExitStatus;
use crate::core::shutdown::ShutdownService;
use crate::data::postgres::{self, PgCatalog, PgTarget};
use crate::domain::apply::{self, ApplyMode, ApplyOptions, ApplyReport, ErrorPolicy};
use crate::domain::extract::{self, ExtractOptions};
use crate::domain::manifest::Manifest;
use crate::domain::plan::render::{PlanHeader, write_plan};
use crate::domain::plan::{self, Plan, PlanOptions};
use crate::domain::validate::{self, EquivalenceReport};
use crate::utils::json;

/// Apply and validation reports of a `migrate` run, printed together
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MigrationReport<'a> {
    apply: &'a ApplyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation: Option<&'a EquivalenceReport>,
}

pub struct CoreApp {
    pub shutdown: ShutdownService,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<ExitStatus> {
        dotenvy::dotenv().ok();
        let (cli_config, command) = cli::parse();
        Self::init_logging(&cli_config);

        tracing::debug!("Application starting");
        tracing::trace!(command = ?command, "Parsed command");

        let app = Self {
            shutdown: ShutdownService::new(),
        };
        app.shutdown.install_signal_handlers();

        match command {
            Commands::Extract { source, out } => app.extract(&source, &out).await,
            Commands::Generate {
                input,
                out,
                no_strict,
            } => Self::generate(&input, &out, no_strict),
            Commands::Apply {
                dest,
                input,
                apply,
                interactive,
                report,
            } => {
                app.apply(&dest, &input, &apply, interactive, report.as_deref())
                    .await
            }
            Commands::Validate {
                source,
                dest,
                report,
            } => app.validate(&source, &dest, report.as_deref()).await,
            Commands::Migrate {
                source,
                dest,
                apply,
                out_dir,
            } => app.migrate(&source, &dest, &apply, out_dir.as_deref()).await,
        }
    }

    fn init_logging(cli: &CliConfig) {
        let crate_name = env!("CARGO_CRATE_NAME");
        let filter = match cli.verbose {
            0 => std::env::var(ENV_LOG)
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| format!("info,{}=info", crate_name)),
            1 => format!("info,{}=debug", crate_name),
            _ => format!("info,{}=trace,sqlx=trace", crate_name),
        };

        // stdout carries reports; logs go to stderr
        let builder = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_env_filter(filter);

        match cli.log_format {
            LogFormat::Text => builder
                .with_ansi(std::io::stderr().is_terminal())
                .compact()
                .init(),
            LogFormat::Json => builder.json().init(),
        }
    }

    fn load_config(path: &Path, side: ConnectionSide) -> Result<ConnectionConfig> {
        ConnectionConfig::load(path, side)
            .with_context(|| format!("Failed to load {} config {}", side, path.display()))
    }

    async fn open_catalog(config: &ConnectionConfig) -> Result<PgCatalog> {
        let conn = postgres::connect(config).await?;
        tracing::info!(side = %config.side, server = %config.server_label(), "Connected");
        Ok(PgCatalog::new(
            conn,
            config.server_label(),
            config.statement_timeout_secs,
        ))
    }

    /// Load a manifest and refuse one that breaks grant invariants
    fn load_manifest(path: &Path) -> Result<Manifest> {
        let manifest = Manifest::load(path)?;
        let violations = manifest.invariant_violations();
        for violation in &violations {
            tracing::warn!(violation = %violation, "Manifest invariant violated");
        }
        if violations.iter().any(|v| v.is_fatal()) {
            return Err(ConfigError::Invalid(format!(
                "Manifest {} is inconsistent ({} invariant violations)",
                path.display(),
                violations.len()
            ))
            .into());
        }
        Ok(manifest)
    }

    /// Await `fut` unless cancellation is requested first
    async fn until_cancelled<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => None,
            value = fut => Some(value),
        }
    }

    fn emit_report<T: Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => {
                json::write_json(path, value)?;
                tracing::info!(path = %path.display(), "Report written");
            }
            None => print!("{}", json::to_pretty_string(value)?),
        }
        Ok(())
    }

    fn apply_options(config: &ConnectionConfig, args: &ApplyArgs) -> ApplyOptions {
        ApplyOptions {
            mode: if args.dry_run {
                ApplyMode::DryRun
            } else {
                ApplyMode::Execute
            },
            policy: if args.stop_on_error {
                ErrorPolicy::StopOnFirstError
            } else {
                ErrorPolicy::ContinueOnError
            },
            statement_timeout: Duration::from_secs(config.statement_timeout_secs),
        }
    }

    fn apply_status(report: &ApplyReport) -> ExitStatus {
        if report.cancelled {
            ExitStatus::Cancelled
        } else if report.has_errors() {
            ExitStatus::Failure
        } else {
            ExitStatus::Success
        }
    }

    fn validation_status(report: &EquivalenceReport) -> ExitStatus {
        if report.is_conforming() {
            ExitStatus::Success
        } else {
            ExitStatus::Failure
        }
    }

    /// Print the plan summary and ask for confirmation
    fn confirm(plan: &Plan, server: &str) -> Result<bool> {
        eprintln!("About to apply to {}:", server);
        eprintln!("  {} role statements", plan.roles.len());
        eprintln!("  {} database statements", plan.databases.len());
        eprintln!("  {} grant statements", plan.grants.len());
        eprint!("\nContinue? [y/N] ");
        std::io::Write::flush(&mut std::io::stderr())?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
    }

    async fn extract_manifest(&self, config: &ConnectionConfig) -> Result<Option<Manifest>> {
        let catalog = Self::open_catalog(config).await?;
        let options = ExtractOptions::new(config.protection.clone());
        match self.until_cancelled(extract::extract(&catalog, &options)).await {
            Some(result) => Ok(Some(result.context("Extraction failed")?)),
            None => Ok(None),
        }
    }

    async fn extract(&self, source: &Path, out: &Path) -> Result<ExitStatus> {
        let config = Self::load_config(source, ConnectionSide::Source)?;
        let Some(manifest) = self.extract_manifest(&config).await? else {
            return Ok(ExitStatus::Cancelled);
        };
        manifest.save(out)?;

        tracing::info!(
            path = %out.display(),
            roles = manifest.summary.total_roles,
            databases = manifest.summary.user_databases,
            grants = manifest.summary.total_grants,
            "Manifest written"
        );
        if manifest.extraction_errors.is_empty() {
            Ok(ExitStatus::Success)
        } else {
            Ok(ExitStatus::Failure)
        }
    }

    fn generate(input: &Path, out: &Path, no_strict: bool) -> Result<ExitStatus> {
        let manifest = Self::load_manifest(input)?;
        let options = PlanOptions {
            strict: !no_strict,
            ..PlanOptions::default()
        };
        let plan = plan::plan(&manifest, &options);
        let files = write_plan(&plan, out, &PlanHeader::from_manifest(&manifest))?;

        tracing::info!(
            dir = %out.display(),
            files = files.len(),
            statements = plan.len(),
            "Plan written"
        );
        Ok(ExitStatus::Success)
    }

    async fn apply(
        &self,
        dest: &Path,
        input: &Path,
        args: &ApplyArgs,
        interactive: bool,
        report_path: Option<&Path>,
    ) -> Result<ExitStatus> {
        let manifest = Self::load_manifest(input)?;
        let config = Self::load_config(dest, ConnectionSide::Destination)?;
        let plan = plan::plan(&manifest, &PlanOptions::default());

        if interactive && !Self::confirm(&plan, &config.server_label())? {
            tracing::warn!("Apply declined");
            return Ok(ExitStatus::Cancelled);
        }

        let conn = postgres::connect(&config).await?;
        let mut target = PgTarget::new(conn);
        let report = apply::apply(
            &plan,
            &mut target,
            &Self::apply_options(&config, args),
            self.shutdown.subscribe(),
        )
        .await;

        Self::emit_report(&report, report_path)?;
        Ok(Self::apply_status(&report))
    }

    async fn validate(
        &self,
        source: &Path,
        dest: &Path,
        report_path: Option<&Path>,
    ) -> Result<ExitStatus> {
        let source_config = Self::load_config(source, ConnectionSide::Source)?;
        let dest_config = Self::load_config(dest, ConnectionSide::Destination)?;
        let source_catalog = Self::open_catalog(&source_config).await?;
        let dest_catalog = Self::open_catalog(&dest_config).await?;

        // What was migrated is defined by the source's protection lists
        let options = ExtractOptions::new(source_config.protection.clone());
        let Some(report) = self
            .until_cancelled(validate::validate(&source_catalog, &dest_catalog, &options))
            .await
        else {
            return Ok(ExitStatus::Cancelled);
        };
        let report = report.context("Validation failed")?;

        Self::emit_report(&report, report_path)?;
        Ok(Self::validation_status(&report))
    }

    async fn migrate(
        &self,
        source: &Path,
        dest: &Path,
        args: &ApplyArgs,
        out_dir: Option<&Path>,
    ) -> Result<ExitStatus> {
        let source_config = Self::load_config(source, ConnectionSide::Source)?;
        let dest_config = Self::load_config(dest, ConnectionSide::Destination)?;

        let Some(manifest) = self.extract_manifest(&source_config).await? else {
            return Ok(ExitStatus::Cancelled);
        };
        let mut status = if manifest.extraction_errors.is_empty() {
            ExitStatus::Success
        } else {
            ExitStatus::Failure
        };

        let plan = plan::plan(&manifest, &PlanOptions::default());
        if let Some(dir) = out_dir {
            manifest.save(&dir.join(DEFAULT_MANIFEST_FILE))?;
            write_plan(&plan, dir, &PlanHeader::from_manifest(&manifest))?;
        }

        let conn = postgres::connect(&dest_config).await?;
        let mut target = PgTarget::new(conn);
        let report = apply::apply(
            &plan,
            &mut target,
            &Self::apply_options(&dest_config, args),
            self.shutdown.subscribe(),
        )
        .await;
        status = status.worst(Self::apply_status(&report));

        let equivalence = if args.dry_run || report.cancelled || report.aborted.is_some() {
            None
        } else {
            // Re-read the destination over the connection the plan ran on
            let dest_catalog = PgCatalog::new(
                target.into_connection(),
                dest_config.server_label(),
                dest_config.statement_timeout_secs,
            );
            let options = ExtractOptions::new(source_config.protection.clone());
            match self.until_cancelled(extract::extract(&dest_catalog, &options)).await {
                Some(dest_manifest) => {
                    let dest_manifest = dest_manifest.context("Destination extraction failed")?;
                    Some(validate::compare(&manifest, &dest_manifest, &options.protection))
                }
                None => {
                    status = ExitStatus::Cancelled;
                    None
                }
            }
        };
        if let Some(equivalence) = &equivalence {
            status = status.worst(Self::validation_status(equivalence));
        }

        match out_dir {
            Some(dir) => {
                Self::emit_report(&report, Some(&dir.join(APPLY_REPORT_FILE)))?;
                if let Some(equivalence) = &equivalence {
                    Self::emit_report(equivalence, Some(&dir.join(VALIDATION_REPORT_FILE)))?;
                }
            }
            None => Self::emit_report(
                &MigrationReport {
                    apply: &report,
                    validation: equivalence.as_ref(),
                },
                None,
            )?,
        }

        tracing::info!(
            applied = report.summary.applied(),
            failed = report.summary.failed(),
            conforming = equivalence.as_ref().map(|e| e.summary.conforming),
            "Migration finished"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::manifest::Role;
    use crate::domain::privilege::PrivilegeSet;
    use crate::domain::testing::{database, entry, manifest};

    #[test]
    fn test_load_manifest_rejects_unknown_grantee() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let m = manifest(
            vec![Role::login("app")],
            vec![database("app_db", "app")],
            vec![("app_db", vec![entry("ghost", PrivilegeSet::all(), false)])],
        );
        m.save(&path).unwrap();

        let err = CoreApp::load_manifest(&path).unwrap_err();
        assert_eq!(ExitStatus::from_error(&err), ExitStatus::Config);
        assert_eq!(ExitStatus::from_error(&err).code(), 2);
    }

    #[test]
    fn test_generate_writes_plan_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("manifest.json");
        let out = dir.path().join("plan");
        manifest(
            vec![Role::login("app")],
            vec![database("app_db", "app")],
            vec![("app_db", vec![entry("app", PrivilegeSet::all(), false)])],
        )
        .save(&input)
        .unwrap();

        let status = CoreApp::generate(&input, &out, false).unwrap();
        assert_eq!(status, ExitStatus::Success);
        assert!(out.join("01_roles.sql").exists());
        assert!(out.join("04_validate.sql").exists());
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let err = CoreApp::load_config(Path::new("/nonexistent/dest.json"), ConnectionSide::Destination)
            .unwrap_err();
        assert_eq!(ExitStatus::from_error(&err), ExitStatus::Config);
    }

    #[test]
    fn test_report_path_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        CoreApp::emit_report(&serde_json::json!({"ok": true}), Some(&path)).unwrap();
        assert!(path.exists());
    }
}
