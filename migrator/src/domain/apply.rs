//! Executor: runs a plan against the destination, one statement at a time
//!
//! Per statement: probe, then execute (or prepare in dry-run), then classify.
//! ```text
//!   pending -> running -> applied | skipped | warned | failed
//! ```
//! The report only ever holds terminal states.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::data::error::{SQLSTATE_INSUFFICIENT_PRIVILEGE, SQLSTATE_QUERY_CANCELED, TargetError};
use crate::data::traits::ApplyTarget;
use crate::domain::plan::{Phase, Plan, Statement, VerificationKind};

const REASON_TIMEOUT: &str = "timeout";
const REASON_CANCELLED: &str = "cancelled";
const REASON_CONNECTION_LOST: &str = "connection lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyMode {
    DryRun,
    Execute,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorPolicy {
    #[default]
    ContinueOnError,
    StopOnFirstError,
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub mode: ApplyMode,
    pub policy: ErrorPolicy,
    /// Client-side bound on probe plus execution of one statement
    pub statement_timeout: Duration,
}

/// Outcome class of a statement, derived from its SQLSTATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Classification {
    Success,
    AlreadyExists,
    MissingGrantee,
    PermissionDenied,
    SyntaxOrFatal,
}

impl Classification {
    pub fn from_sqlstate(code: Option<&str>) -> Self {
        match code {
            // duplicate_object, duplicate_database
            Some("42710") | Some("42P04") => Self::AlreadyExists,
            // undefined_object
            Some("42704") => Self::MissingGrantee,
            Some(SQLSTATE_INSUFFICIENT_PRIVILEGE) => Self::PermissionDenied,
            _ => Self::SyntaxOrFatal,
        }
    }

    pub fn state(&self) -> StatementState {
        match self {
            Self::Success => StatementState::Applied,
            Self::AlreadyExists => StatementState::Skipped,
            Self::MissingGrantee => StatementState::Warned,
            Self::PermissionDenied | Self::SyntaxOrFatal => StatementState::Failed,
        }
    }
}

/// Terminal statement state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementState {
    Applied,
    Skipped,
    Warned,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementRecord {
    pub index: usize,
    pub phase: Phase,
    pub target: String,
    /// Statement text with password hashes redacted
    pub sql: String,
    pub state: StatementState,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlstate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

/// Per-phase counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySummary {
    pub applied_roles: usize,
    pub skipped_roles: usize,
    pub warned_roles: usize,
    pub failed_roles: usize,
    pub applied_databases: usize,
    pub skipped_databases: usize,
    pub warned_databases: usize,
    pub failed_databases: usize,
    pub applied_grants: usize,
    pub skipped_grants: usize,
    pub warned_grants: usize,
    pub failed_grants: usize,
}

impl ApplySummary {
    fn record(&mut self, phase: Phase, state: StatementState) {
        let counter = match (phase, state) {
            (Phase::Roles, StatementState::Applied) => &mut self.applied_roles,
            (Phase::Roles, StatementState::Skipped) => &mut self.skipped_roles,
            (Phase::Roles, StatementState::Warned) => &mut self.warned_roles,
            (Phase::Roles, StatementState::Failed) => &mut self.failed_roles,
            (Phase::Databases, StatementState::Applied) => &mut self.applied_databases,
            (Phase::Databases, StatementState::Skipped) => &mut self.skipped_databases,
            (Phase::Databases, StatementState::Warned) => &mut self.warned_databases,
            (Phase::Databases, StatementState::Failed) => &mut self.failed_databases,
            (Phase::Grants, StatementState::Applied) => &mut self.applied_grants,
            (Phase::Grants, StatementState::Skipped) => &mut self.skipped_grants,
            (Phase::Grants, StatementState::Warned) => &mut self.warned_grants,
            (Phase::Grants, StatementState::Failed) => &mut self.failed_grants,
        };
        *counter += 1;
    }

    pub fn applied(&self) -> usize {
        self.applied_roles + self.applied_databases + self.applied_grants
    }

    pub fn failed(&self) -> usize {
        self.failed_roles + self.failed_databases + self.failed_grants
    }

    pub fn warned(&self) -> usize {
        self.warned_roles + self.warned_databases + self.warned_grants
    }

    pub fn skipped(&self) -> usize {
        self.skipped_roles + self.skipped_databases + self.skipped_grants
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub name: VerificationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub mode: ApplyMode,
    pub policy: ErrorPolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub statements: Vec<StatementRecord>,
    pub summary: ApplySummary,
    pub verification: Vec<VerificationResult>,
    /// Set when the connection was lost mid-plan
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub cancelled: bool,
    /// Halted by `stopOnFirstError`
    pub stopped: bool,
}

impl ApplyReport {
    pub fn has_errors(&self) -> bool {
        self.summary.failed() > 0 || self.aborted.is_some() || self.stopped
    }
}

/// Result of running one statement
enum Outcome {
    Done {
        classification: Classification,
        sqlstate: Option<String>,
        message: Option<String>,
        reason: Option<&'static str>,
    },
    ConnectionLost(String),
}

impl Outcome {
    fn success() -> Self {
        Self::Done {
            classification: Classification::Success,
            sqlstate: None,
            message: None,
            reason: None,
        }
    }

    fn already_in_effect() -> Self {
        Self::Done {
            classification: Classification::AlreadyExists,
            sqlstate: None,
            message: Some("already in effect".to_string()),
            reason: None,
        }
    }

    fn failed(reason: &'static str) -> Self {
        Self::Done {
            classification: Classification::SyntaxOrFatal,
            sqlstate: None,
            message: None,
            reason: Some(reason),
        }
    }

    fn from_error(e: TargetError) -> Self {
        match e {
            TargetError::ConnectionLost(message) => Self::ConnectionLost(message),
            TargetError::Database { code, message } => {
                let reason = (code.as_deref() == Some(SQLSTATE_QUERY_CANCELED)).then_some(REASON_TIMEOUT);
                Self::Done {
                    classification: Classification::from_sqlstate(code.as_deref()),
                    sqlstate: code,
                    message: Some(message),
                    reason,
                }
            }
        }
    }
}

async fn run_statement<T>(target: &mut T, statement: &Statement, mode: ApplyMode) -> Outcome
where
    T: ApplyTarget + ?Sized,
{
    if mode == ApplyMode::DryRun {
        return match target.prepare(statement).await {
            Ok(()) => Outcome::success(),
            Err(e) => Outcome::from_error(e),
        };
    }

    match target.exists(&statement.action).await {
        Ok(true) => return Outcome::already_in_effect(),
        Ok(false) => {}
        Err(e) => return Outcome::from_error(e),
    }

    match target.execute(statement).await {
        Ok(()) => Outcome::success(),
        Err(e) => Outcome::from_error(e),
    }
}

/// Resolves once cancellation is requested; never if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Apply a plan
pub async fn apply<T>(
    plan: &Plan,
    target: &mut T,
    options: &ApplyOptions,
    mut cancel: watch::Receiver<bool>,
) -> ApplyReport
where
    T: ApplyTarget + ?Sized,
{
    let dry_run = options.mode == ApplyMode::DryRun;
    let mut report = ApplyReport {
        mode: options.mode,
        policy: options.policy,
        started_at: Utc::now(),
        finished_at: Utc::now(),
        statements: Vec::with_capacity(plan.len()),
        summary: ApplySummary::default(),
        verification: Vec::new(),
        aborted: None,
        cancelled: false,
        stopped: false,
    };

    tracing::info!(
        statements = plan.len(),
        dry_run,
        policy = ?options.policy,
        "Applying plan"
    );

    for (index, statement) in plan.statements().enumerate() {
        if *cancel.borrow() {
            report.cancelled = true;
            break;
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                report.cancelled = true;
                Outcome::failed(REASON_CANCELLED)
            }
            result = tokio::time::timeout(
                options.statement_timeout,
                run_statement(target, statement, options.mode),
            ) => result.unwrap_or_else(|_| Outcome::failed(REASON_TIMEOUT)),
        };

        let (classification, sqlstate, message, reason, lost) = match outcome {
            Outcome::Done {
                classification,
                sqlstate,
                message,
                reason,
            } => (classification, sqlstate, message, reason, None),
            Outcome::ConnectionLost(message) => (
                Classification::SyntaxOrFatal,
                None,
                Some(message.clone()),
                Some(REASON_CONNECTION_LOST),
                Some(message),
            ),
        };
        let state = classification.state();
        let record = StatementRecord {
            index,
            phase: statement.phase,
            target: statement.action.describe(),
            sql: statement.redacted_sql().into_owned(),
            state,
            classification,
            sqlstate,
            message,
            reason: reason.map(str::to_string),
            dry_run,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        log_record(&record);
        report.summary.record(statement.phase, state);
        report.statements.push(record);

        if let Some(message) = lost {
            tracing::error!(error = %message, "Connection to destination lost; aborting");
            report.aborted = Some(message);
            break;
        }
        if report.cancelled {
            tracing::warn!("Cancellation requested; stopping");
            break;
        }
        if options.policy == ErrorPolicy::StopOnFirstError
            && matches!(state, StatementState::Warned | StatementState::Failed)
        {
            tracing::warn!(index, "Stopping on first error");
            report.stopped = true;
            break;
        }
    }

    let completed = report.aborted.is_none() && !report.cancelled && !report.stopped;
    if completed {
        for query in &plan.validation {
            let result = match tokio::time::timeout(options.statement_timeout, target.count(query))
                .await
            {
                Ok(Ok(value)) => VerificationResult {
                    name: query.kind,
                    value: Some(value),
                    error: None,
                },
                Ok(Err(e)) => VerificationResult {
                    name: query.kind,
                    value: None,
                    error: Some(e.to_string()),
                },
                Err(_) => VerificationResult {
                    name: query.kind,
                    value: None,
                    error: Some(REASON_TIMEOUT.to_string()),
                },
            };
            tracing::debug!(probe = query.kind.as_str(), value = ?result.value, "Verification probe");
            report.verification.push(result);
        }
    }

    report.finished_at = Utc::now();
    tracing::info!(
        applied = report.summary.applied(),
        skipped = report.summary.skipped(),
        warned = report.summary.warned(),
        failed = report.summary.failed(),
        aborted = report.aborted.is_some(),
        cancelled = report.cancelled,
        "Apply finished"
    );
    report
}

fn log_record(record: &StatementRecord) {
    match record.state {
        StatementState::Applied | StatementState::Skipped => tracing::debug!(
            index = record.index,
            phase = %record.phase,
            target = %record.target,
            state = ?record.state,
            "Statement finished"
        ),
        StatementState::Warned => tracing::warn!(
            index = record.index,
            target = %record.target,
            error = record.message.as_deref().unwrap_or_default(),
            "Statement skipped with warning"
        ),
        StatementState::Failed => tracing::warn!(
            index = record.index,
            target = %record.target,
            sql = %record.sql,
            sqlstate = record.sqlstate.as_deref().unwrap_or_default(),
            reason = record.reason.as_deref().unwrap_or_default(),
            error = record.message.as_deref().unwrap_or_default(),
            "Statement failed"
        ),
    }
}
