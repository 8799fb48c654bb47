//! Idempotent column migrations.
//!
//! A run inspects the target table once, applies each requested change
//! unless the schema already satisfies it, re-inspects to verify, and
//! returns one [`MigrationResult`] per requested change in plan order.
//!
//! Independent steps run as separate statements, so one failure does not
//! stop its siblings. Atomic groups run in a single transaction.
//!
//! Two runs against the same table at the same time are not coordinated.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{PgBackend, SchemaBackend};
use crate::config::ConnectionConfig;
use crate::db::Database;
use crate::errors::MigrationError;
use crate::schema::{Change, ColumnName, ColumnSpec, TableName};

/// One entry of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Add(ColumnSpec),
    Drop(ColumnName),
    /// Changes that only make sense together: all land or none do.
    Atomic(Vec<Change>),
}

/// Ordered column changes for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub table: TableName,
    pub steps: Vec<Step>,
}

impl MigrationPlan {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            steps: Vec::new(),
        }
    }

    pub fn add(mut self, spec: ColumnSpec) -> Self {
        self.steps.push(Step::Add(spec));
        self
    }

    pub fn drop_column(mut self, name: ColumnName) -> Self {
        self.steps.push(Step::Drop(name));
        self
    }

    pub fn atomic(mut self, changes: Vec<Change>) -> Self {
        self.steps.push(Step::Atomic(changes));
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, MigrationError> {
        let plan: Self =
            serde_json::from_str(json).map_err(|e| MigrationError::InvalidPlan(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| MigrationError::InvalidPlan(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.steps.is_empty() {
            return Err(MigrationError::InvalidPlan(format!(
                "plan for {} has no steps",
                self.table
            )));
        }
        if self
            .steps
            .iter()
            .any(|s| matches!(s, Step::Atomic(changes) if changes.is_empty()))
        {
            return Err(MigrationError::InvalidPlan(
                "atomic group with no changes".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of per-column results a run of this plan produces.
    pub fn change_count(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match s {
                Step::Atomic(changes) => changes.len(),
                _ => 1,
            })
            .sum()
    }
}

/// Outcome of one requested change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnAction {
    Added,
    SkippedExisting,
    Dropped,
    SkippedAbsent,
    Failed,
}

impl ColumnAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnAction::Added => "added",
            ColumnAction::SkippedExisting => "skipped-existing",
            ColumnAction::Dropped => "dropped",
            ColumnAction::SkippedAbsent => "skipped-absent",
            ColumnAction::Failed => "failed",
        }
    }
}

impl fmt::Display for ColumnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub column: String,
    pub action: ColumnAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MigrationResult {
    fn new(column: &ColumnName, action: ColumnAction) -> Self {
        Self {
            column: column.to_string(),
            action,
            detail: None,
        }
    }

    fn failed(column: &ColumnName, detail: String) -> Self {
        Self {
            column: column.to_string(),
            action: ColumnAction::Failed,
            detail: Some(detail),
        }
    }
}

/// Post-run check of the live schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub verified: bool,
    /// Columns that should exist after the run but do not.
    pub missing: Vec<String>,
    /// Columns that should be gone after the run but are still there.
    pub lingering: Vec<String>,
    /// Set when the schema could not be re-read after applying changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Complete,
    PartialFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub table: String,
    pub results: Vec<MigrationResult>,
    pub verification: Verification,
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
}

impl MigrationReport {
    pub fn count(&self, action: ColumnAction) -> usize {
        self.results.iter().filter(|r| r.action == action).count()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Complete
    }

    /// 0 when complete, 2 on partial failure.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Complete => 0,
            RunStatus::PartialFailure => 2,
        }
    }

    pub fn summary_line(&self) -> String {
        let verdict = if self.verification.verified {
            "verified"
        } else {
            "NOT verified"
        };
        format!(
            "{}: {} added, {} dropped, {} skipped, {} failed; schema {}",
            self.table,
            self.count(ColumnAction::Added),
            self.count(ColumnAction::Dropped),
            self.count(ColumnAction::SkippedExisting) + self.count(ColumnAction::SkippedAbsent),
            self.count(ColumnAction::Failed),
            verdict
        )
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.results {
            let marker = if r.action == ColumnAction::Failed {
                "✗"
            } else {
                "✓"
            };
            match &r.detail {
                Some(detail) => writeln!(f, "  {} {:<32} {} ({})", marker, r.column, r.action, detail)?,
                None => writeln!(f, "  {} {:<32} {}", marker, r.column, r.action)?,
            }
        }
        if !self.verification.missing.is_empty() {
            writeln!(f, "  missing after run: {}", self.verification.missing.join(", "))?;
        }
        if let Some(error) = &self.verification.error {
            writeln!(f, "  could not verify schema: {}", error)?;
        }
        if !self.verification.lingering.is_empty() {
            writeln!(
                f,
                "  still present after run: {}",
                self.verification.lingering.join(", ")
            )?;
        }
        write!(f, "{}", self.summary_line())
    }
}

/// Lifecycle of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Connecting,
    InspectingSchema,
    ApplyingChanges,
    Verifying,
    Complete,
    PartialFailure,
    Closed,
}

/// Records and logs state transitions for one run.
#[derive(Debug)]
pub struct RunTracker {
    table: String,
    history: Vec<RunState>,
}

impl RunTracker {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            history: vec![RunState::Init],
        }
    }

    pub fn state(&self) -> RunState {
        self.history.last().copied().unwrap_or(RunState::Init)
    }

    pub fn enter(&mut self, next: RunState) {
        tracing::debug!(table = %self.table, "migration state: {:?} -> {:?}", self.state(), next);
        self.history.push(next);
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }
}

pub struct Migrator<B> {
    backend: B,
}

impl<B: SchemaBackend> Migrator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn run(&self, plan: &MigrationPlan) -> Result<MigrationReport, MigrationError> {
        let mut tracker = RunTracker::new(plan.table.to_string());
        self.run_tracked(plan, &mut tracker).await
    }

    /// Adds each column unless it already exists. Columns are independent.
    pub async fn add_columns(
        &self,
        table: &TableName,
        specs: &[ColumnSpec],
    ) -> Result<MigrationReport, MigrationError> {
        let plan = specs
            .iter()
            .cloned()
            .fold(MigrationPlan::new(table.clone()), MigrationPlan::add);
        self.run(&plan).await
    }

    /// Drops each column unless it is already gone. Columns are independent.
    pub async fn drop_columns(
        &self,
        table: &TableName,
        names: &[ColumnName],
    ) -> Result<MigrationReport, MigrationError> {
        let plan = names
            .iter()
            .cloned()
            .fold(MigrationPlan::new(table.clone()), MigrationPlan::drop_column);
        self.run(&plan).await
    }

    pub async fn run_tracked(
        &self,
        plan: &MigrationPlan,
        tracker: &mut RunTracker,
    ) -> Result<MigrationReport, MigrationError> {
        plan.validate()?;
        let table = &plan.table;

        tracker.enter(RunState::InspectingSchema);
        if !self.backend.table_exists(table).await? {
            return Err(MigrationError::SchemaInspection {
                table: table.to_string(),
                message: "table does not exist".to_string(),
            });
        }
        let mut present: HashSet<String> =
            self.backend.column_names(table).await?.into_iter().collect();
        tracing::info!("{} has {} columns before migration", table, present.len());

        tracker.enter(RunState::ApplyingChanges);
        let mut results = Vec::with_capacity(plan.change_count());
        for step in &plan.steps {
            match step {
                Step::Add(spec) => {
                    let change = Change::Add(spec.clone());
                    results.push(self.apply_single(table, &change, &mut present).await);
                }
                Step::Drop(name) => {
                    let change = Change::Drop(name.clone());
                    results.push(self.apply_single(table, &change, &mut present).await);
                }
                Step::Atomic(changes) => {
                    results.extend(self.apply_group(table, changes, &mut present).await);
                }
            }
        }

        tracker.enter(RunState::Verifying);
        // Changes already ran, so a failed re-read must not discard their results.
        let verification = match self.backend.column_names(table).await {
            Ok(after) => verify(plan, &results, &after),
            Err(e) => {
                tracing::error!("Could not re-read {} to verify the run: {}", table, e);
                Verification {
                    error: Some(e.detail()),
                    ..Verification::default()
                }
            }
        };

        let failed = results.iter().any(|r| r.action == ColumnAction::Failed);
        let status = if failed || !verification.verified {
            tracker.enter(RunState::PartialFailure);
            RunStatus::PartialFailure
        } else {
            tracker.enter(RunState::Complete);
            RunStatus::Complete
        };

        Ok(MigrationReport {
            table: table.to_string(),
            results,
            verification,
            status,
            finished_at: Utc::now(),
        })
    }

    async fn apply_single(
        &self,
        table: &TableName,
        change: &Change,
        present: &mut HashSet<String>,
    ) -> MigrationResult {
        let column = change.column();

        if change.is_satisfied_by(present) {
            return skipped(change);
        }

        match self.backend.apply(table, change).await {
            Ok(()) => {
                record_applied(change, present);
                let result = applied(change);
                tracing::info!("{}.{}: {}", table, column, result.action);
                result
            }
            Err(e) => {
                tracing::error!("Failed to {} {}.{}: {}", change.intent(), table, column, e);
                MigrationResult::failed(column, e.detail())
            }
        }
    }

    async fn apply_group(
        &self,
        table: &TableName,
        changes: &[Change],
        present: &mut HashSet<String>,
    ) -> Vec<MigrationResult> {
        // Decide against the schema as it will look inside the transaction.
        let mut pending = present.clone();
        let mut to_run = Vec::new();
        let mut skipped_upfront = vec![false; changes.len()];
        let mut executes = vec![false; changes.len()];

        for (i, change) in changes.iter().enumerate() {
            if change.is_satisfied_by(&pending) {
                skipped_upfront[i] = change.is_satisfied_by(present);
            } else {
                record_applied(change, &mut pending);
                to_run.push(change.clone());
                executes[i] = true;
            }
        }

        if to_run.is_empty() {
            return changes.iter().map(skipped).collect();
        }

        match self.backend.apply_atomic(table, &to_run).await {
            Ok(()) => {
                tracing::info!(
                    "{}: atomic group of {} changes committed",
                    table,
                    to_run.len()
                );
                *present = pending;
                changes
                    .iter()
                    .zip(executes)
                    .map(|(change, ran)| if ran { applied(change) } else { skipped(change) })
                    .collect()
            }
            Err(e) => {
                tracing::error!("{}: atomic group rolled back: {}", table, e);
                let failing = match &e {
                    MigrationError::ColumnOperation { column, .. } => Some(column.clone()),
                    _ => None,
                };
                changes
                    .iter()
                    .enumerate()
                    .map(|(i, change)| {
                        if skipped_upfront[i] {
                            skipped(change)
                        } else if executes[i] && failing.as_deref() == Some(change.column().as_str()) {
                            MigrationResult::failed(change.column(), e.detail())
                        } else {
                            MigrationResult::failed(
                                change.column(),
                                format!("rolled back: {}", e.detail()),
                            )
                        }
                    })
                    .collect()
            }
        }
    }
}

fn skipped(change: &Change) -> MigrationResult {
    match change {
        Change::Add(spec) => {
            tracing::info!(
                "{} already exists, left untouched (type not compared with {})",
                spec.name,
                spec.column_type
            );
            MigrationResult::new(&spec.name, ColumnAction::SkippedExisting)
        }
        Change::Drop(name) => {
            tracing::info!("{} already absent", name);
            MigrationResult::new(name, ColumnAction::SkippedAbsent)
        }
    }
}

fn applied(change: &Change) -> MigrationResult {
    match change {
        Change::Add(spec) => MigrationResult::new(&spec.name, ColumnAction::Added),
        Change::Drop(name) => MigrationResult::new(name, ColumnAction::Dropped),
    }
}

fn record_applied(change: &Change, present: &mut HashSet<String>) {
    match change {
        Change::Add(spec) => {
            present.insert(spec.name.to_string());
        }
        Change::Drop(name) => {
            present.remove(name.as_str());
        }
    }
}

/// Compares the live columns with what the non-failed changes imply.
///
/// The last successful change to a column decides whether it should exist.
fn verify(plan: &MigrationPlan, results: &[MigrationResult], after: &[String]) -> Verification {
    let changes = plan.steps.iter().flat_map(|s| match s {
        Step::Add(spec) => vec![Change::Add(spec.clone())],
        Step::Drop(name) => vec![Change::Drop(name.clone())],
        Step::Atomic(changes) => changes.clone(),
    });

    let mut order: Vec<String> = Vec::new();
    let mut expected: HashMap<String, bool> = HashMap::new();
    for (change, result) in changes.zip(results) {
        if result.action == ColumnAction::Failed {
            continue;
        }
        let column = change.column().to_string();
        if !expected.contains_key(&column) {
            order.push(column.clone());
        }
        expected.insert(column, matches!(change, Change::Add(_)));
    }

    let live: HashSet<&str> = after.iter().map(String::as_str).collect();
    let mut verification = Verification::default();
    for column in order {
        let should_exist = expected[&column];
        let exists = live.contains(column.as_str());
        if should_exist && !exists {
            verification.missing.push(column);
        } else if !should_exist && exists {
            verification.lingering.push(column);
        }
    }
    verification.verified = verification.missing.is_empty() && verification.lingering.is_empty();
    verification
}

/// Connects, runs `plan`, and releases the connection on every path.
pub async fn run_plan(
    config: &ConnectionConfig,
    plan: &MigrationPlan,
) -> Result<MigrationReport, MigrationError> {
    plan.validate()?;

    let mut tracker = RunTracker::new(plan.table.to_string());
    tracker.enter(RunState::Connecting);

    let tracker_ref = &mut tracker;
    let result = Database::scoped(config, |pool| async move {
        Migrator::new(PgBackend::new(pool))
            .run_tracked(plan, tracker_ref)
            .await
    })
    .await;

    tracker.enter(RunState::Closed);
    result
}
