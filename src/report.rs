use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::finding::Origin;

/// What happened to one finding during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Created,
    Updated,
    Resolved,
    /// Nothing to write: already resolved in place, or content unchanged.
    Unchanged,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FindingOutcome {
    pub reference: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub resolved: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub orphaned: usize,
    pub malformed: usize,
}

impl SyncStats {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Resolved => self.resolved += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Failed(_) => self.errors += 1,
        }
    }
}

/// A source whose fetch failed this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub origin: Origin,
    pub error: String,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub stats: SyncStats,
    pub orphans: BTreeSet<String>,
    /// Findings whose board calls failed, with the error.
    pub failures: Vec<FindingOutcome>,
    pub failed_sources: Vec<SourceFailure>,
}

impl SyncReport {
    /// Whether every configured source fetched and every finding applied.
    pub fn is_clean(&self) -> bool {
        self.stats.errors == 0 && self.failed_sources.is_empty()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "=== Synchronization Results ===")?;
        writeln!(f, "Created:   {}", s.created)?;
        writeln!(f, "Updated:   {}", s.updated)?;
        writeln!(f, "Resolved:  {}", s.resolved)?;
        writeln!(f, "Unchanged: {}", s.unchanged)?;
        writeln!(f, "Errors:    {}", s.errors)?;
        writeln!(f, "Orphaned:  {}", s.orphaned)?;
        write!(f, "Malformed: {}", s.malformed)?;
        for failure in &self.failed_sources {
            write!(f, "\nSource {} failed: {}", failure.origin, failure.error)?;
        }
        for failure in &self.failures {
            if let Outcome::Failed(msg) = &failure.outcome {
                write!(f, "\n  {}: {msg}", failure.reference)?;
            }
        }
        Ok(())
    }
}

/// What a pass would do to one finding, computed without writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlannedAction {
    Create { column_id: u64 },
    Update { task_id: u64, move_to: Option<u64> },
    Resolve { task_id: u64, move_to: Option<u64> },
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedAction::Create { column_id } => write!(f, "create in column {column_id}"),
            PlannedAction::Update {
                task_id,
                move_to: Some(column),
            } => write!(f, "update task #{task_id}, move to column {column}"),
            PlannedAction::Update {
                task_id,
                move_to: None,
            } => write!(f, "update task #{task_id}"),
            PlannedAction::Resolve {
                task_id,
                move_to: Some(column),
            } => write!(f, "resolve task #{task_id} into column {column}"),
            PlannedAction::Resolve {
                task_id,
                move_to: None,
            } => write!(f, "task #{task_id} already resolved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub reference: String,
    pub title: String,
    pub action: PlannedAction,
}

/// Dry-run result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub steps: Vec<PlannedStep>,
    pub orphans: BTreeSet<String>,
    pub malformed: usize,
    pub failed_sources: Vec<SourceFailure>,
}

impl SyncPlan {
    pub fn count(&self, pred: impl Fn(&PlannedAction) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(&s.action)).count()
    }
}

impl fmt::Display for SyncPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Dry Run ===")?;
        for step in &self.steps {
            writeln!(f, "{}: {} ({})", step.reference, step.action, step.title)?;
        }
        let creates = self.count(|a| matches!(a, PlannedAction::Create { .. }));
        let updates = self.count(|a| matches!(a, PlannedAction::Update { .. }));
        let resolves = self.count(|a| {
            matches!(
                a,
                PlannedAction::Resolve {
                    move_to: Some(_),
                    ..
                }
            )
        });
        write!(
            f,
            "Would create {creates}, update {updates}, resolve {resolves}; {} orphaned, {} malformed",
            self.orphans.len(),
            self.malformed
        )?;
        for failure in &self.failed_sources {
            write!(f, "\nSource {} failed: {}", failure.origin, failure.error)?;
        }
        Ok(())
    }
}

/// Snapshot of how sources and board relate, without writing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub findings_total: usize,
    pub open: usize,
    pub resolved: usize,
    pub by_category: BTreeMap<String, usize>,
    /// Board tasks carrying one of this integration's prefixes.
    pub board_tasks: usize,
    pub synchronized: usize,
    pub missing_in_board: usize,
    pub orphaned_in_board: usize,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Integration Status ===")?;
        writeln!(f, "Findings:          {}", self.findings_total)?;
        writeln!(f, "  open:            {}", self.open)?;
        writeln!(f, "  resolved:        {}", self.resolved)?;
        for (category, count) in &self.by_category {
            writeln!(f, "  {category}: {count}")?;
        }
        writeln!(f, "Board tasks:       {}", self.board_tasks)?;
        writeln!(f, "Synchronized:      {}", self.synchronized)?;
        writeln!(f, "Missing in board:  {}", self.missing_in_board)?;
        write!(f, "Orphaned in board: {}", self.orphaned_in_board)
    }
}
