use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::board::{BoardClient, ColumnTargets, NewTask, Task, TaskUpdate};
use crate::error::{Error, Result};
use crate::finding::{Finding, Origin};
use crate::mapping::{TaskContent, strip_stamp, task_content, title_for};
use crate::report::{
    FindingOutcome, Outcome, PlannedAction, PlannedStep, SourceFailure, StatusReport, SyncPlan,
    SyncReport, SyncStats,
};
use crate::retry::RetryPolicy;
use crate::sources::FindingSource;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_TARGET_COLUMN: &str = "Pending";
pub const DEFAULT_RESOLVED_COLUMN: &str = "Done";

/// Source of the per-pass timestamp written into descriptions.
pub type Clock = fn() -> NaiveDateTime;

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// When an existing open task gets its content rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    /// Overwrite title, description and color on every pass.
    #[default]
    Always,
    /// Skip the update call when the content minus its timestamp is unchanged.
    WhenChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub project_id: u64,
    pub target_column: String,
    pub resolved_column: String,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub update_policy: UpdatePolicy,
}

impl EngineOptions {
    pub fn new(project_id: u64) -> Self {
        Self {
            project_id,
            target_column: DEFAULT_TARGET_COLUMN.to_string(),
            resolved_column: DEFAULT_RESOLVED_COLUMN.to_string(),
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            update_policy: UpdatePolicy::default(),
        }
    }
}

/// Decide what to do with `finding` given the task currently bearing its
/// reference.
pub fn decide(existing: Option<&Task>, finding: &Finding, columns: ColumnTargets) -> PlannedAction {
    match existing {
        None => PlannedAction::Create {
            column_id: if finding.resolved {
                columns.resolved
            } else {
                columns.target
            },
        },
        Some(task) if finding.resolved => PlannedAction::Resolve {
            task_id: task.id,
            move_to: (task.column_id != columns.resolved).then_some(columns.resolved),
        },
        Some(task) => PlannedAction::Update {
            task_id: task.id,
            move_to: (task.column_id != columns.target).then_some(columns.target),
        },
    }
}

/// Existing board tasks keyed by reference.
#[derive(Debug, Default)]
pub struct TaskIndex {
    by_reference: HashMap<String, Task>,
}

impl TaskIndex {
    pub fn build(tasks: Vec<Task>) -> Self {
        let mut by_reference: HashMap<String, Task> = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if task.reference.is_empty() {
                continue;
            }
            if let Some(kept) = by_reference.get(&task.reference) {
                warn!(
                    reference = %task.reference,
                    kept = kept.id,
                    ignored = task.id,
                    "duplicate reference on board, keeping first task"
                );
                continue;
            }
            by_reference.insert(task.reference.clone(), task);
        }
        Self { by_reference }
    }

    pub fn get(&self, reference: &str) -> Option<&Task> {
        self.by_reference.get(reference)
    }

    pub fn len(&self) -> usize {
        self.by_reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_reference.is_empty()
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.by_reference.keys().map(String::as_str)
    }
}

/// Findings sharing one reference, in the order sources produced them.
#[derive(Debug, Clone)]
struct ReferenceGroup {
    reference: String,
    findings: Vec<Finding>,
}

fn group_by_reference(findings: Vec<Finding>) -> Vec<ReferenceGroup> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<ReferenceGroup> = Vec::new();
    for finding in findings {
        let reference = finding.reference();
        match slots.get(&reference) {
            Some(&slot) => groups[slot].findings.push(finding),
            None => {
                slots.insert(reference.clone(), groups.len());
                groups.push(ReferenceGroup {
                    reference,
                    findings: vec![finding],
                });
            }
        }
    }
    groups
}

/// References on the board owned by a trusted origin but absent from `seen`.
fn find_orphans(
    index: &TaskIndex,
    seen: &HashSet<String>,
    trusted: &HashSet<Origin>,
) -> BTreeSet<String> {
    index
        .references()
        .filter(|r| Origin::of_reference(r).is_some_and(|o| trusted.contains(&o)))
        .filter(|r| !seen.contains(*r))
        .map(str::to_string)
        .collect()
}

/// The task as it will look on the board after a write.
fn projected_task(
    project_id: u64,
    task_id: u64,
    reference: &str,
    content: &TaskContent,
    column_id: u64,
) -> Task {
    Task {
        id: task_id,
        project_id,
        title: content.title.clone(),
        description: content.description.clone(),
        column_id,
        swimlane_id: 0,
        color_id: content.color.as_str().to_string(),
        reference: reference.to_string(),
        is_active: true,
    }
}

fn same_content(task: &Task, update: &TaskUpdate) -> bool {
    task.title == update.title
        && task.color_id == update.color_id
        && strip_stamp(&task.description) == strip_stamp(&update.description)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Everything fetched from the sources for one pass.
struct Collected {
    findings: Vec<Finding>,
    malformed: usize,
    /// Origins whose every source fetched completely.
    trusted: HashSet<Origin>,
    failed: Vec<SourceFailure>,
}

/// State shared read-only by the workers of one pass.
struct PassContext<B> {
    board: Arc<B>,
    index: Arc<TaskIndex>,
    columns: ColumnTargets,
    retry: RetryPolicy,
    policy: UpdatePolicy,
    project_id: u64,
    stamped_at: NaiveDateTime,
}

impl<B> Clone for PassContext<B> {
    fn clone(&self) -> Self {
        Self {
            board: Arc::clone(&self.board),
            index: Arc::clone(&self.index),
            columns: self.columns,
            retry: self.retry,
            policy: self.policy,
            project_id: self.project_id,
            stamped_at: self.stamped_at,
        }
    }
}

impl<B: BoardClient> PassContext<B> {
    /// Run each group end to end, in order. A panic while applying a finding
    /// fails the rest of its group; later groups still run.
    fn run_share(&self, groups: Vec<ReferenceGroup>) -> Vec<FindingOutcome> {
        let mut outcomes = Vec::new();
        for group in groups {
            let mut current = self.index.get(&group.reference).cloned();
            for (i, finding) in group.findings.iter().enumerate() {
                let applied = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.apply(&mut current, &group.reference, finding)
                }));
                let outcome = match applied {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        warn!(reference = %group.reference, error = %e, "finding failed");
                        Outcome::Failed(e.to_string())
                    }
                    Err(payload) => {
                        let err = Error::Scheduler(format!(
                            "worker panicked: {}",
                            panic_message(payload.as_ref())
                        ));
                        warn!(reference = %group.reference, error = %err, "finding aborted");
                        // The task's state is unknown now.
                        let remaining = group.findings.len() - i;
                        outcomes.extend((0..remaining).map(|_| FindingOutcome {
                            reference: group.reference.clone(),
                            outcome: Outcome::Failed(err.to_string()),
                        }));
                        break;
                    }
                };
                outcomes.push(FindingOutcome {
                    reference: group.reference.clone(),
                    outcome,
                });
            }
        }
        outcomes
    }

    /// Apply one finding. `current` tracks the task for this reference so a
    /// later finding in the same group sees the effect of an earlier one.
    fn apply(
        &self,
        current: &mut Option<Task>,
        reference: &str,
        finding: &Finding,
    ) -> Result<Outcome> {
        let content = task_content(finding, self.stamped_at);

        match decide(current.as_ref(), finding, self.columns) {
            PlannedAction::Create { column_id } => {
                let new_task = NewTask {
                    project_id: self.project_id,
                    title: content.title.clone(),
                    description: content.description.clone(),
                    column_id,
                    color_id: content.color.as_str().to_string(),
                    reference: reference.to_string(),
                };
                let task_id = self
                    .retry
                    .run("createTask", || self.board.create_task(&new_task))?;
                info!(reference, task_id, column_id, "created task");
                *current = Some(projected_task(
                    self.project_id,
                    task_id,
                    reference,
                    &content,
                    column_id,
                ));
                Ok(Outcome::Created)
            }
            PlannedAction::Update { task_id, move_to } => {
                let update = TaskUpdate {
                    title: content.title.clone(),
                    description: content.description.clone(),
                    color_id: content.color.as_str().to_string(),
                };
                let write = match (self.policy, current.as_ref()) {
                    (UpdatePolicy::WhenChanged, Some(task)) => !same_content(task, &update),
                    _ => true,
                };

                if write {
                    self.retry
                        .run("updateTask", || self.board.update_task(task_id, &update))?;
                }
                if let Some(column_id) = move_to {
                    self.retry.run("moveTaskPosition", || {
                        self.board.move_task(self.project_id, task_id, column_id)
                    })?;
                }

                if let Some(task) = current.as_mut() {
                    task.title = update.title;
                    task.description = update.description;
                    task.color_id = update.color_id;
                    if let Some(column_id) = move_to {
                        task.column_id = column_id;
                    }
                }

                if write || move_to.is_some() {
                    debug!(reference, task_id, moved = move_to.is_some(), "updated task");
                    Ok(Outcome::Updated)
                } else {
                    debug!(reference, task_id, "task unchanged");
                    Ok(Outcome::Unchanged)
                }
            }
            PlannedAction::Resolve {
                task_id,
                move_to: Some(column_id),
            } => {
                self.retry.run("moveTaskPosition", || {
                    self.board.move_task(self.project_id, task_id, column_id)
                })?;
                info!(reference, task_id, column_id, "moved resolved task");
                if let Some(task) = current.as_mut() {
                    task.column_id = column_id;
                }
                Ok(Outcome::Resolved)
            }
            PlannedAction::Resolve { move_to: None, .. } => Ok(Outcome::Unchanged),
        }
    }
}

/// Reconciles findings from every source against one board project.
pub struct Reconciler<S, B> {
    sources: Vec<S>,
    board: Arc<B>,
    options: EngineOptions,
    columns: ColumnTargets,
    clock: Clock,
}

impl<S: FindingSource, B: BoardClient + 'static> Reconciler<S, B> {
    /// Check the board, look up the project, and resolve the target and
    /// resolved columns. Any failure here is an initialization error.
    pub fn initialize(sources: Vec<S>, board: Arc<B>, options: EngineOptions) -> Result<Self> {
        let retry = options.retry;
        let project_id = options.project_id;

        let version = retry
            .run("getVersion", || board.check_connection())
            .map_err(|e| Error::Initialization(format!("cannot reach board: {e}")))?;
        let project = retry
            .run("getProjectById", || board.project_name(project_id))
            .map_err(|e| Error::Initialization(format!("cannot load project {project_id}: {e}")))?;
        let columns = retry
            .run("getColumns", || board.get_columns(project_id))
            .map_err(|e| Error::Initialization(format!("cannot load columns: {e}")))?;
        let columns =
            ColumnTargets::resolve(&columns, &options.target_column, &options.resolved_column)?;

        info!(
            version = %version,
            project = %project,
            target_column = columns.target,
            resolved_column = columns.resolved,
            "connected to board"
        );

        Ok(Self {
            sources,
            board,
            options,
            columns,
            clock: local_now,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn columns(&self) -> ColumnTargets {
        self.columns
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn collect(&self) -> Result<Collected> {
        let mut findings = Vec::new();
        let mut malformed = 0;
        let mut succeeded = HashSet::new();
        let mut partial = HashSet::new();
        let mut failed = Vec::new();

        for source in &self.sources {
            let origin = source.origin();
            match source.fetch() {
                Ok(batch) => {
                    debug!(%origin, count = batch.findings.len(), "source fetched");
                    if batch.truncated {
                        warn!(%origin, "source listing incomplete, not reporting its orphans");
                        partial.insert(origin);
                    }
                    findings.extend(batch.findings);
                    malformed += batch.malformed;
                    succeeded.insert(origin);
                }
                Err(e) => {
                    warn!(%origin, error = %e, "source fetch failed");
                    failed.push(SourceFailure {
                        origin,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !self.sources.is_empty() && failed.len() == self.sources.len() {
            let detail = failed
                .iter()
                .map(|f| format!("{}: {}", f.origin, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::SourceFetch(format!("every source failed ({detail})")));
        }

        let trusted = succeeded
            .into_iter()
            .filter(|o| !partial.contains(o) && !failed.iter().any(|f| f.origin == *o))
            .collect();

        Ok(Collected {
            findings,
            malformed,
            trusted,
            failed,
        })
    }

    fn load_index(&self) -> Result<TaskIndex> {
        let project_id = self.options.project_id;
        let tasks = self
            .options
            .retry
            .run("getAllTasks", || self.board.list_all_tasks(project_id))
            .map_err(|e| Error::Initialization(format!("cannot list board tasks: {e}")))?;
        Ok(TaskIndex::build(tasks))
    }

    /// Run one reconciliation pass.
    pub async fn run_pass(&self) -> Result<SyncReport> {
        let collected = self.collect()?;
        let index = Arc::new(self.load_index()?);
        let stamped_at = (self.clock)();

        info!(
            findings = collected.findings.len(),
            tasks = index.len(),
            "starting reconciliation"
        );

        let seen: HashSet<String> = collected.findings.iter().map(Finding::reference).collect();
        let orphans = find_orphans(&index, &seen, &collected.trusted);
        let groups = group_by_reference(collected.findings);

        let ctx = PassContext {
            board: Arc::clone(&self.board),
            index,
            columns: self.columns,
            retry: self.options.retry,
            policy: self.options.update_policy,
            project_id: self.options.project_id,
            stamped_at,
        };
        let outcomes = self.execute(ctx, groups).await;

        let mut stats = SyncStats {
            orphaned: orphans.len(),
            malformed: collected.malformed,
            ..Default::default()
        };
        for outcome in &outcomes {
            stats.record(&outcome.outcome);
        }
        let failures = outcomes
            .into_iter()
            .filter(|o| matches!(o.outcome, Outcome::Failed(_)))
            .collect();

        info!(
            created = stats.created,
            updated = stats.updated,
            resolved = stats.resolved,
            unchanged = stats.unchanged,
            errors = stats.errors,
            orphaned = stats.orphaned,
            malformed = stats.malformed,
            "pass complete"
        );

        Ok(SyncReport {
            stats,
            orphans,
            failures,
            failed_sources: collected.failed,
        })
    }

    /// Deal groups round-robin to a bounded set of blocking workers.
    async fn execute(
        &self,
        ctx: PassContext<B>,
        groups: Vec<ReferenceGroup>,
    ) -> Vec<FindingOutcome> {
        if groups.is_empty() {
            return Vec::new();
        }

        let workers = self.options.workers.max(1).min(groups.len());
        let mut shares: Vec<Vec<ReferenceGroup>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, group) in groups.into_iter().enumerate() {
            shares[i % workers].push(group);
        }

        let mut handles = Vec::with_capacity(workers);
        for share in shares {
            let references: Vec<String> = share
                .iter()
                .flat_map(|g| std::iter::repeat_n(g.reference.clone(), g.findings.len()))
                .collect();
            let ctx = ctx.clone();
            let handle = tokio::task::spawn_blocking(move || ctx.run_share(share));
            handles.push((references, handle));
        }

        let mut outcomes = Vec::new();
        for (references, handle) in handles {
            match handle.await {
                Ok(share_outcomes) => outcomes.extend(share_outcomes),
                Err(e) => {
                    let err = Error::Scheduler(format!("worker aborted: {e}"));
                    warn!(error = %err, findings = references.len(), "worker failed");
                    outcomes.extend(references.into_iter().map(|reference| FindingOutcome {
                        reference,
                        outcome: Outcome::Failed(err.to_string()),
                    }));
                }
            }
        }
        outcomes
    }

    /// Compute what a pass would do without writing to the board.
    pub fn plan(&self) -> Result<SyncPlan> {
        let collected = self.collect()?;
        let index = self.load_index()?;
        let stamped_at = (self.clock)();

        let seen: HashSet<String> = collected.findings.iter().map(Finding::reference).collect();
        let orphans = find_orphans(&index, &seen, &collected.trusted);

        let mut steps = Vec::new();
        for group in group_by_reference(collected.findings) {
            let mut current = index.get(&group.reference).cloned();
            for finding in &group.findings {
                let action = decide(current.as_ref(), finding, self.columns);
                let content = task_content(finding, stamped_at);
                current = match &action {
                    PlannedAction::Create { column_id } => Some(projected_task(
                        self.options.project_id,
                        0,
                        &group.reference,
                        &content,
                        *column_id,
                    )),
                    PlannedAction::Update { move_to, .. }
                    | PlannedAction::Resolve { move_to, .. } => current.map(|mut task| {
                        if let Some(column_id) = move_to {
                            task.column_id = *column_id;
                        }
                        task
                    }),
                };
                steps.push(PlannedStep {
                    reference: group.reference.clone(),
                    title: title_for(finding),
                    action,
                });
            }
        }

        Ok(SyncPlan {
            steps,
            orphans,
            malformed: collected.malformed,
            failed_sources: collected.failed,
        })
    }

    /// Compare source findings against the board. Requires every source to
    /// fetch, since a partial view would misreport missing tasks.
    pub fn status(&self) -> Result<StatusReport> {
        let collected = self.collect()?;
        if let Some(failure) = collected.failed.first() {
            return Err(Error::SourceFetch(format!(
                "{} source failed: {}",
                failure.origin, failure.error
            )));
        }
        let index = self.load_index()?;

        let origins: HashSet<Origin> = self.sources.iter().map(|s| s.origin()).collect();
        let on_board: HashSet<&str> = index
            .references()
            .filter(|r| Origin::of_reference(r).is_some_and(|o| origins.contains(&o)))
            .collect();
        let found: HashSet<String> = collected.findings.iter().map(Finding::reference).collect();

        let mut by_category = BTreeMap::new();
        for finding in &collected.findings {
            *by_category.entry(finding.category.to_string()).or_insert(0) += 1;
        }
        let resolved = collected.findings.iter().filter(|f| f.resolved).count();

        Ok(StatusReport {
            findings_total: collected.findings.len(),
            open: collected.findings.len() - resolved,
            resolved,
            by_category,
            board_tasks: on_board.len(),
            synchronized: found.iter().filter(|r| on_board.contains(r.as_str())).count(),
            missing_in_board: found.iter().filter(|r| !on_board.contains(r.as_str())).count(),
            orphaned_in_board: on_board.iter().filter(|r| !found.contains(**r)).count(),
        })
    }
}
