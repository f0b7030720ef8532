#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};

use kanbridge::board::{BoardClient, Column, NewTask, Task, TaskUpdate};
use kanbridge::engine::{EngineOptions, Reconciler};
use kanbridge::error::{Error, Result};
use kanbridge::finding::{Category, Finding, Locator, Origin, Severity};
use kanbridge::retry::RetryPolicy;
use kanbridge::sources::{FindingBatch, FindingSource};

pub const PROJECT_ID: u64 = 1;

// --- In-memory board ---

#[derive(Default)]
pub struct BoardState {
    pub tasks: Vec<Task>,
    pub columns: Vec<Column>,
    pub next_id: u64,
    pub calls: Vec<String>,
    /// Method name -> transient failures still to inject.
    pub transient: HashMap<String, u32>,
    pub reject_create: HashSet<String>,
    pub panic_on_create: HashSet<String>,
    pub fail_listing: bool,
}

/// A board that keeps tasks in memory and records every call.
pub struct InMemoryBoard {
    state: Mutex<BoardState>,
}

impl InMemoryBoard {
    pub fn new(columns: &[(&str, u64)]) -> Self {
        let columns = columns
            .iter()
            .map(|(title, id)| Column {
                id: *id,
                title: title.to_string(),
            })
            .collect();
        Self {
            state: Mutex::new(BoardState {
                columns,
                next_id: 100,
                ..Default::default()
            }),
        }
    }

    /// The usual two-column board: Pending = 1, Done = 2.
    pub fn standard() -> Self {
        Self::new(&[("Pending", 1), ("Done", 2)])
    }

    pub fn with_tasks(self, tasks: Vec<Task>) -> Self {
        self.state().tasks = tasks;
        self
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        // A worker may panic on purpose; keep the board usable afterwards.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inject_transient(&self, method: &str, count: u32) {
        self.state().transient.insert(method.to_string(), count);
    }

    pub fn reject_create(&self, reference: &str) {
        self.state().reject_create.insert(reference.to_string());
    }

    pub fn panic_on_create(&self, reference: &str) {
        self.state().panic_on_create.insert(reference.to_string());
    }

    pub fn fail_listing(&self) {
        self.state().fail_listing = true;
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state().tasks.clone()
    }

    pub fn task(&self, reference: &str) -> Option<Task> {
        self.state()
            .tasks
            .iter()
            .find(|t| t.reference == reference)
            .cloned()
    }

    pub fn edit_task(&self, reference: &str, edit: impl FnOnce(&mut Task)) {
        let mut state = self.state();
        if let Some(task) = state.tasks.iter_mut().find(|t| t.reference == reference) {
            edit(task);
        }
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == method).count()
    }

    fn record(&self, method: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(method.to_string());
        if let Some(remaining) = state.transient.get_mut(method)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::BoardTransient(format!(
                "{method}: SQLSTATE[HY000]: database is locked"
            )));
        }
        Ok(())
    }
}

impl BoardClient for InMemoryBoard {
    fn check_connection(&self) -> Result<String> {
        self.record("getVersion")?;
        Ok("1.2.30".to_string())
    }

    fn project_name(&self, project_id: u64) -> Result<String> {
        self.record("getProjectById")?;
        if project_id == PROJECT_ID {
            Ok("Code Quality".to_string())
        } else {
            Err(Error::BoardPermanent(format!(
                "project {project_id} not found"
            )))
        }
    }

    fn get_columns(&self, _project_id: u64) -> Result<Vec<Column>> {
        self.record("getColumns")?;
        Ok(self.state().columns.clone())
    }

    fn list_all_tasks(&self, _project_id: u64) -> Result<Vec<Task>> {
        self.record("getAllTasks")?;
        let state = self.state();
        if state.fail_listing {
            return Err(Error::BoardPermanent("getAllTasks: access denied".to_string()));
        }
        Ok(state.tasks.clone())
    }

    fn create_task(&self, task: &NewTask) -> Result<u64> {
        self.record("createTask")?;
        let mut state = self.state();
        if state.panic_on_create.contains(&task.reference) {
            drop(state);
            panic!("board exploded on {}", task.reference);
        }
        if state.reject_create.contains(&task.reference) {
            return Err(Error::BoardPermanent("createTask returned false".to_string()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.tasks.push(Task {
            id,
            project_id: task.project_id,
            title: task.title.clone(),
            description: task.description.clone(),
            column_id: task.column_id,
            swimlane_id: 1,
            color_id: task.color_id.clone(),
            reference: task.reference.clone(),
            is_active: true,
        });
        Ok(id)
    }

    fn update_task(&self, task_id: u64, update: &TaskUpdate) -> Result<()> {
        self.record("updateTask")?;
        let mut state = self.state();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| Error::BoardPermanent(format!("task {task_id} not found")))?;
        task.title = update.title.clone();
        task.description = update.description.clone();
        task.color_id = update.color_id.clone();
        Ok(())
    }

    fn move_task(&self, _project_id: u64, task_id: u64, column_id: u64) -> Result<()> {
        self.record("moveTaskPosition")?;
        let mut state = self.state();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| Error::BoardPermanent(format!("task {task_id} not found")))?;
        task.column_id = column_id;
        Ok(())
    }
}

// --- Scriptable source ---

#[derive(Default)]
struct SourceState {
    findings: Vec<Finding>,
    malformed: usize,
    truncated: bool,
    failure: Option<String>,
    fetches: usize,
}

/// A source whose output tests can change between passes. Clones share state.
#[derive(Clone)]
pub struct MockSource {
    origin: Origin,
    state: Arc<Mutex<SourceState>>,
}

impl MockSource {
    pub fn new(origin: Origin, findings: Vec<Finding>) -> Self {
        Self {
            origin,
            state: Arc::new(Mutex::new(SourceState {
                findings,
                ..Default::default()
            })),
        }
    }

    pub fn set_findings(&self, findings: Vec<Finding>) {
        self.state.lock().unwrap().findings = findings;
    }

    pub fn set_malformed(&self, malformed: usize) {
        self.state.lock().unwrap().malformed = malformed;
    }

    pub fn set_truncated(&self, truncated: bool) {
        self.state.lock().unwrap().truncated = truncated;
    }

    pub fn fail_with(&self, message: &str) {
        self.state.lock().unwrap().failure = Some(message.to_string());
    }

    pub fn recover(&self) {
        self.state.lock().unwrap().failure = None;
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }
}

impl FindingSource for MockSource {
    fn origin(&self) -> Origin {
        self.origin
    }

    fn fetch(&self) -> Result<FindingBatch> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        if let Some(ref message) = state.failure {
            return Err(Error::SourceFetch(message.clone()));
        }
        Ok(FindingBatch {
            findings: state.findings.clone(),
            malformed: state.malformed,
            truncated: state.truncated,
        })
    }
}

// --- Findings ---

pub fn sonar_issue(key: &str, category: Category, severity: Severity, resolved: bool) -> Finding {
    Finding {
        origin: Origin::StaticAnalysis,
        identity: key.to_string(),
        category,
        severity,
        title: format!("Issue {key}"),
        body: format!("**SonarQube Issue Integration**\n\n**Issue Key:** {key}"),
        locator: Some(Locator {
            file: "src/app.py".to_string(),
            line: Some("10".to_string()),
        }),
        resolved,
    }
}

pub fn open_bug(key: &str) -> Finding {
    sonar_issue(key, Category::Reliability, Severity::Major, false)
}

pub fn resolved_bug(key: &str) -> Finding {
    sonar_issue(key, Category::Reliability, Severity::Major, true)
}

pub fn smell(file: &str, line: &str, name: &str, function: &str) -> Finding {
    Finding {
        origin: Origin::CodeSmell,
        identity: format!("{file}-{line}-{name}"),
        category: Category::Smell(name.to_string()),
        severity: if name.contains("Complex") {
            Severity::Minor
        } else {
            Severity::Major
        },
        title: format!("{function} in {file}"),
        body: format!("**DPy Code Smell Integration**\n\n**Smell:** {name}"),
        locator: Some(Locator {
            file: file.to_string(),
            line: Some(line.to_string()),
        }),
        resolved: false,
    }
}

pub fn board_task(id: u64, reference: &str, column_id: u64) -> Task {
    Task {
        id,
        project_id: PROJECT_ID,
        title: format!("existing {reference}"),
        description: "old".to_string(),
        column_id,
        swimlane_id: 1,
        color_id: "grey".to_string(),
        reference: reference.to_string(),
        is_active: true,
    }
}

// --- Engine wiring ---

pub fn first_pass_clock() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap()
}

pub fn later_pass_clock() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(12, 30, 0))
        .unwrap()
}

/// Options with no retry pause so transient-failure tests run instantly.
pub fn test_options(workers: usize) -> EngineOptions {
    EngineOptions {
        workers,
        retry: RetryPolicy::new(3, Duration::ZERO),
        ..EngineOptions::new(PROJECT_ID)
    }
}

pub fn reconciler(
    sources: Vec<MockSource>,
    board: &Arc<InMemoryBoard>,
    options: EngineOptions,
) -> Reconciler<MockSource, InMemoryBoard> {
    Reconciler::initialize(sources, Arc::clone(board), options)
        .unwrap()
        .with_clock(first_pass_clock)
}
