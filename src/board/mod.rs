pub mod kanboard;

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// A task as it currently exists on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: u64,
    pub project_id: u64,
    pub title: String,
    pub description: String,
    pub column_id: u64,
    pub swimlane_id: u64,
    pub color_id: String,
    pub reference: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub id: u64,
    pub title: String,
}

/// Fields sent when creating a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTask {
    pub project_id: u64,
    pub title: String,
    pub description: String,
    pub column_id: u64,
    pub color_id: String,
    pub reference: String,
}

/// Fields overwritten on an existing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskUpdate {
    pub title: String,
    pub description: String,
    pub color_id: String,
}

/// Capability interface over the destination kanban system.
pub trait BoardClient: Send + Sync {
    /// Check that the board answers; returns its version string.
    fn check_connection(&self) -> Result<String>;

    /// Name of the project, or an error if it does not exist.
    fn project_name(&self, project_id: u64) -> Result<String>;

    /// Columns in board order.
    fn get_columns(&self, project_id: u64) -> Result<Vec<Column>>;

    /// Every task of the project, open and closed.
    fn list_all_tasks(&self, project_id: u64) -> Result<Vec<Task>>;

    fn find_task_by_reference(&self, project_id: u64, reference: &str) -> Result<Option<Task>> {
        Ok(self
            .list_all_tasks(project_id)?
            .into_iter()
            .find(|t| t.reference == reference))
    }

    /// Create a task and return its id.
    fn create_task(&self, task: &NewTask) -> Result<u64>;

    fn update_task(&self, task_id: u64, update: &TaskUpdate) -> Result<()>;

    fn move_task(&self, project_id: u64, task_id: u64, column_id: u64) -> Result<()>;
}

impl<B: BoardClient + ?Sized> BoardClient for Arc<B> {
    fn check_connection(&self) -> Result<String> {
        (**self).check_connection()
    }

    fn project_name(&self, project_id: u64) -> Result<String> {
        (**self).project_name(project_id)
    }

    fn get_columns(&self, project_id: u64) -> Result<Vec<Column>> {
        (**self).get_columns(project_id)
    }

    fn list_all_tasks(&self, project_id: u64) -> Result<Vec<Task>> {
        (**self).list_all_tasks(project_id)
    }

    fn find_task_by_reference(&self, project_id: u64, reference: &str) -> Result<Option<Task>> {
        (**self).find_task_by_reference(project_id, reference)
    }

    fn create_task(&self, task: &NewTask) -> Result<u64> {
        (**self).create_task(task)
    }

    fn update_task(&self, task_id: u64, update: &TaskUpdate) -> Result<()> {
        (**self).update_task(task_id, update)
    }

    fn move_task(&self, project_id: u64, task_id: u64, column_id: u64) -> Result<()> {
        (**self).move_task(project_id, task_id, column_id)
    }
}

/// Column ids the engine writes to, resolved once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnTargets {
    pub target: u64,
    pub resolved: u64,
}

impl ColumnTargets {
    /// Resolve the named columns, falling back to the first column for
    /// `target` and the last for `resolved` when a name is absent.
    pub fn resolve(columns: &[Column], target: &str, resolved: &str) -> Result<Self> {
        let (Some(first), Some(last)) = (columns.first(), columns.last()) else {
            return Err(Error::Initialization(
                "board project has no columns".to_string(),
            ));
        };

        let find = |name: &str| columns.iter().find(|c| c.title == name).map(|c| c.id);

        let target_id = find(target).unwrap_or_else(|| {
            warn!(
                column = target,
                fallback = %first.title,
                "target column not found, using first column"
            );
            first.id
        });
        let resolved_id = find(resolved).unwrap_or_else(|| {
            warn!(
                column = resolved,
                fallback = %last.title,
                "resolved column not found, using last column"
            );
            last.id
        });

        Ok(Self {
            target: target_id,
            resolved: resolved_id,
        })
    }
}
