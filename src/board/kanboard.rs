use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

use super::{BoardClient, Column, NewTask, Task, TaskUpdate};

const JSONRPC_VERSION: &str = "2.0";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_ACTIVE: u8 = 1;
const STATUS_INACTIVE: u8 = 0;

// ---------------------------------------------------------------------------
// Transport abstraction (for testability)
// ---------------------------------------------------------------------------

/// One JSON-RPC round trip: method + params in, `result` out.
pub trait RpcTransport: Send + Sync {
    fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    id: u64,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl RpcResponse {
    fn into_result(self, method: &str) -> Result<serde_json::Value> {
        match self.error {
            Some(err) => Err(classify_rpc_error(method, &err)),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Kanboard surfaces SQLite contention as an RPC error; that one is worth retrying.
fn classify_rpc_error(method: &str, err: &RpcError) -> Error {
    let data = err.data.as_ref().map(|d| d.to_string()).unwrap_or_default();
    let text = format!("{method}: {} (code {}) {data}", err.message, err.code);
    let lower = text.to_lowercase();
    if lower.contains("locked") {
        Error::BoardTransient(text.trim_end().to_string())
    } else {
        Error::BoardPermanent(text.trim_end().to_string())
    }
}

/// Rate limits, server errors, and network failures are transient.
fn classify_http_error(method: &str, err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, _) if code == 429 || code >= 500 => {
            Error::BoardTransient(format!("{method}: HTTP {code}"))
        }
        ureq::Error::Status(code, _) => Error::BoardPermanent(format!("{method}: HTTP {code}")),
        ureq::Error::Transport(t) => Error::BoardTransient(format!("{method}: {t}")),
    }
}

struct HttpTransport {
    agent: ureq::Agent,
    url: String,
    authorization: String,
    next_id: AtomicU64,
}

impl HttpTransport {
    fn new(url: &str, token: &str) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
            url: url.to_string(),
            authorization: format!("Basic {}", STANDARD.encode(format!("jsonrpc:{token}"))),
            next_id: AtomicU64::new(1),
        }
    }
}

impl RpcTransport for HttpTransport {
    fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let request = RpcRequest {
            jsonrpc: JSONRPC_VERSION,
            method,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            params,
        };

        let response = self
            .agent
            .post(&self.url)
            .set("Authorization", &self.authorization)
            .set("Content-Type", "application/json")
            .send_json(&request)
            .map_err(|e| classify_http_error(method, e))?;

        let reply: RpcResponse = response.into_json().map_err(|e| {
            Error::BoardPermanent(format!("{method}: failed to parse Kanboard response: {e}"))
        })?;

        reply.into_result(method)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Kanboard serializes most integers as strings; accept either.
fn de_id<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Num(u64),
        Text(String),
    }

    match IdRepr::deserialize(deserializer)? {
        IdRepr::Num(n) => Ok(n),
        IdRepr::Text(s) if s.is_empty() => Ok(0),
        IdRepr::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Serialize)]
struct ProjectParams {
    project_id: u64,
}

#[derive(Serialize)]
struct AllTasksParams {
    project_id: u64,
    status_id: u8,
}

#[derive(Serialize)]
struct TaskIdParams {
    task_id: u64,
}

#[derive(Serialize)]
struct UpdateTaskParams<'a> {
    id: u64,
    #[serde(flatten)]
    fields: &'a TaskUpdate,
}

#[derive(Serialize)]
struct MoveTaskParams {
    project_id: u64,
    task_id: u64,
    column_id: u64,
    position: u32,
    swimlane_id: u64,
}

#[derive(Debug, Deserialize)]
struct KbProject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct KbColumn {
    #[serde(deserialize_with = "de_id")]
    id: u64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct KbTask {
    #[serde(deserialize_with = "de_id")]
    id: u64,
    #[serde(deserialize_with = "de_id")]
    project_id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(deserialize_with = "de_id")]
    column_id: u64,
    #[serde(default, deserialize_with = "de_id")]
    swimlane_id: u64,
    #[serde(default)]
    color_id: Option<String>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default = "default_active", deserialize_with = "de_id")]
    is_active: u64,
}

fn default_active() -> u64 {
    1
}

impl From<KbTask> for Task {
    fn from(t: KbTask) -> Self {
        Task {
            id: t.id,
            project_id: t.project_id,
            title: t.title,
            description: t.description.unwrap_or_default(),
            column_id: t.column_id,
            swimlane_id: t.swimlane_id,
            color_id: t.color_id.unwrap_or_default(),
            reference: t.reference.unwrap_or_default(),
            is_active: t.is_active != 0,
        }
    }
}

// ---------------------------------------------------------------------------
// KanboardClient
// ---------------------------------------------------------------------------

pub struct KanboardClient {
    transport: Box<dyn RpcTransport>,
}

impl KanboardClient {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            transport: Box::new(HttpTransport::new(url, token)),
        }
    }

    pub fn with_transport(transport: Box<dyn RpcTransport>) -> Self {
        Self { transport }
    }

    fn call<P, T>(&self, method: &str, params: P) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| Error::BoardPermanent(format!("{method}: invalid params: {e}")))?;
        let value = self.transport.call(method, params)?;
        serde_json::from_value(value)
            .map_err(|e| Error::BoardPermanent(format!("unexpected {method} response: {e}")))
    }

    /// Kanboard answers `false` instead of an error when it rejects a write.
    fn call_bool<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let value: serde_json::Value = self.call(method, params)?;
        match value {
            serde_json::Value::Bool(true) => Ok(()),
            other => Err(Error::BoardPermanent(format!(
                "{method} rejected by Kanboard (returned {other})"
            ))),
        }
    }

    fn fetch_tasks(&self, project_id: u64, status_id: u8) -> Result<Vec<Task>> {
        let tasks: Option<Vec<KbTask>> = self.call(
            "getAllTasks",
            AllTasksParams {
                project_id,
                status_id,
            },
        )?;
        Ok(tasks.unwrap_or_default().into_iter().map(Task::from).collect())
    }

    fn get_task(&self, task_id: u64) -> Result<Task> {
        let task: Option<KbTask> = self.call("getTask", TaskIdParams { task_id })?;
        task.map(Task::from)
            .ok_or_else(|| Error::BoardPermanent(format!("task {task_id} not found")))
    }
}

impl BoardClient for KanboardClient {
    fn check_connection(&self) -> Result<String> {
        let version: String = self.call("getVersion", serde_json::json!({}))?;
        debug!(version, "connected to Kanboard");
        Ok(version)
    }

    fn project_name(&self, project_id: u64) -> Result<String> {
        // Unknown projects come back as `null` or `false`.
        let value: serde_json::Value = self.call("getProjectById", ProjectParams { project_id })?;
        serde_json::from_value::<KbProject>(value)
            .map(|p| p.name)
            .map_err(|_| Error::BoardPermanent(format!("project {project_id} not found")))
    }

    fn get_columns(&self, project_id: u64) -> Result<Vec<Column>> {
        let columns: Option<Vec<KbColumn>> =
            self.call("getColumns", ProjectParams { project_id })?;
        Ok(columns
            .unwrap_or_default()
            .into_iter()
            .map(|c| Column {
                id: c.id,
                title: c.title,
            })
            .collect())
    }

    fn list_all_tasks(&self, project_id: u64) -> Result<Vec<Task>> {
        let mut tasks = self.fetch_tasks(project_id, STATUS_ACTIVE)?;
        tasks.extend(self.fetch_tasks(project_id, STATUS_INACTIVE)?);
        debug!(count = tasks.len(), project_id, "fetched Kanboard tasks");
        Ok(tasks)
    }

    fn create_task(&self, task: &NewTask) -> Result<u64> {
        let value: serde_json::Value = self.call("createTask", task)?;
        match value.as_u64() {
            Some(id) if id > 0 => Ok(id),
            _ => Err(Error::BoardPermanent(format!(
                "createTask rejected by Kanboard for {} (returned {value})",
                task.reference
            ))),
        }
    }

    fn update_task(&self, task_id: u64, update: &TaskUpdate) -> Result<()> {
        self.call_bool(
            "updateTask",
            UpdateTaskParams {
                id: task_id,
                fields: update,
            },
        )
    }

    fn move_task(&self, project_id: u64, task_id: u64, column_id: u64) -> Result<()> {
        let task = self.get_task(task_id)?;
        self.call_bool(
            "moveTaskPosition",
            MoveTaskParams {
                project_id,
                task_id,
                column_id,
                position: 1,
                swimlane_id: task.swimlane_id,
            },
        )
    }
}
