use std::thread;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, resolve_token};
use crate::error::{Error, Result};
use crate::finding::{Category, Finding, Locator, Origin, Severity};
use crate::templates::{BodyKind, BodyTemplate};

use super::{FindingBatch, FindingSource};

const SEARCH_PATH: &str = "/api/issues/search";
const FACETS: &str = "types,severities,resolutions";
const PAGE_SIZE: usize = 500;
/// SonarQube refuses to page past this many results.
const RESULT_WINDOW: usize = 10_000;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Client abstraction (for testability)
// ---------------------------------------------------------------------------

pub trait SonarClient: Send + Sync {
    /// GET `path` with `query` and return the decoded JSON body.
    fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value>;
}

struct DefaultSonarClient {
    agent: ureq::Agent,
    base_url: String,
    authorization: Option<String>,
}

impl DefaultSonarClient {
    fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            // The token is the basic-auth user, with an empty password.
            authorization: token.map(|t| format!("Basic {}", STANDARD.encode(format!("{t}:")))),
        }
    }
}

impl SonarClient for DefaultSonarClient {
    fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);

        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut attempt = 1;
        loop {
            let mut request = self.agent.get(&url);
            for (key, value) in query {
                request = request.query(key, value);
            }
            if let Some(auth) = &self.authorization {
                request = request.set("Authorization", auth);
            }

            match request.call() {
                Ok(response) => {
                    return response.into_json().map_err(|e| {
                        Error::SourceFetch(format!("failed to parse SonarQube response: {e}"))
                    });
                }
                Err(ref e) if attempt < MAX_RETRIES && is_retryable(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        backoff_ms,
                        "retrying SonarQube API after transient error"
                    );
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::SourceFetch(format!(
                        "SonarQube request failed: {e}"
                    )));
                }
            }
        }
    }
}

/// Only retry rate-limits (429), server errors (5xx), and transport errors.
fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Raw issue records
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawIssue {
    key: Option<String>,
    #[serde(rename = "type")]
    issue_type: Option<String>,
    severity: Option<String>,
    component: Option<String>,
    message: Option<String>,
    line: Option<u64>,
    rule: Option<String>,
    debt: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    resolution: Option<String>,
}

#[derive(Serialize)]
struct IssueBody<'a> {
    category: String,
    key: &'a str,
    rule: &'a str,
    severity: String,
    file: &'a str,
    message: &'a str,
    line: Option<u64>,
    debt: Option<&'a str>,
    tags: Option<String>,
}

fn required<'a>(field: &'a Option<String>, name: &str, key: &str) -> Result<&'a str> {
    field
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::MalformedFinding(format!("issue {key}: missing `{name}`")))
}

// ---------------------------------------------------------------------------
// SonarQubeSource
// ---------------------------------------------------------------------------

pub struct SonarQubeSource {
    project_key: String,
    include_resolved: bool,
    template: BodyTemplate,
    client: Box<dyn SonarClient>,
}

impl SonarQubeSource {
    pub fn new(config: &Config) -> Result<Self> {
        let sonar = config.sonarqube.as_ref().ok_or_else(|| {
            Error::ConfigValidation(
                "[sonarqube] config section required when source \"sonarqube\" is enabled"
                    .to_string(),
            )
        })?;

        let token = resolve_token(&sonar.token_env);
        if token.is_none() {
            warn!(
                env = %sonar.token_env,
                "no SonarQube token set, querying anonymously"
            );
        }

        Ok(Self {
            project_key: sonar.project_key.clone(),
            include_resolved: sonar.include_resolved,
            template: BodyTemplate::load(BodyKind::SonarIssue, config.template_dir.as_deref())?,
            client: Box::new(DefaultSonarClient::new(&sonar.url, token.as_deref())),
        })
    }

    #[cfg(test)]
    fn with_client(project_key: &str, include_resolved: bool, client: Box<dyn SonarClient>) -> Self {
        Self {
            project_key: project_key.to_string(),
            include_resolved,
            template: BodyTemplate::load(BodyKind::SonarIssue, None)
                .expect("default template compiles"),
            client,
        }
    }

    /// Page through the search endpoint and return the raw records, plus
    /// whether the result window cut the listing short.
    fn fetch_raw(&self) -> Result<(Vec<Value>, bool)> {
        let mut records = Vec::new();
        let mut truncated = false;
        let mut total: Option<usize> = None;
        let mut page = 1usize;

        loop {
            let mut query = vec![
                ("componentKeys", self.project_key.clone()),
                ("ps", PAGE_SIZE.to_string()),
                ("p", page.to_string()),
                ("facets", FACETS.to_string()),
            ];
            if !self.include_resolved {
                query.push(("resolved", "false".to_string()));
            }

            let mut data = self.client.get_json(SEARCH_PATH, &query)?;
            let issues = match data.get_mut("issues").map(Value::take) {
                Some(Value::Array(issues)) => issues,
                None | Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(Error::SourceFetch(format!(
                        "unexpected `issues` value on page {page}: {other}"
                    )));
                }
            };

            let total = *total.get_or_insert_with(|| {
                let total = data
                    .pointer("/paging/total")
                    .or_else(|| data.get("total"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                info!(project = %self.project_key, total, "found SonarQube issues");
                total
            });

            if issues.is_empty() {
                break;
            }
            debug!(page, count = issues.len(), "fetched SonarQube page");
            records.extend(issues);

            if records.len() >= total {
                break;
            }
            if page * PAGE_SIZE >= RESULT_WINDOW {
                warn!(
                    fetched = records.len(),
                    total, "SonarQube result window reached, remaining issues not fetched"
                );
                truncated = true;
                break;
            }
            page += 1;
        }

        Ok((records, truncated))
    }

    /// Normalize one raw record. `Ok(None)` means an issue type this
    /// integration does not track.
    fn normalize(&self, record: Value) -> Result<Option<Finding>> {
        let raw: RawIssue = serde_json::from_value(record)
            .map_err(|e| Error::MalformedFinding(format!("unreadable issue record: {e}")))?;

        let key = raw
            .key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::MalformedFinding("issue without `key`".to_string()))?;
        let issue_type = required(&raw.issue_type, "type", key)?;
        let severity_label = required(&raw.severity, "severity", key)?;
        let component = required(&raw.component, "component", key)?;
        let message = required(&raw.message, "message", key)?;

        let Some(category) = Category::from_issue_type(issue_type) else {
            debug!(key, issue_type, "skipping untracked SonarQube issue type");
            return Ok(None);
        };
        let severity = Severity::parse(severity_label).ok_or_else(|| {
            Error::MalformedFinding(format!("issue {key}: unknown severity `{severity_label}`"))
        })?;

        let prefix = format!("{}:", self.project_key);
        let file = component.strip_prefix(&prefix).unwrap_or(component);
        let line = raw.line.filter(|&l| l > 0);

        let body = self.template.render(&IssueBody {
            category: category.to_string(),
            key,
            rule: raw.rule.as_deref().unwrap_or("Unknown Rule"),
            severity: severity.to_string(),
            file,
            message,
            line,
            debt: raw.debt.as_deref().filter(|d| !d.is_empty()),
            tags: (!raw.tags.is_empty()).then(|| raw.tags.join(", ")),
        })?;

        Ok(Some(Finding {
            origin: Origin::StaticAnalysis,
            identity: key.to_string(),
            category,
            severity,
            title: message.to_string(),
            body,
            locator: Some(Locator {
                file: file.to_string(),
                line: line.map(|l| l.to_string()),
            }),
            resolved: raw.resolution.is_some(),
        }))
    }
}

impl FindingSource for SonarQubeSource {
    fn origin(&self) -> Origin {
        Origin::StaticAnalysis
    }

    fn fetch(&self) -> Result<FindingBatch> {
        let (records, truncated) = self.fetch_raw()?;
        let mut batch = FindingBatch {
            truncated,
            ..Default::default()
        };
        for record in records {
            match self.normalize(record) {
                Ok(Some(finding)) => batch.findings.push(finding),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "skipping malformed SonarQube issue");
                    batch.malformed += 1;
                }
            }
        }
        info!(
            findings = batch.findings.len(),
            malformed = batch.malformed,
            truncated,
            "SonarQube fetch complete"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type QueryLog = Arc<Mutex<Vec<Vec<(String, String)>>>>;

    struct MockSonarClient {
        pages: Mutex<Vec<Result<Value>>>,
        queries: QueryLog,
    }

    impl SonarClient for MockSonarClient {
        fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
            assert_eq!(path, SEARCH_PATH);
            self.queries.lock().unwrap().push(
                query
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            );
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(json!({"issues": [], "paging": {"total": 0}}))
            } else {
                pages.remove(0)
            }
        }
    }

    fn source(pages: Vec<Result<Value>>, include_resolved: bool) -> (SonarQubeSource, QueryLog) {
        let queries: QueryLog = Arc::default();
        let client = MockSonarClient {
            pages: Mutex::new(pages),
            queries: Arc::clone(&queries),
        };
        (
            SonarQubeSource::with_client("proj", include_resolved, Box::new(client)),
            queries,
        )
    }

    fn issue(key: &str, issue_type: &str) -> Value {
        json!({
            "key": key,
            "type": issue_type,
            "severity": "MAJOR",
            "component": "proj:src/app.py",
            "message": "Remove this unused import",
            "rule": "python:S1128",
            "line": 12,
        })
    }

    fn param(query: &[(String, String)], name: &str) -> Option<String> {
        query.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn test_normalizes_issue() {
        let mut record = issue("AX-1", "BUG");
        record["tags"] = json!(["unused", "clumsy"]);
        record["debt"] = json!("5min");
        let (src, _) = source(vec![Ok(json!({"issues": [record], "paging": {"total": 1}}))], true);

        let batch = src.fetch().unwrap();
        assert_eq!(batch.malformed, 0);
        let f = &batch.findings[0];
        assert_eq!(f.reference(), "sonar-AX-1");
        assert_eq!(f.category, Category::Reliability);
        assert_eq!(f.severity, Severity::Major);
        assert_eq!(f.title, "Remove this unused import");
        assert!(!f.resolved);
        assert_eq!(
            f.locator,
            Some(Locator {
                file: "src/app.py".to_string(),
                line: Some("12".to_string()),
            })
        );
        assert!(f.body.starts_with("**SonarQube Issue Integration**"));
        assert!(f.body.contains("**Rule:** python:S1128"));
        assert!(f.body.contains("**File:** src/app.py"));
        assert!(f.body.contains("**Line:** 12"));
        assert!(f.body.contains("**Technical Debt:** 5min"));
        assert!(f.body.contains("**Tags:** unused, clumsy"));
    }

    #[test]
    fn test_optional_fields_omitted_from_body() {
        let mut record = issue("AX-2", "CODE_SMELL");
        record.as_object_mut().unwrap().remove("line");
        record.as_object_mut().unwrap().remove("rule");
        let (src, _) = source(vec![Ok(json!({"issues": [record], "total": 1}))], true);

        let f = &src.fetch().unwrap().findings[0];
        assert!(f.body.contains("**Rule:** Unknown Rule"));
        assert!(!f.body.contains("**Line:**"));
        assert!(!f.body.contains("**Tags:**"));
        assert!(!f.body.contains("**Technical Debt:**"));
        assert_eq!(f.locator.as_ref().unwrap().line, None);
    }

    #[test]
    fn test_resolution_marks_resolved() {
        let mut record = issue("AX-3", "VULNERABILITY");
        record["resolution"] = json!("FIXED");
        let (src, _) = source(vec![Ok(json!({"issues": [record], "total": 1}))], true);

        let f = &src.fetch().unwrap().findings[0];
        assert!(f.resolved);
        assert_eq!(f.category, Category::Security);
    }

    #[test]
    fn test_hotspots_skipped_not_malformed() {
        let (src, _) = source(
            vec![Ok(json!({
                "issues": [issue("H-1", "SECURITY_HOTSPOT"), issue("AX-4", "BUG")],
                "total": 2
            }))],
            true,
        );
        let batch = src.fetch().unwrap();
        assert_eq!(batch.findings.len(), 1);
        assert_eq!(batch.malformed, 0);
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let mut no_message = issue("AX-5", "BUG");
        no_message.as_object_mut().unwrap().remove("message");
        let mut bad_severity = issue("AX-6", "BUG");
        bad_severity["severity"] = json!("URGENT");
        let no_key = json!({"type": "BUG", "severity": "MINOR"});

        let (src, _) = source(
            vec![Ok(json!({
                "issues": [no_message, bad_severity, no_key, issue("AX-7", "BUG")],
                "total": 4
            }))],
            true,
        );
        let batch = src.fetch().unwrap();
        assert_eq!(batch.malformed, 3);
        assert_eq!(batch.findings.len(), 1);
        assert_eq!(batch.findings[0].identity, "AX-7");
    }

    #[test]
    fn test_pages_until_total() {
        let (src, queries) = source(
            vec![
                Ok(json!({"issues": [issue("A", "BUG"), issue("B", "BUG")], "paging": {"total": 3}})),
                Ok(json!({"issues": [issue("C", "BUG")], "paging": {"total": 3}})),
            ],
            true,
        );
        let batch = src.fetch().unwrap();
        assert_eq!(batch.findings.len(), 3);
        assert!(!batch.truncated);

        let queries = queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(param(&queries[0], "p").as_deref(), Some("1"));
        assert_eq!(param(&queries[1], "p").as_deref(), Some("2"));
        assert_eq!(param(&queries[0], "ps").as_deref(), Some("500"));
        assert_eq!(param(&queries[0], "componentKeys").as_deref(), Some("proj"));
        assert_eq!(param(&queries[0], "resolved"), None);
    }

    #[test]
    fn test_stops_on_empty_page() {
        let (src, queries) = source(
            vec![
                Ok(json!({"issues": [issue("A", "BUG")], "total": 50})),
                Ok(json!({"issues": [], "total": 50})),
            ],
            true,
        );
        assert_eq!(src.fetch().unwrap().findings.len(), 1);
        assert_eq!(queries.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_result_window_marks_batch_truncated() {
        let pages = (0..25)
            .map(|p| {
                let issues: Vec<Value> = (0..PAGE_SIZE)
                    .map(|i| issue(&format!("H{p}-{i}"), "SECURITY_HOTSPOT"))
                    .collect();
                Ok(json!({"issues": issues, "paging": {"total": 12_500}}))
            })
            .collect();
        let (src, queries) = source(pages, true);

        let batch = src.fetch().unwrap();
        assert!(batch.truncated);
        assert_eq!(queries.lock().unwrap().len(), RESULT_WINDOW / PAGE_SIZE);
    }

    #[test]
    fn test_excluding_resolved_sets_filter() {
        let (src, queries) = source(vec![], false);
        src.fetch().unwrap();
        let queries = queries.lock().unwrap();
        assert_eq!(param(&queries[0], "resolved").as_deref(), Some("false"));
    }

    #[test]
    fn test_fetch_error_propagates() {
        let (src, _) = source(
            vec![Err(Error::SourceFetch("connection refused".to_string()))],
            true,
        );
        let err = src.fetch().unwrap_err();
        assert!(matches!(err, Error::SourceFetch(_)));
    }

    #[test]
    fn test_non_array_issues_is_fetch_error() {
        let (src, _) = source(vec![Ok(json!({"issues": "nope"}))], true);
        assert!(matches!(src.fetch().unwrap_err(), Error::SourceFetch(_)));
    }

    #[test]
    fn test_is_retryable() {
        let too_many = ureq::Error::Status(429, ureq::Response::new(429, "Too Many", "").unwrap());
        let server = ureq::Error::Status(503, ureq::Response::new(503, "Unavailable", "").unwrap());
        let forbidden = ureq::Error::Status(403, ureq::Response::new(403, "Forbidden", "").unwrap());
        assert!(is_retryable(&too_many));
        assert!(is_retryable(&server));
        assert!(!is_retryable(&forbidden));
    }
}
