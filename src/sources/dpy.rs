use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::finding::{Category, Finding, Locator, Origin, Severity};
use crate::templates::{BodyKind, BodyTemplate};

use super::{FindingBatch, FindingSource};

pub const DEFAULT_PATTERN: &str = "*_smells.json";

#[derive(Serialize)]
struct SmellBody<'a> {
    smell: &'a str,
    file: &'a str,
    module: &'a str,
    class: &'a str,
    function: &'a str,
    line: &'a str,
    details: &'a str,
    source_file: &'a str,
}

/// Reads DPy `*_smells.json` reports from a directory.
pub struct DpySource {
    directory: PathBuf,
    pattern: String,
    template: BodyTemplate,
}

impl DpySource {
    pub fn new(config: &Config) -> Result<Self> {
        let dpy = config.dpy.as_ref().ok_or_else(|| {
            Error::ConfigValidation(
                "[dpy] config section required when source \"dpy\" is enabled".to_string(),
            )
        })?;
        Ok(Self::with_template(
            dpy.directory.clone(),
            dpy.pattern.clone(),
            BodyTemplate::load(BodyKind::DpySmell, config.template_dir.as_deref())?,
        ))
    }

    pub fn with_template(directory: PathBuf, pattern: String, template: BodyTemplate) -> Self {
        Self {
            directory,
            pattern,
            template,
        }
    }

    /// Report files matching the pattern, in path order.
    fn report_files(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.directory.join(&self.pattern);
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::SourceFetch(format!("invalid smell file pattern {pattern}: {e}")))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| Error::SourceFetch(format!("cannot read smell directory: {e}")))?;
            files.push(path);
        }
        files.sort();
        Ok(files)
    }

    fn read_report(path: &Path) -> Result<Vec<Value>> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::SourceFetch(format!("cannot read smell file {}: {e}", path.display()))
        })?;
        match serde_json::from_str(&contents) {
            Ok(Value::Array(entries)) => Ok(entries),
            Ok(_) => Err(Error::SourceFetch(format!(
                "smell file {} is not a JSON array",
                path.display()
            ))),
            Err(e) => Err(Error::SourceFetch(format!(
                "cannot parse smell file {}: {e}",
                path.display()
            ))),
        }
    }

    fn normalize(&self, entry: &Value, source_file: &Path) -> Result<Finding> {
        let source_name = source_file.display().to_string();
        let obj = entry.as_object().ok_or_else(|| {
            Error::MalformedFinding(format!("non-object entry in {source_name}"))
        })?;

        let file = required_text(obj, "File", &source_name)?;
        let line = required_text(obj, "Line no", &source_name)?;
        let smell = required_text(obj, "Smell", &source_name)?;
        let function = optional_text(obj, "Function/Method");

        let basename = basename(&file);
        let body = self.template.render(&SmellBody {
            smell: &smell,
            file: &file,
            module: &optional_text(obj, "Module"),
            class: &optional_text(obj, "Class"),
            function: &function,
            line: &line,
            details: &optional_text(obj, "Details"),
            source_file: &source_name,
        })?;

        let severity = if smell.contains("Complex") {
            Severity::Minor
        } else {
            Severity::Major
        };

        Ok(Finding {
            origin: Origin::CodeSmell,
            identity: format!("{basename}-{line}-{smell}"),
            title: format!("{function} in {basename}"),
            category: Category::Smell(smell),
            severity,
            body,
            locator: Some(Locator {
                file,
                line: Some(line),
            }),
            resolved: false,
        })
    }
}

impl FindingSource for DpySource {
    fn origin(&self) -> Origin {
        Origin::CodeSmell
    }

    fn fetch(&self) -> Result<FindingBatch> {
        let files = self.report_files()?;
        if files.is_empty() {
            warn!(
                directory = %self.directory.display(),
                pattern = %self.pattern,
                "no smell files found"
            );
        }

        let mut batch = FindingBatch::default();
        for path in &files {
            let entries = Self::read_report(path)?;
            debug!(file = %path.display(), entries = entries.len(), "loaded smell file");
            for entry in &entries {
                match self.normalize(entry, path) {
                    Ok(finding) => batch.findings.push(finding),
                    Err(e) => {
                        warn!(error = %e, "skipping malformed smell entry");
                        batch.malformed += 1;
                    }
                }
            }
        }
        info!(
            files = files.len(),
            findings = batch.findings.len(),
            malformed = batch.malformed,
            "DPy fetch complete"
        );
        Ok(batch)
    }
}

/// Text of a JSON scalar; numbers are accepted where reports mix types.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_text(obj: &Map<String, Value>, key: &str, source: &str) -> Result<String> {
    obj.get(key)
        .and_then(scalar_text)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MalformedFinding(format!("entry in {source} missing `{key}`")))
}

fn optional_text(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key).and_then(scalar_text).unwrap_or_default()
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
