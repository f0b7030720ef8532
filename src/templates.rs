use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

const DEFAULT_SONAR_ISSUE: &str = include_str!("default_templates/sonar-issue.md");
const DEFAULT_DPY_SMELL: &str = include_str!("default_templates/dpy-smell.md");

/// Which finding body a template renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    SonarIssue,
    DpySmell,
}

impl BodyKind {
    fn file_name(self) -> &'static str {
        match self {
            BodyKind::SonarIssue => "sonar-issue.md",
            BodyKind::DpySmell => "dpy-smell.md",
        }
    }

    fn default_source(self) -> &'static str {
        match self {
            BodyKind::SonarIssue => DEFAULT_SONAR_ISSUE,
            BodyKind::DpySmell => DEFAULT_DPY_SMELL,
        }
    }
}

/// A compiled body template with its engine.
pub struct BodyTemplate {
    kind: BodyKind,
    engine: upon::Engine<'static>,
    template: upon::Template<'static>,
}

impl BodyTemplate {
    /// Load the template for `kind`. A file of the same name in `override_dir`
    /// takes precedence over the embedded default.
    pub fn load(kind: BodyKind, override_dir: Option<&Path>) -> Result<Self> {
        let source = match override_dir.map(|dir| dir.join(kind.file_name())) {
            Some(path) if path.exists() => std::fs::read_to_string(&path).map_err(|e| {
                Error::Template(format!(
                    "failed to read override template {}: {e}",
                    path.display()
                ))
            })?,
            _ => kind.default_source().to_string(),
        };
        Self::compile(kind, source)
    }

    pub fn compile(kind: BodyKind, source: String) -> Result<Self> {
        let engine = upon::Engine::new();
        let template = engine
            .compile(source)
            .map_err(|e| Error::Template(format!("invalid {} template: {e}", kind.file_name())))?;
        Ok(Self {
            kind,
            engine,
            template,
        })
    }

    pub fn render<S: Serialize>(&self, ctx: &S) -> Result<String> {
        self.template
            .render(&self.engine, ctx)
            .to_string()
            .map_err(|e| {
                Error::Template(format!("failed to render {}: {e}", self.kind.file_name()))
            })
    }
}
