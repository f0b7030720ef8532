use std::fmt;

use serde::Serialize;

/// Maximum task title length accepted by the board.
pub const MAX_TITLE_CHARS: usize = 255;

const ELLIPSIS: &str = "...";

/// Which source adapter produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Origin {
    StaticAnalysis,
    CodeSmell,
}

impl Origin {
    pub const ALL: [Origin; 2] = [Origin::StaticAnalysis, Origin::CodeSmell];

    /// Prefix written in front of every reference this origin owns.
    pub fn prefix(self) -> &'static str {
        match self {
            Origin::StaticAnalysis => "sonar",
            Origin::CodeSmell => "dpy",
        }
    }

    /// Build the board reference for an identity of this origin.
    pub fn reference(self, identity: &str) -> String {
        format!("{}-{identity}", self.prefix())
    }

    /// Whether `reference` lives in this origin's namespace.
    pub fn owns(self, reference: &str) -> bool {
        reference
            .strip_prefix(self.prefix())
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Recover the origin of a reference, if this integration could have written it.
    pub fn of_reference(reference: &str) -> Option<Origin> {
        Origin::ALL.into_iter().find(|o| o.owns(reference))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::StaticAnalysis => write!(f, "sonarqube"),
            Origin::CodeSmell => write!(f, "dpy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Category {
    Maintainability,
    Reliability,
    Security,
    /// A named code smell (e.g. `Long Method`).
    Smell(String),
}

impl Category {
    /// Map a SonarQube issue type. Types outside the three tracked ones yield `None`.
    pub fn from_issue_type(issue_type: &str) -> Option<Self> {
        match issue_type {
            "CODE_SMELL" => Some(Category::Maintainability),
            "BUG" => Some(Category::Reliability),
            "VULNERABILITY" => Some(Category::Security),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Maintainability => write!(f, "Maintainability"),
            Category::Reliability => write!(f, "Reliability"),
            Category::Security => write!(f, "Security"),
            Category::Smell(name) => write!(f, "{name}"),
        }
    }
}

/// Ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Blocker,
    Critical,
    Major,
    Minor,
    Info,
}

impl Severity {
    pub fn parse(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "BLOCKER" => Some(Severity::Blocker),
            "CRITICAL" => Some(Severity::Critical),
            "MAJOR" => Some(Severity::Major),
            "MINOR" => Some(Severity::Minor),
            "INFO" => Some(Severity::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Blocker => "BLOCKER",
            Severity::Critical => "CRITICAL",
            Severity::Major => "MAJOR",
            Severity::Minor => "MINOR",
            Severity::Info => "INFO",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Locator {
    pub file: String,
    /// Free text: smell reports use ranges such as `10-24`.
    pub line: Option<String>,
}

/// One normalized unit of work produced by a source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub origin: Origin,
    pub identity: String,
    pub category: Category,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub locator: Option<Locator>,
    pub resolved: bool,
}

impl Finding {
    pub fn reference(&self) -> String {
        self.origin.reference(&self.identity)
    }
}

/// Cut a title to `MAX_TITLE_CHARS`, ending in `...` when shortened.
pub fn truncate_title(title: &str) -> String {
    if title.chars().count() <= MAX_TITLE_CHARS {
        return title.to_string();
    }
    let keep = MAX_TITLE_CHARS - ELLIPSIS.len();
    let mut out: String = title.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}
