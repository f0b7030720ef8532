use std::fmt;

use chrono::NaiveDateTime;

use crate::finding::{Category, Finding, Origin, Severity, truncate_title};

/// Trailer label marking the per-pass timestamp in a task description.
pub const STAMP_LABEL: &str = "**Last Updated:**";

const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Kanboard color ids used by this integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Orange,
    Yellow,
    Blue,
}

impl Color {
    pub fn as_str(self) -> &'static str {
        match self {
            Color::Red => "red",
            Color::Orange => "orange",
            Color::Yellow => "yellow",
            Color::Blue => "blue",
        }
    }

    fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Blocker | Severity::Critical => Color::Red,
            Severity::Major => Color::Orange,
            Severity::Minor => Color::Yellow,
            Severity::Info => Color::Blue,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The board-facing content derived from one finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContent {
    pub title: String,
    pub description: String,
    pub color: Color,
}

pub fn color_for(finding: &Finding) -> Color {
    match finding.category {
        Category::Security => Color::Red,
        Category::Reliability => Color::Orange,
        Category::Maintainability | Category::Smell(_) => Color::for_severity(finding.severity),
    }
}

pub fn title_for(finding: &Finding) -> String {
    let raw = match finding.origin {
        Origin::StaticAnalysis => format!(
            "[{}] [{}] {}",
            finding.category, finding.severity, finding.title
        ),
        Origin::CodeSmell => format!("[{}] {}", finding.category, finding.title),
    };
    truncate_title(&raw)
}

/// Body plus the timestamp trailer.
pub fn description_for(finding: &Finding, stamped_at: NaiveDateTime) -> String {
    let separator = match finding.origin {
        Origin::StaticAnalysis => "\n",
        Origin::CodeSmell => "\n\n",
    };
    format!(
        "{}{separator}{STAMP_LABEL} {}",
        finding.body.trim_end(),
        stamped_at.format(STAMP_FORMAT)
    )
}

pub fn task_content(finding: &Finding, stamped_at: NaiveDateTime) -> TaskContent {
    TaskContent {
        title: title_for(finding),
        description: description_for(finding, stamped_at),
        color: color_for(finding),
    }
}

/// Drop the timestamp trailer so two renderings can be compared.
pub fn strip_stamp(description: &str) -> &str {
    match description.rfind(STAMP_LABEL) {
        Some(pos) => description[..pos].trim_end(),
        None => description.trim_end(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .unwrap()
    }

    fn issue(category: Category, severity: Severity) -> Finding {
        Finding {
            origin: Origin::StaticAnalysis,
            identity: "K-1".to_string(),
            category,
            severity,
            title: "Remove this unused import".to_string(),
            body: "**SonarQube Issue Integration**\n\n**Issue Key:** K-1".to_string(),
            locator: None,
            resolved: false,
        }
    }

    fn smell(name: &str, severity: Severity) -> Finding {
        Finding {
            origin: Origin::CodeSmell,
            identity: format!("a.py-10-{name}"),
            category: Category::Smell(name.to_string()),
            severity,
            title: "parse in a.py".to_string(),
            body: "**DPy Code Smell Integration**".to_string(),
            locator: None,
            resolved: false,
        }
    }

    #[test]
    fn test_issue_title() {
        let f = issue(Category::Reliability, Severity::Major);
        assert_eq!(
            title_for(&f),
            "[Reliability] [MAJOR] Remove this unused import"
        );
    }

    #[test]
    fn test_smell_title() {
        let f = smell("Long Method", Severity::Major);
        assert_eq!(title_for(&f), "[Long Method] parse in a.py");
    }

    #[test]
    fn test_long_title_truncated() {
        let mut f = issue(Category::Security, Severity::Info);
        f.title = "m".repeat(300);
        let title = title_for(&f);
        assert_eq!(title.chars().count(), 255);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_category_colors() {
        assert_eq!(
            color_for(&issue(Category::Security, Severity::Info)),
            Color::Red
        );
        assert_eq!(
            color_for(&issue(Category::Reliability, Severity::Info)),
            Color::Orange
        );
    }

    #[test]
    fn test_severity_refines_smell_colors() {
        let cases = [
            (Severity::Blocker, Color::Red),
            (Severity::Critical, Color::Red),
            (Severity::Major, Color::Orange),
            (Severity::Minor, Color::Yellow),
            (Severity::Info, Color::Blue),
        ];
        for (severity, color) in cases {
            assert_eq!(
                color_for(&issue(Category::Maintainability, severity)),
                color
            );
            assert_eq!(color_for(&smell("Long Method", severity)), color);
        }
    }

    #[test]
    fn test_description_has_stamp() {
        let f = issue(Category::Reliability, Severity::Major);
        let desc = description_for(&f, at());
        assert!(desc.starts_with("**SonarQube Issue Integration**"));
        assert!(desc.ends_with("\n**Last Updated:** 2024-05-01 12:30:00"));

        let s = smell("Long Method", Severity::Major);
        assert!(description_for(&s, at()).contains("\n\n**Last Updated:**"));
    }

    #[test]
    fn test_strip_stamp_ignores_time() {
        let f = issue(Category::Reliability, Severity::Major);
        let first = description_for(&f, at());
        let later = description_for(&f, at() + chrono::Duration::hours(3));
        assert_ne!(first, later);
        assert_eq!(strip_stamp(&first), strip_stamp(&later));
        assert_eq!(strip_stamp(&first), f.body);
    }

    #[test]
    fn test_strip_stamp_without_trailer() {
        assert_eq!(strip_stamp("edited by hand\n"), "edited by hand");
    }
}
