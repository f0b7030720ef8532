pub mod dpy;
pub mod sonarqube;

use crate::config::{Config, SourceKind};
use crate::error::Result;
use crate::finding::{Finding, Origin};

/// Everything one fetch produced: well-formed findings plus the number of
/// raw records that were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindingBatch {
    pub findings: Vec<Finding>,
    pub malformed: usize,
    /// The source stopped before its last record, so absence from
    /// `findings` says nothing about a task.
    pub truncated: bool,
}

/// A producer of findings for one origin. `fetch` is total and finite.
pub trait FindingSource: Send + Sync {
    fn origin(&self) -> Origin;

    fn fetch(&self) -> Result<FindingBatch>;
}

/// Enum dispatch over concrete source implementations.
pub enum AnySource {
    SonarQube(sonarqube::SonarQubeSource),
    Dpy(dpy::DpySource),
}

impl FindingSource for AnySource {
    fn origin(&self) -> Origin {
        match self {
            AnySource::SonarQube(s) => s.origin(),
            AnySource::Dpy(s) => s.origin(),
        }
    }

    fn fetch(&self) -> Result<FindingBatch> {
        match self {
            AnySource::SonarQube(s) => s.fetch(),
            AnySource::Dpy(s) => s.fetch(),
        }
    }
}

/// Build every source enabled in the config, in configured order.
pub fn build_sources(config: &Config) -> Result<Vec<AnySource>> {
    config
        .sources
        .iter()
        .map(|kind| match kind {
            SourceKind::SonarQube => {
                sonarqube::SonarQubeSource::new(config).map(AnySource::SonarQube)
            }
            SourceKind::Dpy => dpy::DpySource::new(config).map(AnySource::Dpy),
        })
        .collect()
}
