use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source fetch error: {0}")]
    SourceFetch(String),

    #[error("malformed finding: {0}")]
    MalformedFinding(String),

    #[error("transient board error: {0}")]
    BoardTransient(String),

    #[error("board error: {0}")]
    BoardPermanent(String),

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BoardTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
