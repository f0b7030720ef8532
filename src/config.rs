use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cli::Cli;
use crate::engine::{
    DEFAULT_RESOLVED_COLUMN, DEFAULT_TARGET_COLUMN, DEFAULT_WORKERS, EngineOptions, UpdatePolicy,
};
use crate::error::{Error, Result};
use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use crate::sources::dpy::DEFAULT_PATTERN;

pub const DEFAULT_CONFIG_PATH: &str = "kanbridge.toml";
const DEFAULT_INTERVAL_MINUTES: u64 = 30;
/// One week.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Which finding sources a run pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[value(name = "sonarqube")]
    SonarQube,
    Dpy,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub sources: Option<Vec<SourceKind>>,
    pub interval_minutes: Option<u64>,
    pub workers: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub update_policy: Option<UpdatePolicy>,
    pub dry_run: Option<bool>,
    pub max_passes: Option<u32>,
    pub template_dir: Option<PathBuf>,
    pub kanboard: Option<KanboardConfig>,
    pub sonarqube: Option<SonarQubeConfig>,
    pub dpy: Option<DpyConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KanboardConfig {
    /// JSON-RPC endpoint, e.g. `https://kanboard.example/jsonrpc.php`.
    pub url: String,
    #[serde(default = "default_kanboard_token_env")]
    pub token_env: String,
    pub project_id: u64,
    #[serde(default = "default_target_column")]
    pub target_column: String,
    #[serde(default = "default_resolved_column")]
    pub resolved_column: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SonarQubeConfig {
    #[serde(default = "default_sonar_url")]
    pub url: String,
    #[serde(default = "default_sonar_token_env")]
    pub token_env: String,
    pub project_key: String,
    #[serde(default = "default_true")]
    pub include_resolved: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DpyConfig {
    #[serde(default = "default_dpy_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_dpy_pattern")]
    pub pattern: String,
}

impl Default for DpyConfig {
    fn default() -> Self {
        Self {
            directory: default_dpy_directory(),
            pattern: default_dpy_pattern(),
        }
    }
}

fn default_kanboard_token_env() -> String {
    "KANBOARD_TOKEN".to_string()
}

fn default_target_column() -> String {
    DEFAULT_TARGET_COLUMN.to_string()
}

fn default_resolved_column() -> String {
    DEFAULT_RESOLVED_COLUMN.to_string()
}

fn default_sonar_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_sonar_token_env() -> String {
    "SONAR_TOKEN".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dpy_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_dpy_pattern() -> String {
    DEFAULT_PATTERN.to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sources: Vec<SourceKind>,
    pub interval_minutes: u64,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub update_policy: UpdatePolicy,
    pub dry_run: bool,
    pub max_passes: Option<u32>,
    pub template_dir: Option<PathBuf>,
    pub kanboard: KanboardConfig,
    pub sonarqube: Option<SonarQubeConfig>,
    pub dpy: Option<DpyConfig>,
    pub once: bool,
    pub continuous: bool,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = Path::new(cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));
        let file_config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            parse_config(&content)?
        } else {
            return Err(Error::ConfigNotFound(config_path.to_path_buf()));
        };

        merge(file_config, cli)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            project_id: self.kanboard.project_id,
            target_column: self.kanboard.target_column.clone(),
            resolved_column: self.kanboard.resolved_column.clone(),
            workers: self.workers,
            retry: RetryPolicy::new(
                self.max_attempts,
                Duration::from_millis(self.retry_backoff_ms),
            ),
            update_policy: self.update_policy,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    /// Kanboard API token from the configured environment variable.
    pub fn kanboard_token(&self) -> Result<String> {
        resolve_token(&self.kanboard.token_env).ok_or_else(|| {
            Error::ConfigValidation(format!(
                "Kanboard API token not found in ${}",
                self.kanboard.token_env
            ))
        })
    }
}

/// Read a token from `env_var`, treating an empty value as unset.
pub fn resolve_token(env_var: &str) -> Option<String> {
    std::env::var(env_var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_interval(minutes: u64) -> Result<()> {
    if minutes == 0 {
        return Err(Error::ConfigValidation(
            "interval_minutes must be > 0".to_string(),
        ));
    }
    if minutes > MAX_INTERVAL_MINUTES {
        return Err(Error::ConfigValidation(format!(
            "interval_minutes must be <= {MAX_INTERVAL_MINUTES}"
        )));
    }
    Ok(())
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    if let Some(interval) = config.interval_minutes {
        check_interval(interval)?;
    }
    if let Some(workers) = config.workers
        && workers == 0
    {
        return Err(Error::ConfigValidation("workers must be > 0".to_string()));
    }
    if let Some(attempts) = config.max_attempts
        && attempts == 0
    {
        return Err(Error::ConfigValidation(
            "max_attempts must be > 0".to_string(),
        ));
    }
    if let Some(ref kanboard) = config.kanboard {
        if kanboard.url.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "kanboard.url must not be empty".to_string(),
            ));
        }
        if kanboard.project_id == 0 {
            return Err(Error::ConfigValidation(
                "kanboard.project_id must be > 0".to_string(),
            ));
        }
    }
    if let Some(ref sonar) = config.sonarqube
        && sonar.project_key.trim().is_empty()
    {
        return Err(Error::ConfigValidation(
            "sonarqube.project_key must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let mut kanboard = file.kanboard.ok_or_else(|| {
        Error::ConfigValidation("[kanboard] config section is required".to_string())
    })?;
    if let Some(project_id) = cli.project_id {
        kanboard.project_id = project_id;
    }
    if let Some(ref column) = cli.target_column {
        kanboard.target_column = column.clone();
    }
    if let Some(ref column) = cli.resolved_column {
        kanboard.resolved_column = column.clone();
    }

    let dpy = match &cli.directory {
        Some(dir) => Some(DpyConfig {
            directory: PathBuf::from(dir),
            ..file.dpy.unwrap_or_default()
        }),
        None => file.dpy,
    };
    let sonarqube = file.sonarqube;

    let requested = if !cli.source.is_empty() {
        cli.source.clone()
    } else if let Some(sources) = file.sources {
        sources
    } else {
        let mut inferred = Vec::new();
        if sonarqube.is_some() {
            inferred.push(SourceKind::SonarQube);
        }
        if dpy.is_some() {
            inferred.push(SourceKind::Dpy);
        }
        inferred
    };
    let mut sources = Vec::new();
    for kind in requested {
        if !sources.contains(&kind) {
            sources.push(kind);
        }
    }
    if sources.is_empty() {
        return Err(Error::ConfigValidation(
            "no sources configured (add a [sonarqube] or [dpy] section)".to_string(),
        ));
    }
    if sources.contains(&SourceKind::SonarQube) && sonarqube.is_none() {
        return Err(Error::ConfigValidation(
            "source sonarqube requires a [sonarqube] section".to_string(),
        ));
    }

    let interval_minutes = cli
        .interval_minutes
        .or(file.interval_minutes)
        .unwrap_or(DEFAULT_INTERVAL_MINUTES);
    check_interval(interval_minutes)?;
    let workers = cli.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
    if workers == 0 {
        return Err(Error::ConfigValidation("workers must be > 0".to_string()));
    }
    if kanboard.project_id == 0 {
        return Err(Error::ConfigValidation(
            "kanboard.project_id must be > 0".to_string(),
        ));
    }

    Ok(Config {
        // A dpy source with no section reads the current directory.
        dpy: if sources.contains(&SourceKind::Dpy) {
            Some(dpy.unwrap_or_default())
        } else {
            dpy
        },
        sources,
        interval_minutes,
        workers,
        max_attempts: file.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        retry_backoff_ms: file.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
        update_policy: file.update_policy.unwrap_or_default(),
        dry_run: cli.dry_run || file.dry_run.unwrap_or(false),
        max_passes: cli.max_passes.or(file.max_passes),
        template_dir: file.template_dir,
        kanboard,
        sonarqube,
        once: cli.once,
        continuous: cli.continuous,
    })
}
