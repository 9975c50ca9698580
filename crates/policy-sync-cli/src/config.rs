use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use policy_sync_core::SyncConfig;
use serde::{Deserialize, Serialize};

use crate::cli::RunArgs;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Contents of the TOML configuration file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Resource manager endpoint, when not taken from the Azure CLI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_url: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(flatten)]
    pub sync: SyncConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

pub fn validate_level(level: &str) -> Result<()> {
    if LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        anyhow::bail!(
            "Unknown log level: {level}. Valid levels: {}",
            LOG_LEVELS.join(", ")
        )
    }
}

/// Load the configuration file, or defaults when none was given.
pub fn load(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("Cannot read config file {}", path.display()))?;
    let cfg: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    validate_level(&cfg.logging.level)?;
    Ok(cfg)
}

/// Apply command-line and environment overrides on top of the file.
pub fn resolve(file: &FileConfig, args: &RunArgs) -> Result<SyncConfig> {
    let mut config = file.sync.clone();

    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if !args.paths.is_empty() {
        config.paths = args.paths.clone();
    }
    if !args.ignore_paths.is_empty() {
        config.ignore_paths = args.ignore_paths.clone();
    }
    if !args.assignments.is_empty() {
        config.assignments = args.assignments.clone();
    }
    if !args.enforce.is_empty() {
        config.enforce = args.enforce.clone();
    }
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(repo) = &args.repo_name {
        config.context.repo_name = repo.clone();
    }
    if let Some(sha) = &args.commit_sha {
        config.context.commit_sha = sha.clone();
    }
    if let Some(url) = run_url(args) {
        config.context.run_url = url;
    }

    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

/// `https://github.com/org/repo/actions/runs/123` when running in a workflow.
fn run_url(args: &RunArgs) -> Option<String> {
    let server = args.server_url.as_deref()?.trim_end_matches('/');
    let repo = args.repo_name.as_deref()?;
    let run_id = args.run_id.as_deref()?;
    Some(format!("{server}/{repo}/actions/runs/{run_id}"))
}
