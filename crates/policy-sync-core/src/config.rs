use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable run configuration, built once and passed by reference to every
/// phase of a reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Repository root that discovery walks and reports paths relative to
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Glob patterns selecting policy directories; `!`-prefixed entries exclude
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub ignore_paths: Vec<String>,
    /// File name patterns identifying assignment files
    #[serde(default = "default_assignment_patterns")]
    pub assignments: Vec<String>,
    /// Assignment path patterns; `~`-prefixed entries disable enforcement
    #[serde(default)]
    pub enforce: Vec<String>,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub context: InvocationContext,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub api: ApiVersions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            paths: Vec::new(),
            ignore_paths: Vec::new(),
            assignments: default_assignment_patterns(),
            enforce: Vec::new(),
            mode: SyncMode::default(),
            force_update: false,
            context: InvocationContext::default(),
            batch: BatchSettings::default(),
            retry: RetrySettings::default(),
            api: ApiVersions::default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.paths.iter().all(|p| p.starts_with('!')) {
            return Err("paths must contain at least one include pattern".into());
        }
        if self.assignments.is_empty() {
            return Err("assignments must contain at least one pattern".into());
        }
        if self.batch.write_chunk_size == 0 || self.batch.read_chunk_size == 0 {
            return Err("batch chunk sizes must be > 0".into());
        }
        if self.batch.poll_interval_ms == 0 {
            return Err("batch.poll_interval_ms must be > 0".into());
        }
        if self.batch.poll_interval_ms > self.batch.poll_timeout_ms {
            return Err("batch.poll_interval_ms must be <= batch.poll_timeout_ms".into());
        }
        Ok(())
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_assignment_patterns() -> Vec<String> {
    vec!["assign.*.json".into()]
}

/// How drift is decided for objects that already exist remotely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Update only when the stored digest differs
    #[default]
    Incremental,
    /// Always overwrite
    Complete,
}

/// Where the run came from; persisted on every written object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationContext {
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub run_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Chunk size for PUT/DELETE batches
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,
    /// Chunk size for GET batches
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_write_chunk_size() -> usize {
    20
}
fn default_read_chunk_size() -> usize {
    500
}
fn default_poll_interval_ms() -> u64 {
    30_000
}
fn default_poll_timeout_ms() -> u64 {
    5 * 60_000
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            write_chunk_size: default_write_chunk_size(),
            read_chunk_size: default_read_chunk_size(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl BatchSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    5_000
}
fn default_retryable_statuses() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl RetrySettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// api-version query values for each remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiVersions {
    #[serde(default = "default_batch_api")]
    pub batch: String,
    #[serde(default = "default_policy_api")]
    pub policy: String,
    #[serde(default = "default_role_api")]
    pub role_assignments: String,
}

fn default_batch_api() -> String {
    "2020-06-01".into()
}
fn default_policy_api() -> String {
    "2021-06-01".into()
}
fn default_role_api() -> String {
    "2022-04-01".into()
}

impl Default for ApiVersions {
    fn default() -> Self {
        Self {
            batch: default_batch_api(),
            policy: default_policy_api(),
            role_assignments: default_role_api(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch.write_chunk_size, 20);
        assert_eq!(config.batch.read_chunk_size, 500);
        assert_eq!(config.batch.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.batch.poll_timeout(), Duration::from_secs(300));
        assert_eq!(config.mode, SyncMode::Incremental);
        assert_eq!(config.assignments, vec!["assign.*.json".to_string()]);
    }

    #[test]
    fn test_validate_requires_include_path() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_err());
        config.paths = vec!["!policies/legacy/**".into()];
        assert!(config.validate().is_err());
        config.paths.push("policies/**".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_poll_bounds() {
        let mut config = SyncConfig {
            paths: vec!["**".into()],
            ..Default::default()
        };
        config.batch.poll_interval_ms = 10 * 60_000;
        assert!(config.validate().is_err());
        config.batch.poll_interval_ms = 1_000;
        config.batch.write_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_deserializes_lowercase() {
        let mode: SyncMode = serde_json::from_str("\"complete\"").unwrap();
        assert_eq!(mode, SyncMode::Complete);
    }
}
