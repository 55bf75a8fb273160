//! Configuration management with TOML support and environment overrides.
//!
//! The agent consumes configuration but does not own its semantics: every
//! threshold, retry budget, and pattern list here is injected into the core
//! components. Loading follows `resync.toml` / `.resync.toml` in the working
//! directory, then `RESYNC_`-prefixed environment variables.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::infra::retry::RetryPolicy;

/// Merge-failure strategy applied after a safe rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStrategy {
    /// Overwrite the remote with the rolled-back local state. Destructive to
    /// remote-only commits; intended for ephemeral single-writer setups.
    ForcePush,
    /// Keep the backup branch for manual resolution, take no remote action.
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote to fetch from and push to
    pub remote_name: String,
    /// Branch kept in sync
    pub branch_name: String,
    /// Repository root; discovered via git when unset. `~` is expanded.
    pub repo_root: Option<String>,

    /// Seconds between cycles (owned by the outer scheduler)
    pub sleep_interval_secs: u64,
    /// Prefix for automatic commit messages
    pub commit_msg_prefix: String,

    /// Directories scanned for embedded (special) repositories
    pub special_base_dirs: Vec<String>,
    /// Directory basenames pruned from special-repo walks
    pub noise_dirs: Vec<String>,

    /// Upper bound (exclusive for the tier below) of the small tier, bytes
    pub small_file_threshold: u64,
    /// Upper bound of the medium tier, bytes
    pub medium_file_threshold: u64,

    /// Worker threads for job-level and hashing fan-out
    pub max_workers: usize,

    /// Static batch size; dynamic sizing applies when `dynamic_batching`
    pub batch_size: usize,
    pub dynamic_batching: bool,
    pub batch_retry_max_attempts: u32,
    pub batch_retry_base_delay_ms: u64,

    pub index_retry_max_attempts: u32,
    pub index_retry_base_delay_ms: u64,

    /// A lock marker older than this is treated as abandoned
    pub lock_max_age_secs: u64,
    /// Wait between lock re-checks while a younger marker exists
    pub lock_wait_ms: u64,

    pub merge_failure_strategy: FailureStrategy,
    /// Commit-log lines embedded in merge commit messages
    pub merge_log_lines: u32,
    /// Backup branches kept by the pruning maintenance op
    pub backup_retention: usize,
    /// File-name patterns auto-resolved to the remote side on conflict
    pub lock_file_patterns: Vec<String>,

    /// Consecutive merge failures before the scheduler backs off
    pub max_consecutive_failures: u32,
    /// Sleep multiplier applied in that backed-off safe mode
    pub safe_mode_multiplier: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_name: "origin".into(),
            branch_name: "main".into(),
            repo_root: None,

            sleep_interval_secs: 60,
            commit_msg_prefix: "auto-sync:".into(),

            special_base_dirs: Vec::new(),
            noise_dirs: vec![
                "venv".into(),
                "env".into(),
                ".venv".into(),
                "__pycache__".into(),
                "node_modules".into(),
                "vendor".into(),
            ],

            small_file_threshold: 5 * 1024 * 1024,
            medium_file_threshold: 100 * 1024 * 1024,

            max_workers: 16,

            batch_size: 100,
            dynamic_batching: true,
            batch_retry_max_attempts: 3,
            batch_retry_base_delay_ms: 1_000,

            index_retry_max_attempts: 5,
            index_retry_base_delay_ms: 2_000,

            lock_max_age_secs: 60,
            lock_wait_ms: 3_000,

            merge_failure_strategy: FailureStrategy::ForcePush,
            merge_log_lines: 10,
            backup_retention: 5,
            lock_file_patterns: vec![
                "package-lock.json".into(),
                "yarn.lock".into(),
                "pnpm-lock.yaml".into(),
                "Pipfile.lock".into(),
                "composer.lock".into(),
                "Gemfile.lock".into(),
                "go.sum".into(),
                "Cargo.lock".into(),
            ],

            max_consecutive_failures: 10,
            safe_mode_multiplier: 10,
        }
    }
}

impl SyncConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn index_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.index_retry_max_attempts,
            Duration::from_millis(self.index_retry_base_delay_ms),
        )
    }

    pub fn batch_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.batch_retry_max_attempts,
            Duration::from_millis(self.batch_retry_base_delay_ms),
        )
    }

    /// Repository root with `~`/env expansion and canonicalization applied.
    pub fn expanded_repo_root(&self) -> Result<Option<std::path::PathBuf>> {
        let Some(raw) = &self.repo_root else {
            return Ok(None);
        };
        let expanded = shellexpand::full(raw)
            .with_context(|| format!("expand repo_root {raw:?}"))?
            .into_owned();
        let canonical = dunce::canonicalize(&expanded)
            .with_context(|| format!("canonicalize repo_root {expanded:?}"))?;
        Ok(Some(canonical))
    }
}

/// Loads configuration from the first config file found plus environment.
pub fn load_config() -> Result<SyncConfig> {
    let mut builder = config::Config::builder();

    for path in ["resync.toml", ".resync.toml"] {
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
            break;
        }
    }

    builder = builder.add_source(config::Environment::with_prefix("RESYNC").separator("__"));

    let cfg = builder.build().context("Failed to load configuration")?;
    let parsed: SyncConfig = cfg
        .try_deserialize()
        .context("Failed to parse configuration")?;

    Ok(parsed)
}

/// Writes a default `resync.toml` into `dir`.
pub fn init(dir: &Path, force: bool) -> Result<std::path::PathBuf> {
    let config_path = dir.join("resync.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let toml_string = toml::to_string_pretty(&SyncConfig::default())
        .context("Failed to serialize default config")?;
    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SyncConfig::default();
        assert!(cfg.small_file_threshold < cfg.medium_file_threshold);
        assert!(cfg.max_workers > 0);
        assert_eq!(cfg.merge_failure_strategy, FailureStrategy::ForcePush);
        assert!(cfg.lock_file_patterns.iter().any(|p| p == "Cargo.lock"));
    }

    #[test]
    fn strategy_deserializes_from_kebab_case() {
        let cfg: SyncConfig =
            toml::from_str("merge_failure_strategy = \"rollback\"").unwrap();
        assert_eq!(cfg.merge_failure_strategy, FailureStrategy::Rollback);
    }

    #[test]
    fn init_writes_parseable_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = init(tmp.path(), false).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let parsed: SyncConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.remote_name, "origin");
    }
}
