//! Configuration loading for gtrun.
//!
//! Configuration is read from a TOML file (`gtrun.toml` by default) and
//! only ever read afterwards. The helpers on [`Config`] translate it into
//! the option structs consumed by the orchestrator.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use regex::bytes::Regex;

use crate::artifacts::ArtifactManager;
use crate::orchestrator::{CampaignOptions, RunnerSettings};

/// Loads gtrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or
/// contains unknown keys.
///
/// # Example
///
/// ```no_run
/// use gtrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("gtrun.toml"))?;
/// println!("Jobs: {}", config.campaign.jobs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads gtrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use gtrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [campaign]
///     repetitions = 5
///
///     [tool]
///     command = "valgrind -q"
/// "#)?;
///
/// assert_eq!(config.campaign.repetitions, 5);
/// assert_eq!(config.tool.unwrap().error_exit_code, 125);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Expands `~` and environment variables in a configured path.
fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(path).with_context(|| format!("Failed to expand path: {}", path))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

impl Config {
    pub fn artifact_manager(&self) -> Result<ArtifactManager> {
        Ok(ArtifactManager::new(
            expand_path(&self.artifacts.trace_dir)?,
            self.artifacts.copy_executable,
            self.tool_core_prefix(),
        ))
    }

    pub fn runner_settings(&self) -> Result<RunnerSettings> {
        ensure!(
            self.runner.poll_interval_ms > 0,
            "runner.poll_interval_ms must be greater than 0"
        );
        ensure!(
            self.runner.drain_interval_ms > 0,
            "runner.drain_interval_ms must be greater than 0"
        );
        Ok(RunnerSettings {
            core_dir: expand_path(&self.artifacts.core_dir)?,
            poll_interval: Duration::from_millis(self.runner.poll_interval_ms),
            drain_interval: Duration::from_millis(self.runner.drain_interval_ms),
        })
    }

    pub fn tool_core_prefix(&self) -> String {
        self.tool
            .as_ref()
            .map_or_else(default_core_prefix, |tool| tool.core_prefix.clone())
    }

    /// Tool command words and error exit code, if a tool is configured.
    pub fn tool_command(&self) -> Result<(Vec<String>, Option<i32>)> {
        let Some(tool) = &self.tool else {
            return Ok((Vec::new(), None));
        };
        let words = shell_words::split(&tool.command)
            .with_context(|| format!("Invalid tool command: {}", tool.command))?;
        let code = tool.detect_errors.then_some(tool.error_exit_code);
        Ok((words, code))
    }

    pub fn seed_pattern(&self) -> Result<Option<Regex>> {
        self.campaign
            .seed_regexp
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("Invalid seed_regexp: {}", pattern))
            })
            .transpose()
    }

    /// Campaign options for running `test_count` tests of `executable`.
    pub fn campaign_options(
        &self,
        executable: &Path,
        test_count: usize,
    ) -> Result<CampaignOptions> {
        let (tool, tool_error_exit_code) = self.tool_command()?;
        let campaign = &self.campaign;
        Ok(CampaignOptions {
            executable: executable.to_path_buf(),
            test_count,
            repetitions: campaign.repetitions,
            jobs: campaign.jobs,
            background_jobs: campaign.background_jobs,
            filter: campaign.filter.clone(),
            run_disabled: campaign.run_disabled,
            shuffle: campaign.shuffle,
            break_on_failure: campaign.break_on_failure,
            break_on_exception: campaign.break_on_exception,
            tool,
            tool_error_exit_code,
            max_failures: campaign.max_failures,
            clean_passed: campaign.clean_trace,
            clean_core: campaign.clean_core,
            seed_pattern: self.seed_pattern()?,
            is_resume: false,
        })
    }
}
