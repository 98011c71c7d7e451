use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator_runner::RunnerConfig;

use crate::auth::Credentials;

const DEFAULT_USERNAME: &str = "admin";
const USERNAME_ENV: &str = "VALIDATOR_USERNAME";
const PASSWORD_ENV: &str = "VALIDATOR_PASSWORD";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsoleFile {
    runner: RunnerSection,
    #[serde(default)]
    dashboard: DashboardSection,
    #[serde(default)]
    auth: AuthSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunnerSection {
    script: PathBuf,
    interpreter: Option<PathBuf>,
    timeout_secs: Option<u64>,
    temp_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DashboardSection {
    output_dir: Option<PathBuf>,
    thresholds_file: Option<PathBuf>,
    #[serde(default = "default_max_concurrent_runs")]
    max_concurrent_runs: usize,
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self {
            output_dir: None,
            thresholds_file: None,
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AuthSection {
    username: Option<String>,
    password: Option<String>,
}

fn default_max_concurrent_runs() -> usize {
    1
}

/// Console settings with every path resolved and credentials overridden from the environment.
#[derive(Debug, Clone)]
pub(crate) struct ConsoleConfig {
    pub(crate) runner: RunnerConfig,
    pub(crate) output_dir: PathBuf,
    /// Validator settings file the dashboard reads its default URL from.
    pub(crate) thresholds_file: PathBuf,
    pub(crate) max_concurrent_runs: usize,
    pub(crate) credentials: Credentials,
}

pub(crate) fn load_console_config(path: &Path) -> anyhow::Result<ConsoleConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_console_config(&raw, base_dir, |key| std::env::var(key).ok())
        .with_context(|| format!("failed to load config {}", path.display()))
}

pub(crate) fn parse_console_config(
    raw: &str,
    base_dir: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ConsoleConfig> {
    let file: ConsoleFile = toml::from_str(raw).context("invalid console config")?;

    if file.runner.script.as_os_str().is_empty() {
        anyhow::bail!("runner.script must not be empty");
    }
    if file.dashboard.max_concurrent_runs == 0 {
        anyhow::bail!("dashboard.max_concurrent_runs must be at least 1");
    }

    let script = resolve(base_dir, &file.runner.script);
    let script_dir = script.parent().unwrap_or_else(|| Path::new(""));
    let output_dir = match &file.dashboard.output_dir {
        Some(dir) => resolve(base_dir, dir),
        None => script_dir.join("output"),
    };
    let thresholds_file = match &file.dashboard.thresholds_file {
        Some(path) => resolve(base_dir, path),
        None => script_dir.join("config").join("thresholds.conf"),
    };
    let runner = RunnerConfig {
        script,
        interpreter: file.runner.interpreter,
        timeout: file
            .runner
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        temp_dir: file.runner.temp_dir.map(|dir| resolve(base_dir, &dir)),
    };

    let username = env(USERNAME_ENV)
        .or(file.auth.username)
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
    let password = env(PASSWORD_ENV).or(file.auth.password).unwrap_or_default();
    if password.is_empty() {
        anyhow::bail!("auth.password (or {PASSWORD_ENV}) must be set");
    }

    Ok(ConsoleConfig {
        runner,
        output_dir,
        thresholds_file,
        max_concurrent_runs: file.dashboard.max_concurrent_runs,
        credentials: Credentials::new(username, password),
    })
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
