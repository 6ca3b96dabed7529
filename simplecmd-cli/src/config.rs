use clap::ValueEnum;
use serde::Deserialize;
use simplecmd_core::{CommandSpec, SimpleCmdError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the result of a run is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Captured output only
    #[default]
    Plain,
    /// Multi-line summary of command, status, exit code and output
    Summary,
    /// Full execution record as JSON
    Json,
}

/// Defaults read from a TOML config file
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub timeout_secs: Option<i64>,
    pub live: Option<bool>,
    pub format: Option<OutputFormat>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl FileConfig {
    pub fn from_toml_str(content: &str) -> simplecmd_core::Result<Self> {
        toml::from_str(content).map_err(|e| SimpleCmdError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> simplecmd_core::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Settings given on the command line; `None` falls back to the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub timeout_secs: Option<i64>,
    pub timeout_ms: Option<u64>,
    pub live: bool,
    pub format: Option<OutputFormat>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<String>,
}

/// Everything needed to launch and report one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub spec: CommandSpec,
    pub live: bool,
    pub format: OutputFormat,
}

/// Split a `KEY=VALUE` argument.
pub fn parse_env_pair(pair: &str) -> simplecmd_core::Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(SimpleCmdError::InvalidConfiguration(format!(
            "expected KEY=VALUE, got '{}'",
            pair
        ))),
    }
}

pub fn resolve(
    file: FileConfig,
    overrides: Overrides,
    program: String,
    args: Vec<String>,
) -> simplecmd_core::Result<RunSettings> {
    let mut spec = CommandSpec::new(program).with_args(args);

    for (key, value) in file.env {
        spec = spec.with_env(key, value);
    }
    for pair in &overrides.env {
        let (key, value) = parse_env_pair(pair)?;
        spec = spec.with_env(key, value);
    }

    if let Some(dir) = overrides.working_dir.or(file.working_dir) {
        spec = spec.with_working_dir(dir);
    }

    spec = match (overrides.timeout_ms, overrides.timeout_secs.or(file.timeout_secs)) {
        (Some(ms), _) => spec.with_timeout(Duration::from_millis(ms)),
        (None, Some(secs)) => spec.with_timeout_secs(secs),
        (None, None) => spec,
    };

    Ok(RunSettings {
        spec,
        live: overrides.live || file.live.unwrap_or(false),
        format: overrides.format.or(file.format).unwrap_or_default(),
    })
}

pub const CONFIG_TEMPLATE: &str = r#"# simplecmd configuration
#
# Command-line flags override every value set here.

# Kill the command after this many seconds. 0 or a negative value disables the bound.
timeout_secs = 30

# Mirror the command's output to the terminal while it runs.
live = false

# How to print the result: "plain", "summary" or "json".
format = "plain"

# Directory to run the command in. Defaults to the current directory.
# working_dir = "/tmp"

# Extra environment variables for the command.
[env]
# RUST_BACKTRACE = "1"
"#;
