//! Rollback configuration.
//!
//! Loaded from `~/.pulumi-rollback/config.toml`. Every key is optional and a
//! missing file means defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable consulted for the stack name when `--stack` is absent.
pub const STACK_ENV: &str = "PULUMI_STACK";

/// Rollback configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Stack used when neither `--stack` nor `PULUMI_STACK` is set.
    pub stack: Option<String>,

    /// Path to the `pulumi` binary. Defaults to `pulumi` on `PATH`.
    pub pulumi: Option<PathBuf>,

    /// Log filter directive, e.g. `"debug"` or `"pulumi_rollback=trace"`.
    /// `RUST_LOG` takes precedence.
    pub log: Option<String>,
}

impl Config {
    /// Load config from `~/.pulumi-rollback/config.toml`.
    pub fn load() -> Result<Self, String> {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .map_err(|e| format!("invalid config at {}: {e}", path.display()))?;

        if config.stack.as_deref().is_some_and(str::is_empty) {
            return Err(format!(
                "stack is empty in {}\n\
                 Remove the key or set it to a stack name.",
                path.display()
            ));
        }

        Ok(config)
    }

    /// The config file path: `~/.pulumi-rollback/config.toml`.
    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".pulumi-rollback").join("config.toml"))
    }
}

/// Resolve the stack name: explicit flag, then `PULUMI_STACK`, then config.
///
/// Empty values are skipped.
pub fn resolve_stack(
    explicit: Option<&str>,
    env: Option<String>,
    config: &Config,
) -> Result<String, String> {
    explicit
        .map(str::to_string)
        .into_iter()
        .chain(env)
        .chain(config.stack.clone())
        .find(|name| !name.trim().is_empty())
        .ok_or_else(|| {
            format!(
                "no stack specified\n\
                 Pass --stack <name>, set {STACK_ENV}, or add `stack = \"<name>\"` to {}",
                Config::path().map_or_else(
                    || "the config file".to_string(),
                    |p| p.display().to_string()
                )
            )
        })
}
