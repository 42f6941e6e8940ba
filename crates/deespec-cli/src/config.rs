//! Config resolution: CLI flag > environment variable > config file >
//! built-in default, in that order. The config file lives under the XDG
//! config directory and is written with 0600 permissions on Unix since it
//! may eventually carry credentials for a configured agent backend.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const APP_DIR_NAME: &str = "deespec";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub run: RunSection,
    /// Per-agent concurrency caps, e.g. `claude-code = 2`. An agent absent
    /// from this table defaults to a max of one, per the AgentPool
    /// contract.
    #[serde(default)]
    pub agents: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_run_root")]
    pub run_root: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            run_root: default_run_root(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_run_root() -> String {
    ".deespec".to_owned()
}

/// The fully-resolved settings a command actually runs with.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub max_concurrency: usize,
    pub run_root: PathBuf,
    pub agent_limits: HashMap<String, usize>,
}

impl ResolvedConfig {
    /// Resolve settings from, in priority order: explicit CLI flags, then
    /// `DEESPEC_MAX_CONCURRENCY` / `DEESPEC_RUN_ROOT` env vars, then the
    /// config file, then the built-in default. Per-agent limits are only
    /// configurable via the config file; there is no single scalar CLI
    /// flag or env var that makes sense for a whole table of them.
    pub fn resolve(cli_max_concurrency: Option<usize>, cli_run_root: Option<PathBuf>) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let max_concurrency = cli_max_concurrency
            .or_else(|| std::env::var("DEESPEC_MAX_CONCURRENCY").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(file.run.max_concurrency);

        let run_root = cli_run_root
            .or_else(|| std::env::var("DEESPEC_RUN_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(file.run.run_root));

        Ok(Self {
            max_concurrency,
            run_root,
            agent_limits: file.agents,
        })
    }
}

/// `$XDG_CONFIG_HOME/deespec`, or `~/.config/deespec` if unset.
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg).join(APP_DIR_NAME));
        }
    }
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".config").join(APP_DIR_NAME))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

pub fn load_config() -> Result<ConfigFile> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir()?;
    fs::create_dir_all(&dir)?;
    let path = dir.join(CONFIG_FILE_NAME);

    let serialized = toml::to_string_pretty(config)?;
    fs::write(&path, serialized)?;

    set_owner_only_permissions(&path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn default_run_section_has_sane_defaults() {
        let run = RunSection::default();
        assert_eq!(run.max_concurrency, 4);
        assert_eq!(run.run_root, ".deespec");
    }

    #[test]
    fn config_dir_honors_xdg_config_home() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("XDG_CONFIG_HOME", "/tmp/deespec-xdg-test");
        }
        let dir = config_dir().unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/deespec-xdg-test/deespec"));
        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn resolved_config_prefers_cli_flag_over_everything() {
        let resolved = ResolvedConfig::resolve(Some(9), Some(PathBuf::from("/tmp/x"))).unwrap();
        assert_eq!(resolved.max_concurrency, 9);
        assert_eq!(resolved.run_root, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn config_file_parses_an_agents_table() {
        let parsed: ConfigFile = toml::from_str("[agents]\nclaude-code = 2\ngemini-cli = 1\n").unwrap();
        assert_eq!(parsed.agents.get("claude-code"), Some(&2));
        assert_eq!(parsed.agents.get("gemini-cli"), Some(&1));
    }

    #[test]
    fn resolved_config_falls_back_to_env_var() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("DEESPEC_MAX_CONCURRENCY", "7");
        }
        let resolved = ResolvedConfig::resolve(None, Some(PathBuf::from("/tmp/x"))).unwrap();
        assert_eq!(resolved.max_concurrency, 7);
        unsafe {
            std::env::remove_var("DEESPEC_MAX_CONCURRENCY");
        }
    }
}
