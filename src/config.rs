//! Configuration parsing for kiln.toml
//!
//! The config file is optional and lives next to the build script. It holds
//! engine settings and environment variables handed to every action.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{KilnError, Result};

/// Config file looked up in the script directory
pub const CONFIG_FILE: &str = "kiln.toml";

/// Build script looked up in the script directory
pub const SCRIPT_FILE: &str = "build.kiln";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Environment variables for every action
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Engine settings
    #[serde(default)]
    pub settings: Settings,
}

/// Engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Worker threads for actions (0 = number of CPUs)
    #[serde(default)]
    pub workers: usize,

    /// Tool-owned working directory, relative to the script directory
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Also compare input contents (BLAKE3), not just modification times
    #[serde(default)]
    pub hash_inputs: bool,

    /// Shell used for `shell` and `compile` actions
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".kiln")
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 0,
            work_dir: default_work_dir(),
            hash_inputs: false,
            shell: default_shell(),
        }
    }
}

impl Config {
    /// Load `kiln.toml` from `dir`; a missing file yields the defaults
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content, &path)
    }

    /// Parse config text; `path` is only used for error messages
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| KilnError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.settings.shell.trim().is_empty() {
            return Err(KilnError::Config {
                path: path.to_path_buf(),
                message: "settings.shell must not be empty".to_string(),
            });
        }
        if self.settings.work_dir.as_os_str().is_empty() {
            return Err(KilnError::Config {
                path: path.to_path_buf(),
                message: "settings.work_dir must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Absolute working directory for a script living in `script_dir`
    pub fn work_dir(&self, script_dir: &Path) -> PathBuf {
        script_dir.join(&self.settings.work_dir)
    }
}
