//! Shell actions
//!
//! Every `shell`, `compile` and capture statement ends up here as a command
//! string run through the configured shell (`sh -c` by default).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use console::style;
use tracing::debug;

use crate::config::{Config, CONFIG_FILE};
use crate::env::Value;
use crate::error::{KilnError, Result};

/// How much the engine and its actions print
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Action output discarded, nothing printed
    Silent,
    #[default]
    Regular,
    /// Commands are echoed before they run
    Verbose,
}

/// Result of one finished (or skipped) action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    pub exit_code: i32,
    /// Only filled for captures
    pub stdout: String,
    /// The owning task was up to date, nothing ran
    pub skipped: bool,
}

impl ActionOutput {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn captured(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            skipped: false,
        }
    }

    /// Trimmed stdout as a script value
    pub fn value(&self) -> Value {
        Value::Str(self.stdout.trim().to_string())
    }
}

/// Spawns action subprocesses
#[derive(Debug)]
pub struct ActionRunner {
    shell: PathBuf,
    cwd: PathBuf,
    env: HashMap<String, String>,
    mode: OutputMode,
}

impl ActionRunner {
    /// Resolve the configured shell and remember how to run commands
    pub fn new(config: &Config, cwd: &Path, mode: OutputMode) -> Result<Self> {
        let shell = which::which(&config.settings.shell).map_err(|e| KilnError::Config {
            path: PathBuf::from(CONFIG_FILE),
            message: format!("shell '{}' not found: {e}", config.settings.shell),
        })?;

        Ok(Self {
            shell,
            cwd: cwd.to_path_buf(),
            env: config.env.clone(),
            mode,
        })
    }

    /// Run `command` for `task`. With `capture` stdout is collected instead
    /// of being shown. A non-zero exit is an `ActionFailed` error.
    pub fn run(&self, task: &str, command: &str, capture: bool) -> Result<ActionOutput> {
        if self.mode == OutputMode::Verbose {
            eprintln!("{} {}", style("$").dim(), style(command).dim());
        }
        debug!(task, command, capture, "spawning action");

        let stdout = if capture {
            Stdio::piped()
        } else if self.mode == OutputMode::Silent {
            Stdio::null()
        } else {
            Stdio::inherit()
        };
        let stderr = if self.mode == OutputMode::Silent {
            Stdio::null()
        } else {
            Stdio::inherit()
        };

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .output()
            .map_err(|e| KilnError::ActionSpawn {
                task: task.to_string(),
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        // killed by a signal
        let code = output.status.code().unwrap_or(-1);
        debug!(task, command, code, "action finished");

        if !output.status.success() {
            return Err(KilnError::ActionFailed {
                task: task.to_string(),
                command: command.to_string(),
                code,
            });
        }

        Ok(ActionOutput::captured(
            code,
            String::from_utf8_lossy(&output.stdout),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(dir: &Path, mode: OutputMode) -> ActionRunner {
        ActionRunner::new(&Config::default(), dir, mode).unwrap()
    }

    #[test]
    fn test_capture_stdout() {
        let temp = tempfile::tempdir().unwrap();
        let out = runner(temp.path(), OutputMode::Silent)
            .run("t", "echo hello", true)
            .unwrap();

        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.value(), Value::Str("hello".into()));
    }

    #[test]
    fn test_runs_in_script_directory_with_config_env() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "here").unwrap();

        let mut config = Config::default();
        config.env.insert("GREETING".into(), "hi".into());
        let runner = ActionRunner::new(&config, temp.path(), OutputMode::Silent).unwrap();

        let out = runner.run("t", "cat marker.txt; echo \" $GREETING\"", true).unwrap();
        assert_eq!(out.value(), Value::Str("here hi".into()));
    }

    #[test]
    fn test_nonzero_exit_is_action_failed() {
        let temp = tempfile::tempdir().unwrap();
        let err = runner(temp.path(), OutputMode::Silent)
            .run("build", "exit 3", false)
            .unwrap_err();

        assert!(matches!(
            err,
            KilnError::ActionFailed { ref task, code: 3, .. } if task == "build"
        ));
    }

    #[test]
    fn test_unknown_shell_is_config_error() {
        let mut config = Config::default();
        config.settings.shell = "definitely-not-a-shell-kiln".into();
        let temp = tempfile::tempdir().unwrap();

        assert!(matches!(
            ActionRunner::new(&config, temp.path(), OutputMode::Regular),
            Err(KilnError::Config { .. })
        ));
    }
}
