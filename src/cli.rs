//! CLI definition
//!
//! Uses `clap` derive API for argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::action::OutputMode;

/// kiln - scripted builds with dependency-driven parallel actions
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory containing build.kiln
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Discard action output and print nothing but errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub silent: bool,

    /// Echo commands and enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Run only this task (and its dependencies)
    #[arg(short, long, value_name = "NAME")]
    pub task: Option<String>,

    /// Worker threads for actions (0 = number of CPUs, overrides kiln.toml)
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Run every action even if its task is up to date
    #[arg(long)]
    pub force: bool,

    /// List the tasks defined by the script
    #[arg(long, conflicts_with_all = ["task", "dry_run"])]
    pub list: bool,

    /// Show the dependency stages of --task without running anything.
    /// Tasks sharing a stage do not depend on each other.
    #[arg(long, requires = "task")]
    pub dry_run: bool,
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        if self.silent {
            OutputMode::Silent
        } else if self.verbose {
            OutputMode::Verbose
        } else {
            OutputMode::Regular
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults_and_modes() {
        let cli = Cli::parse_from(["kiln"]);
        assert_eq!(cli.path, PathBuf::from("."));
        assert_eq!(cli.output_mode(), OutputMode::Regular);

        let cli = Cli::parse_from(["kiln", "proj", "-v", "-t", "build", "-j", "2"]);
        assert_eq!(cli.output_mode(), OutputMode::Verbose);
        assert_eq!(cli.task.as_deref(), Some("build"));
        assert_eq!(cli.jobs, Some(2));
    }

    #[test]
    fn test_silent_and_verbose_conflict() {
        assert!(Cli::try_parse_from(["kiln", "-s", "-v"]).is_err());
        assert!(Cli::try_parse_from(["kiln", "--dry-run"]).is_err());
    }
}
