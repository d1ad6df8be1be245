//! Error types for kiln
//!
//! Uses `miette` for pretty error reporting with codes and help text.
//! `KilnError` is `Clone` so a completed future can hand the same error
//! to every waiter.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

/// A single parse failure with its source position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}: {}", self.line, self.column, self.message)
    }
}

/// Main error type for kiln operations
#[derive(Error, Diagnostic, Debug, Clone)]
pub enum KilnError {
    #[error("Failed to parse build script ({} error(s)); first: {}", errors.len(), first_issue(errors))]
    #[diagnostic(code(kiln::parse))]
    Parse { errors: Vec<ParseIssue> },

    #[error("Task '{name}' not found")]
    #[diagnostic(
        code(kiln::task::not_found),
        help("Run `kiln --list` to see available tasks")
    )]
    TaskNotFound { name: String, available: Vec<String> },

    #[error("Task '{task}' requires '{dependency}', which is not defined")]
    #[diagnostic(
        code(kiln::task::dependency_not_found),
        help("Check the `requires` list of the task")
    )]
    DependencyNotFound { task: String, dependency: String },

    #[error("Task '{name}' is defined more than once")]
    #[diagnostic(code(kiln::task::duplicate))]
    DuplicateTask { name: String },

    #[error("Circular dependency detected: {cycle}")]
    #[diagnostic(
        code(kiln::task::cycle),
        help("Check the `requires` lists and `exec` statements of these tasks")
    )]
    CycleDetected { cycle: String },

    #[error("Task '{task}' failed: `{command}` exited with code {code}")]
    #[diagnostic(code(kiln::exec::failed))]
    ActionFailed {
        task: String,
        command: String,
        code: i32,
    },

    #[error("Task '{task}' could not start `{command}`: {reason}")]
    #[diagnostic(
        code(kiln::exec::spawn),
        help("Ensure the shell is installed and in your PATH")
    )]
    ActionSpawn {
        task: String,
        command: String,
        reason: String,
    },

    #[error("Task '{task}' declares input '{}', which does not exist", path.display())]
    #[diagnostic(
        code(kiln::task::missing_input),
        help("Mark the input optional with `?` if it may be absent")
    )]
    MissingInput { task: String, path: PathBuf },

    #[error("Cache error: {message}")]
    #[diagnostic(code(kiln::cache))]
    Cache { message: String },

    #[error("Usage error: {message}")]
    #[diagnostic(code(kiln::usage))]
    Usage { message: String },

    #[error("Worker panicked: {message}")]
    #[diagnostic(code(kiln::worker::panic))]
    WorkerPanicked { message: String },

    #[error("Skipped after an earlier failure")]
    #[diagnostic(code(kiln::exec::aborted))]
    Aborted,

    #[error("Evaluation error: {message}")]
    #[diagnostic(code(kiln::eval))]
    Eval { message: String },

    #[error("Invalid configuration in {}: {message}", path.display())]
    #[diagnostic(code(kiln::config))]
    Config { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(Arc<std::io::Error>),

    #[error("Failed to build worker pool: {message}")]
    #[diagnostic(code(kiln::pool))]
    Pool { message: String },
}

fn first_issue(errors: &[ParseIssue]) -> String {
    errors
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl KilnError {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        KilnError::Usage {
            message: message.into(),
        }
    }

    pub(crate) fn eval(message: impl Into<String>) -> Self {
        KilnError::Eval {
            message: message.into(),
        }
    }

    pub(crate) fn cache(message: impl Into<String>) -> Self {
        KilnError::Cache {
            message: message.into(),
        }
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;
