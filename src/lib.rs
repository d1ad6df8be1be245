//! kiln - scripted builds with dependency-driven parallel actions
//!
//! This crate provides both a CLI tool and a library for running build
//! scripts.
//!
//! # Features
//!
//! - **Small build language** - tasks, shell/compile actions, captures, `if`, `foreach`
//! - **Dependency resolution** - `requires` lists, memoized so shared dependencies run once
//! - **Parallel actions** - independent actions run on a bounded worker pool
//! - **Incremental rebuilds** - tasks whose inputs are unchanged are skipped
//!
//! # Example
//!
//! ```text
//! # build.kiln
//! task codegen inputs "schema.json" outputs "gen.h" {
//!     shell "python gen.py schema.json > gen.h"
//! }
//!
//! task build requires codegen inputs "main.c", "gen.h" outputs "app" {
//!     foreach "src/*.c" $src { compile src "cc -c" }
//!     shell "cc -o app *.o"
//! }
//!
//! exec build
//! ```
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use kiln::{parse, Config, OutputMode, Scheduler};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = std::path::Path::new(".");
//!     let program = parse(&std::fs::read_to_string(dir.join("build.kiln"))?)?;
//!
//!     let scheduler = Scheduler::new(dir, Config::load(dir)?, OutputMode::Regular)?;
//!     scheduler.load(&program)?;
//!     scheduler.run_task("build")?;
//!
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod arena;
pub mod cache;
pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod future;
pub mod graph;
pub mod script;

// Re-export main types
pub use action::{ActionOutput, OutputMode};
pub use arena::Arena;
pub use cache::IncrementalCache;
pub use config::Config;
pub use env::{Environment, Value};
pub use error::{KilnError, Result};
pub use executor::{Scheduler, TaskReport, TaskState};
pub use future::{Future, WorkerPool};
pub use graph::{ExecutionPlan, IoDecl, TaskDef, TaskGraph};
pub use script::{parse, Program};
