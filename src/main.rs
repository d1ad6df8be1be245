//! kiln - scripted builds with dependency-driven parallel actions
//!
//! Reads `build.kiln` from the given directory and runs it:
//! - every top-level statement by default
//! - a single task and its dependencies with `--task`

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use console::style;

use kiln::cli::Cli;
use kiln::config::{Config, SCRIPT_FILE};
use kiln::error::Result;
use kiln::graph::{ExecutionPlan, TaskGraph};
use kiln::script::{parse, Program};
use kiln::Scheduler;

fn main() -> ExitCode {
    // Set up panic handler for nice error messages
    miette::set_panic_hook();

    let cli = Cli::parse();

    // Initialize logging; --verbose lowers the default level, RUST_LOG still wins
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:?}", style("error").red().bold(), miette::Report::new(e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let dir = cli.path.as_path();
    let program = load_program(dir)?;

    if cli.list {
        print_task_list(&TaskGraph::from_program(&program)?);
        return Ok(());
    }

    let mut config = Config::load(dir)?;
    if let Some(jobs) = cli.jobs {
        config.settings.workers = jobs;
    }

    if cli.dry_run {
        let graph = TaskGraph::from_program(&program)?;
        if let Some(task) = &cli.task {
            print_dry_run(&ExecutionPlan::from_order(&graph.execution_order(task)?));
        }
        return Ok(());
    }

    let scheduler = Scheduler::new(dir, config, cli.output_mode())?.with_force(cli.force);
    match &cli.task {
        Some(task) => {
            scheduler.load(&program)?;
            scheduler.run_task(task).map(|_| ())
        }
        None => scheduler.run_all(&program),
    }
}

fn load_program(dir: &Path) -> Result<Program> {
    let path = dir.join(SCRIPT_FILE);
    let source = std::fs::read_to_string(&path).map_err(|e| {
        std::io::Error::new(e.kind(), format!("cannot read {}: {e}", path.display()))
    })?;
    parse(&source)
}

fn print_task_list(graph: &TaskGraph) {
    println!("{}", style("Available tasks:").bold());
    println!();

    let mut names: Vec<_> = graph.task_names().collect();
    names.sort();
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0);

    for name in names {
        print!("  {}", style(name).cyan().bold());
        if let Some(deps) = graph.dependencies(name).filter(|d| !d.is_empty()) {
            print!(
                "{}  {}",
                " ".repeat(width - name.len()),
                style(format!("[requires: {}]", deps.join(", "))).yellow().dim()
            );
        }
        println!();
    }
}

fn print_dry_run(plan: &ExecutionPlan) {
    println!("{}", style("Execution plan (dry run):").bold().cyan());
    println!();

    for (i, stage) in plan.stages.iter().enumerate() {
        println!(
            "{} {}",
            style(format!("Stage {}:", i + 1)).bold(),
            stage
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        for task in stage {
            for input in &task.inputs {
                println!("    {} {}", style("in").dim(), input.path);
            }
            for output in &task.outputs {
                println!("    {} {}", style("out").dim(), output.path);
            }
        }
    }
}
