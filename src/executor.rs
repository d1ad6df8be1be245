//! Task scheduler and statement evaluator
//!
//! Statements are evaluated in order on the calling thread. Every action
//! (`shell`, `compile`, capture) becomes a [`Future`] queued on the worker
//! pool and added to the wave [`Arena`] of the task being evaluated, so
//! independent actions run side by side. An action whose command reads a
//! captured variable gets the capture's future as a dependency instead of
//! blocking the evaluator.
//!
//! Task invocations are memoized per run: a task reached through several
//! paths runs once. Once any action fails no new action starts, work that
//! is already running finishes, and the run reports the first failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::action::{ActionOutput, ActionRunner, OutputMode};
use crate::arena::Arena;
use crate::cache::{Freshness, IncrementalCache};
use crate::config::Config;
use crate::env::{Binding, Environment, Value};
use crate::error::{KilnError, Result};
use crate::future::{Future, WorkerPool};
use crate::graph::TaskDef;
use crate::script::ast::{action_count, Block, Expr, Program, Stmt};

/// Owner name used for actions outside any task
const TOP_LEVEL: &str = "<top-level>";

/// Lifecycle of one task invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    ResolvingDeps,
    Running,
    Succeeded,
    Failed,
}

/// Outcome of a successful task invocation
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub name: String,
    /// Actions launched by the body (skipped ones included)
    pub actions: usize,
    /// The incremental cache found the task fresh
    pub up_to_date: bool,
    pub duration: Duration,
}

/// Shared "stop launching work" flag plus the first failure seen
#[derive(Debug, Default)]
struct AbortSignal {
    set: AtomicBool,
    first: Mutex<Option<KilnError>>,
}

impl AbortSignal {
    fn fail(&self, err: &KilnError) {
        let mut first = self.first.lock();
        if first.is_none() && !matches!(err, KilnError::Aborted) {
            *first = Some(err.clone());
        }
        self.set.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    fn first(&self) -> Option<KilnError> {
        self.first.lock().clone()
    }

    fn reset(&self) {
        *self.first.lock() = None;
        self.set.store(false, Ordering::SeqCst);
    }
}

enum Piece {
    Text(String),
    /// Trimmed stdout of dependency N
    Stdout(usize),
    /// Exit code of dependency N
    ExitCode(usize),
}

/// A command string whose pieces may come from other actions
#[derive(Default)]
struct Template {
    pieces: Vec<Piece>,
    deps: Vec<Future<ActionOutput>>,
}

impl Template {
    fn text(&mut self, text: impl Into<String>) {
        self.pieces.push(Piece::Text(text.into()));
    }

    fn dep(&mut self, future: Future<ActionOutput>, exit_code: bool) {
        let idx = self.deps.len();
        self.deps.push(future);
        self.pieces.push(if exit_code {
            Piece::ExitCode(idx)
        } else {
            Piece::Stdout(idx)
        });
    }

    fn render(pieces: &[Piece], outputs: &[ActionOutput]) -> String {
        pieces
            .iter()
            .map(|piece| match piece {
                Piece::Text(text) => text.clone(),
                Piece::Stdout(idx) => outputs[*idx].value().to_string(),
                Piece::ExitCode(idx) => outputs[*idx].exit_code.to_string(),
            })
            .collect()
    }
}

/// Waves of one task invocation. `exec` starts a new head, `foreach`
/// iterations chain onto the tail of the current one.
struct Frame {
    task: String,
    up_to_date: bool,
    heads: Vec<Arena<ActionOutput>>,
    tail: Arena<ActionOutput>,
    actions: usize,
}

impl Frame {
    fn new(task: &str, up_to_date: bool) -> Result<Self> {
        let wave = Arena::new(None)?;
        Ok(Self {
            task: task.to_string(),
            up_to_date,
            heads: vec![wave.clone()],
            tail: wave,
            actions: 0,
        })
    }

    fn add(&mut self, action: Future<ActionOutput>) -> Result<()> {
        self.tail.add_future(action)?;
        self.actions += 1;
        Ok(())
    }

    fn chain(&mut self) -> Result<()> {
        self.tail = self.tail.chain()?;
        Ok(())
    }

    /// Wait for the current wave and start a new one
    fn barrier(&mut self) -> Result<()> {
        if let Some(head) = self.heads.last() {
            head.join()?;
        }
        let next = Arena::new(None)?;
        self.heads.push(next.clone());
        self.tail = next;
        Ok(())
    }

    /// Wait for every wave, even after a failure, and release them
    fn finish(self) -> Result<usize> {
        let outcomes: Vec<_> = self.heads.iter().map(Arena::join).collect();
        for head in self.heads {
            head.destroy();
        }
        for outcome in outcomes {
            outcome?;
        }
        Ok(self.actions)
    }
}

/// Runs tasks and top-level statements of a build script
pub struct Scheduler {
    root: PathBuf,
    mode: OutputMode,
    force: bool,
    vars: HashMap<String, String>,
    pool: WorkerPool,
    runner: Arc<ActionRunner>,
    cache: IncrementalCache,
    env: Environment,
    abort: Arc<AbortSignal>,
    memo: Mutex<HashMap<String, Future<TaskReport>>>,
    states: Mutex<HashMap<String, TaskState>>,
    /// Tasks currently being resolved, outermost first
    stack: Mutex<Vec<String>>,
    pushed: Mutex<Vec<String>>,
    launched: AtomicUsize,
    total: AtomicUsize,
    /// One run at a time
    running: Mutex<()>,
}

impl Scheduler {
    /// Create a scheduler for a script living in `root`
    pub fn new(root: &Path, config: Config, mode: OutputMode) -> Result<Self> {
        let root = std::fs::canonicalize(root)?;
        let pool = WorkerPool::new(config.settings.workers)?;
        let runner = ActionRunner::new(&config, &root, mode)?;
        let cache = IncrementalCache::load(
            config.work_dir(&root),
            &root,
            config.settings.hash_inputs,
        );
        debug!(root = %root.display(), workers = pool.size(), "scheduler ready");

        Ok(Self {
            root,
            mode,
            force: false,
            vars: config.env,
            pool,
            runner: Arc::new(runner),
            cache,
            env: Environment::new(),
            abort: Arc::new(AbortSignal::default()),
            memo: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            stack: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
            launched: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            running: Mutex::new(()),
        })
    }

    /// Ignore the incremental cache; every action runs
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn cache(&self) -> &IncrementalCache {
        &self.cache
    }

    /// Values printed by `push`, in evaluation order
    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().clone()
    }

    pub fn task_state(&self, name: &str) -> TaskState {
        self.states
            .lock()
            .get(name)
            .copied()
            .unwrap_or(TaskState::NotStarted)
    }

    /// Register every task of `program` without running anything
    pub fn load(&self, program: &Program) -> Result<()> {
        for task in program.tasks() {
            self.env.register_task(Arc::clone(task))?;
        }
        Ok(())
    }

    /// Run one task after its transitive dependencies
    pub fn run_task(&self, name: &str) -> Result<TaskReport> {
        let _running = self.running.lock();
        self.begin_run();

        let result = self
            .env
            .with_tasks(|graph| graph.execution_order(name))
            .and_then(|order| {
                let total = order
                    .iter()
                    .map(|task| action_count(&task.body.statements))
                    .sum();
                self.total.store(total, Ordering::Relaxed);
                self.resolve(name)
            });

        self.end_run(result)
    }

    /// Register all tasks, then evaluate the top-level statements in order
    pub fn run_all(&self, program: &Program) -> Result<()> {
        let _running = self.running.lock();
        self.begin_run();
        self.total
            .store(action_count(&program.statements), Ordering::Relaxed);

        let result = self.load(program).and_then(|()| {
            let mut frame = Frame::new(TOP_LEVEL, false)?;
            let evaluated = self.eval_block(&program.statements, &mut frame);
            let finished = frame.finish();
            evaluated.and(finished).map(|_| ())
        });

        self.end_run(result)
    }

    fn begin_run(&self) {
        self.abort.reset();
        self.memo.lock().clear();
        self.states.lock().clear();
        self.stack.lock().clear();
        self.launched.store(0, Ordering::Relaxed);
    }

    fn end_run<T>(&self, result: Result<T>) -> Result<T> {
        let result = match (result, self.abort.first()) {
            (Err(_), Some(first)) | (Ok(_), Some(first)) => Err(first),
            (result, None) => result,
        };

        match result {
            Ok(value) => {
                if let Err(e) = self.cache.save() {
                    warn!(error = %e, "failed to save incremental cache");
                }
                debug!(actions = self.launched.load(Ordering::Relaxed), "run finished");
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "run failed, incremental cache left untouched");
                Err(e)
            }
        }
    }

    /// Run `name` unless this run already did (or is doing) it
    fn resolve(&self, name: &str) -> Result<TaskReport> {
        let memoized = self.memo.lock().get(name).cloned();
        if let Some(report) = memoized {
            // still pending means it is somewhere up our own stack
            if !report.is_done() {
                return Err(KilnError::CycleDetected {
                    cycle: self.describe_cycle(name),
                });
            }
            debug!(task = name, "reusing earlier invocation");
            return report.await_result();
        }

        let task = self.env.get_task(name).ok_or_else(|| KilnError::TaskNotFound {
            name: name.to_string(),
            available: self
                .env
                .with_tasks(|graph| graph.task_names().map(String::from).collect()),
        })?;

        let report = Future::pending();
        self.memo.lock().insert(name.to_string(), report.clone());
        self.stack.lock().push(name.to_string());
        let outcome = self.invoke(&task);
        self.stack.lock().pop();

        match &outcome {
            Ok(r) => {
                self.set_state(name, TaskState::Succeeded);
                info!(
                    task = name,
                    actions = r.actions,
                    up_to_date = r.up_to_date,
                    "task finished in {:.2}s",
                    r.duration.as_secs_f64()
                );
            }
            Err(e) => {
                self.set_state(name, TaskState::Failed);
                self.abort.fail(e);
            }
        }
        report.complete(outcome.clone());
        outcome
    }

    fn invoke(&self, task: &Arc<TaskDef>) -> Result<TaskReport> {
        let started = Instant::now();

        self.set_state(&task.name, TaskState::ResolvingDeps);
        for dep in &task.dependencies {
            if !self.env.has_task(dep) {
                return Err(KilnError::DependencyNotFound {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
            self.resolve(dep)?;
        }
        self.check_abort()?;

        self.set_state(&task.name, TaskState::Running);
        let snapshot = if task.is_tracked() {
            Some(self.cache.snapshot(task)?)
        } else {
            None
        };
        let up_to_date = self.is_up_to_date(task)?;

        let mut frame = Frame::new(&task.name, up_to_date)?;
        let evaluated = self.eval_block(&task.body.statements, &mut frame);
        let actions = evaluated.and(frame.finish())?;

        if let Some(snapshot) = snapshot {
            self.cache.commit(&task.name, snapshot);
        }

        Ok(TaskReport {
            name: task.name.clone(),
            actions,
            up_to_date,
            duration: started.elapsed(),
        })
    }

    fn is_up_to_date(&self, task: &TaskDef) -> Result<bool> {
        if self.force {
            return Ok(false);
        }
        match self.cache.check(task)? {
            Freshness::Fresh => {
                info!(task = %task.name, "up to date, skipping actions");
                Ok(true)
            }
            Freshness::Stale(reason) => {
                debug!(task = %task.name, %reason, "task is stale");
                Ok(false)
            }
        }
    }

    fn set_state(&self, task: &str, state: TaskState) {
        debug!(task, ?state, "task state");
        self.states.lock().insert(task.to_string(), state);
    }

    fn describe_cycle(&self, name: &str) -> String {
        let stack = self.stack.lock();
        let start = stack.iter().position(|t| t == name).unwrap_or(0);
        stack[start..]
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(name))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.is_set() {
            Err(KilnError::Aborted)
        } else {
            Ok(())
        }
    }

    fn eval_block(&self, statements: &[Stmt], frame: &mut Frame) -> Result<()> {
        for stmt in statements {
            self.check_abort()?;
            // queued actions must not start once evaluation has failed
            self.eval_stmt(stmt, frame)
                .inspect_err(|e| self.abort.fail(e))?;
        }
        Ok(())
    }

    fn eval_stmt(&self, stmt: &Stmt, frame: &mut Frame) -> Result<()> {
        match stmt {
            // registered before evaluation starts
            Stmt::Task(_) => Ok(()),

            Stmt::Exec { task } => {
                self.env.validate(task)?;
                frame.barrier()?;
                self.resolve(task).map(|_| ())
            }

            Stmt::Shell { command } => {
                let command = self.template(command)?;
                self.launch(frame, command, false).map(|_| ())
            }

            Stmt::Compile { file, command } => {
                let file = self.root.join(self.eval_value(file)?.to_string());
                let mut command = self.template(command)?;
                command.text(format!(" {}", file.display()));
                self.launch(frame, command, false).map(|_| ())
            }

            Stmt::Capture { name, command } => {
                let command = self.template(command)?;
                let output = self.launch(frame, command, true)?;
                self.env.set(name.clone(), Binding::Pending(output));
                Ok(())
            }

            Stmt::Push { value } => {
                let text = self.eval_value(value)?.to_string();
                if self.mode != OutputMode::Silent {
                    println!("{text}");
                }
                self.pushed.lock().push(text);
                Ok(())
            }

            Stmt::Assign { name, value } => {
                let value = self.eval_value(value)?;
                self.env.set(name.clone(), Binding::Ready(value));
                Ok(())
            }

            Stmt::If {
                condition,
                then_block,
                else_block,
            } => {
                if self.eval_value(condition)?.is_truthy() {
                    self.eval_block(&then_block.statements, frame)
                } else if let Some(block) = else_block {
                    self.eval_block(&block.statements, frame)
                } else {
                    Ok(())
                }
            }

            Stmt::ForEach { pattern, var, body } => {
                let pattern = self.eval_value(pattern)?.to_string();
                let items = self.expand_items(&pattern)?;
                debug!(%pattern, items = items.len(), "foreach");

                let previous = self.env.get(var);
                let outcome = self.eval_iterations(items, var, body, frame);
                self.env.restore(var, previous);
                outcome
            }
        }
    }

    fn eval_iterations(
        &self,
        items: Vec<String>,
        var: &str,
        body: &Block,
        frame: &mut Frame,
    ) -> Result<()> {
        for item in items {
            frame.chain()?;
            self.env.set(var, Binding::Ready(Value::Str(item)));
            self.eval_block(&body.statements, frame)?;
        }
        Ok(())
    }

    /// Glob matches (relative to the script directory) when `pattern` has
    /// wildcards, otherwise its whitespace-separated words
    fn expand_items(&self, pattern: &str) -> Result<Vec<String>> {
        if !pattern.contains(['*', '?', '[']) {
            return Ok(pattern.split_whitespace().map(String::from).collect());
        }

        let full = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            let root = self.root.to_string_lossy();
            format!("{}/{}", glob::Pattern::escape(&root), pattern)
        };

        let entries = glob::glob(&full)
            .map_err(|e| KilnError::eval(format!("invalid pattern '{pattern}': {e}")))?;

        let mut items = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| KilnError::from(std::io::Error::from(e)))?;
            let shown = path.strip_prefix(&self.root).unwrap_or(&path);
            items.push(shown.display().to_string());
        }
        Ok(items)
    }

    /// Queue an action in the current wave
    fn launch(
        &self,
        frame: &mut Frame,
        command: Template,
        capture: bool,
    ) -> Result<Future<ActionOutput>> {
        let action = if frame.up_to_date && !capture {
            debug!(task = %frame.task, "skipping action of up-to-date task");
            Future::ready(ActionOutput::skipped())
        } else {
            let Template { pieces, deps } = command;
            let runner = Arc::clone(&self.runner);
            let abort = Arc::clone(&self.abort);
            let task = frame.task.clone();

            Future::new(&self.pool, deps, move |outputs| {
                if abort.is_set() {
                    return Err(KilnError::Aborted);
                }
                let command = Template::render(&pieces, &outputs);
                runner
                    .run(&task, &command, capture)
                    .inspect_err(|e| abort.fail(e))
            })
        };

        frame.add(action.clone())?;
        self.env.set_last_action(action.clone());

        let launched = self.launched.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            task = %frame.task,
            "[{launched}/{}] action queued",
            self.total.load(Ordering::Relaxed)
        );
        Ok(action)
    }

    fn template(&self, expr: &Expr) -> Result<Template> {
        let mut template = Template::default();
        self.build_template(expr, &mut template)?;
        Ok(template)
    }

    fn build_template(&self, expr: &Expr, template: &mut Template) -> Result<()> {
        match expr {
            Expr::Concat(left, right) => {
                self.build_template(left, template)?;
                self.build_template(right, template)
            }
            Expr::Ident(name) => {
                match self.lookup(name)? {
                    Binding::Pending(output) => template.dep(output, false),
                    Binding::Ready(value) => template.text(value.to_string()),
                }
                Ok(())
            }
            Expr::ShellVar(name) if name == "?" => {
                match self.env.last_action() {
                    Some(action) => template.dep(action, true),
                    None => template.text("0"),
                }
                Ok(())
            }
            other => {
                template.text(self.eval_value(other)?.to_string());
                Ok(())
            }
        }
    }

    /// Evaluate an expression now, blocking on any capture it reads
    fn eval_value(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Ident(name) => self.lookup(name)?.resolve(),
            Expr::ShellVar(name) if name == "?" => match self.env.last_action() {
                Some(action) => Ok(Value::Num(f64::from(action.await_result()?.exit_code))),
                None => Ok(Value::Num(0.0)),
            },
            Expr::ShellVar(name) => Ok(Value::Str(self.shell_var(name))),
            Expr::Concat(left, right) => Ok(Value::Str(format!(
                "{}{}",
                self.eval_value(left)?,
                self.eval_value(right)?
            ))),
        }
    }

    fn lookup(&self, name: &str) -> Result<Binding> {
        self.env
            .get(name)
            .ok_or_else(|| KilnError::eval(format!("undefined variable '{name}'")))
    }

    /// `[env]` from the config first, then the process environment
    fn shell_var(&self, name: &str) -> String {
        self.vars
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
            .unwrap_or_default()
    }
}
