//! Evaluation context
//!
//! The [`Environment`] is passed to every evaluation call instead of living
//! in globals. It owns the variable map and the task registry, each behind
//! its own lock, since action futures running on the worker pool share it
//! with the evaluating thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::action::ActionOutput;
use crate::error::Result;
use crate::future::Future;
use crate::graph::{TaskDef, TaskGraph};

/// A script value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Str(String),
    Num(f64),
}

impl Value {
    /// Non-empty strings and non-zero numbers are true
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Str(s) => !s.is_empty(),
            Value::Num(n) => *n != 0.0,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Str(s) => f.write_str(s),
            Value::Num(n) if n.is_finite() && n.fract() == 0.0 => write!(f, "{}", *n as i64),
            Value::Num(n) => write!(f, "{n}"),
        }
    }
}

/// What a variable name is bound to
#[derive(Debug, Clone)]
pub enum Binding {
    Ready(Value),
    /// Output of a capture action that may still be running
    Pending(Future<ActionOutput>),
}

impl Binding {
    /// The bound value, blocking on a pending capture
    pub fn resolve(&self) -> Result<Value> {
        match self {
            Binding::Ready(value) => Ok(value.clone()),
            Binding::Pending(future) => future.await_result().map(|out| out.value()),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    vars: RwLock<HashMap<String, Binding>>,
    tasks: RwLock<TaskGraph>,
    last_action: Mutex<Option<Future<ActionOutput>>>,
}

/// Shared variable map and task registry
#[derive(Debug, Clone, Default)]
pub struct Environment {
    inner: Arc<Inner>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Binding> {
        self.inner.vars.read().get(name).cloned()
    }

    /// Bind `name`, returning what it was bound to before
    pub fn set(&self, name: impl Into<String>, binding: Binding) -> Option<Binding> {
        self.inner.vars.write().insert(name.into(), binding)
    }

    pub fn remove(&self, name: &str) -> Option<Binding> {
        self.inner.vars.write().remove(name)
    }

    /// Bind `name` back to `previous`, or unbind it
    pub fn restore(&self, name: &str, previous: Option<Binding>) {
        match previous {
            Some(binding) => {
                self.set(name, binding);
            }
            None => {
                self.remove(name);
            }
        }
    }

    /// The most recently launched action, read by `$?`
    pub fn last_action(&self) -> Option<Future<ActionOutput>> {
        self.inner.last_action.lock().clone()
    }

    pub fn set_last_action(&self, action: Future<ActionOutput>) {
        *self.inner.last_action.lock() = Some(action);
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<TaskDef>> {
        self.inner.tasks.read().get_task(name)
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.inner.tasks.read().has_task(name)
    }

    /// Register a task. Registering the very same definition twice is a no-op.
    pub fn register_task(&self, task: Arc<TaskDef>) -> Result<()> {
        let mut tasks = self.inner.tasks.write();
        if let Some(existing) = tasks.get_task(&task.name) {
            if Arc::ptr_eq(&existing, &task) {
                return Ok(());
            }
        }
        tasks.register_task(task)
    }

    /// Run `f` against the task registry
    pub fn with_tasks<R>(&self, f: impl FnOnce(&TaskGraph) -> R) -> R {
        f(&self.inner.tasks.read())
    }

    /// Check `root`'s dependencies for missing tasks and cycles
    pub fn validate(&self, root: &str) -> Result<()> {
        self.inner.tasks.read().validate(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KilnError;
    use std::thread;

    #[test]
    fn test_truthiness_and_display() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Str("0".into()).is_truthy());
        assert!(!Value::Num(0.0).is_truthy());
        assert!(Value::Num(2.5).is_truthy());

        assert_eq!(Value::Num(3.0).to_string(), "3");
        assert_eq!(Value::Num(2.5).to_string(), "2.5");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn test_restore_previous_binding() {
        let env = Environment::new();
        env.set("it", Binding::Ready(Value::Str("outer".into())));

        let previous = env.set("it", Binding::Ready(Value::Str("inner".into())));
        env.restore("it", previous);
        assert_eq!(env.get("it").unwrap().resolve().unwrap(), Value::Str("outer".into()));

        let previous = env.set("fresh", Binding::Ready(Value::Num(1.0)));
        env.restore("fresh", previous);
        assert!(env.get("fresh").is_none());
    }

    #[test]
    fn test_pending_binding_blocks_until_capture_completes() {
        let env = Environment::new();
        let capture = Future::pending();
        env.set("out", Binding::Pending(capture.clone()));

        let reader = {
            let env = env.clone();
            thread::spawn(move || env.get("out").unwrap().resolve().unwrap())
        };
        capture.complete(Ok(ActionOutput::captured(0, "hello\n")));

        assert_eq!(reader.join().unwrap(), Value::Str("hello".into()));
    }

    #[test]
    fn test_concurrent_writers() {
        let env = Environment::new();
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let env = env.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        env.set(format!("v{i}_{j}"), Binding::Ready(Value::Num(j as f64)));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert!(env.get("v7_99").is_some());
    }

    #[test]
    fn test_task_registry() {
        let env = Environment::new();
        let task = Arc::new(TaskDef::new("build"));
        env.register_task(Arc::clone(&task)).unwrap();
        env.register_task(Arc::clone(&task)).unwrap();
        assert!(env.has_task("build"));

        assert!(matches!(
            env.register_task(Arc::new(TaskDef::new("build"))),
            Err(KilnError::DuplicateTask { .. })
        ));
        assert_eq!(env.with_tasks(|g| g.len()), 1);
    }
}
