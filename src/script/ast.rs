//! Syntax tree of a build script

use std::sync::Arc;

use crate::graph::TaskDef;

/// A parsed build script
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    /// Task definitions in source order
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<TaskDef>> {
        self.statements.iter().filter_map(|stmt| match stmt {
            Stmt::Task(task) => Some(task),
            _ => None,
        })
    }
}

/// A `{ ... }` statement list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub statements: Vec<Stmt>,
}

/// Number of action statements in `statements`, task bodies and nested
/// blocks included (loop bodies count once)
pub fn action_count(statements: &[Stmt]) -> usize {
    statements
        .iter()
        .map(|stmt| match stmt {
            Stmt::Task(task) => action_count(&task.body.statements),
            Stmt::If {
                then_block,
                else_block,
                ..
            } => {
                action_count(&then_block.statements)
                    + else_block
                        .as_ref()
                        .map_or(0, |b| action_count(&b.statements))
            }
            Stmt::ForEach { body, .. } => action_count(&body.statements),
            other => usize::from(other.is_action()),
        })
        .sum()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `task name requires a, b inputs ... outputs ... { ... }`
    Task(Arc<TaskDef>),
    /// `exec name`
    Exec { task: String },
    /// `shell <expr>`
    Shell { command: Expr },
    /// `compile <file> <command>`
    Compile { file: Expr, command: Expr },
    /// `push <expr>`
    Push { value: Expr },
    /// `name = <expr>`
    Assign { name: String, value: Expr },
    /// `name = shell <expr>`: binds the command's trimmed stdout
    Capture { name: String, command: Expr },
    /// `if <expr> { ... } else { ... }`
    If {
        condition: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    /// `foreach <pattern> [var] { ... }`
    ForEach {
        pattern: Expr,
        var: String,
        body: Block,
    },
}

impl Stmt {
    /// Whether the statement spawns a subprocess
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            Stmt::Shell { .. } | Stmt::Compile { .. } | Stmt::Capture { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Num(f64),
    Ident(String),
    /// `$NAME`, or `$?` for the last exit code
    ShellVar(String),
    /// `left ++ right`
    Concat(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn concat(left: Expr, right: Expr) -> Self {
        Expr::Concat(Box::new(left), Box::new(right))
    }
}
