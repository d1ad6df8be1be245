//! Recursive-descent parser for build scripts
//!
//! All errors are collected; after a bad statement the parser skips ahead
//! to the next statement keyword or closing brace and keeps going.

use std::sync::Arc;

use crate::error::{KilnError, ParseIssue, Result};
use crate::graph::{IoDecl, TaskDef};
use crate::script::ast::{Block, Expr, Program, Stmt};
use crate::script::lexer::{tokenize, Token, TokenKind};

const STATEMENT_KEYWORDS: &[&str] = &[
    "task", "exec", "shell", "compile", "push", "if", "foreach",
];

/// Parse a whole build script
pub fn parse(source: &str) -> Result<Program> {
    let (tokens, mut issues) = tokenize(source);
    let mut parser = Parser {
        tokens,
        pos: 0,
        issues: Vec::new(),
    };

    let program = parser.parse_program();
    issues.append(&mut parser.issues);

    if issues.is_empty() {
        Ok(program)
    } else {
        issues.sort_by_key(|i| (i.line, i.column));
        Err(KilnError::Parse { errors: issues })
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    issues: Vec<ParseIssue>,
}

type Parsed<T> = std::result::Result<T, ParseIssue>;

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize() guarantees a trailing Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(name) if name == word)
    }

    fn error<T>(&self, token: &Token, message: impl Into<String>) -> Parsed<T> {
        Err(ParseIssue {
            line: token.line,
            column: token.column,
            message: message.into(),
        })
    }

    fn expect(&mut self, kind: TokenKind) -> Parsed<Token> {
        let token = self.advance();
        if token.kind == kind {
            Ok(token)
        } else {
            self.error(
                &token,
                format!("expected {}, got {}", kind.describe(), token.kind.describe()),
            )
        }
    }

    fn expect_ident(&mut self, what: &str) -> Parsed<String> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(name) => Ok(name),
            ref other => self.error(&token, format!("expected {what}, got {}", other.describe())),
        }
    }

    fn synchronize(&mut self) {
        loop {
            match &self.peek().kind {
                TokenKind::Eof | TokenKind::RBrace => return,
                TokenKind::Ident(name) if STATEMENT_KEYWORDS.contains(&name.as_str()) => return,
                TokenKind::Ident(_) if *self.peek_at(1) == TokenKind::Assign => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn parse_program(&mut self) -> Program {
        let mut statements = Vec::new();
        while self.peek().kind != TokenKind::Eof {
            if self.peek().kind == TokenKind::RBrace {
                let token = self.advance();
                self.issues.push(ParseIssue {
                    line: token.line,
                    column: token.column,
                    message: "unexpected '}'".to_string(),
                });
                continue;
            }
            self.statement_into(&mut statements, true);
        }
        Program { statements }
    }

    fn statement_into(&mut self, statements: &mut Vec<Stmt>, top_level: bool) {
        let start = self.pos;
        match self.parse_statement(top_level) {
            Ok(stmt) => statements.push(stmt),
            Err(issue) => {
                self.issues.push(issue);
                if self.pos == start {
                    self.advance();
                }
                self.synchronize();
            }
        }
    }

    fn parse_statement(&mut self, top_level: bool) -> Parsed<Stmt> {
        let token = self.peek().clone();
        let TokenKind::Ident(word) = &token.kind else {
            self.advance();
            return self.error(
                &token,
                format!("expected a statement, got {}", token.kind.describe()),
            );
        };

        if *self.peek_at(1) == TokenKind::Assign {
            let name = word.clone();
            self.advance();
            self.advance();
            if self.at_keyword("shell") {
                self.advance();
                let command = self.parse_expr()?;
                return Ok(Stmt::Capture { name, command });
            }
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign { name, value });
        }

        match word.as_str() {
            "task" if top_level => self.parse_task().map(|t| Stmt::Task(Arc::new(t))),
            "task" => {
                self.advance();
                self.error(&token, "tasks can only be defined at the top level")
            }
            "exec" => {
                self.advance();
                let task = self.expect_ident("a task name")?;
                Ok(Stmt::Exec { task })
            }
            "shell" => {
                self.advance();
                Ok(Stmt::Shell {
                    command: self.parse_expr()?,
                })
            }
            "compile" => {
                self.advance();
                let file = self.parse_expr()?;
                let command = self.parse_expr()?;
                Ok(Stmt::Compile { file, command })
            }
            "push" => {
                self.advance();
                Ok(Stmt::Push {
                    value: self.parse_expr()?,
                })
            }
            "if" => self.parse_if(),
            "foreach" => self.parse_foreach(),
            _ => {
                self.advance();
                self.error(&token, format!("unknown statement '{word}'"))
            }
        }
    }

    fn parse_task(&mut self) -> Parsed<TaskDef> {
        self.advance(); // task
        let name = self.expect_ident("a task name")?;
        let mut task = TaskDef::new(name);

        if self.at_keyword("requires") {
            self.advance();
            task.dependencies.push(self.expect_ident("a dependency name")?);
            while self.peek().kind == TokenKind::Comma {
                self.advance();
                task.dependencies.push(self.expect_ident("a dependency name")?);
            }
        }
        if self.at_keyword("inputs") {
            self.advance();
            task.inputs = self.parse_decls()?;
        }
        if self.at_keyword("outputs") {
            self.advance();
            task.outputs = self.parse_decls()?;
        }

        task.body = self.parse_block()?;
        Ok(task)
    }

    fn parse_decls(&mut self) -> Parsed<Vec<IoDecl>> {
        let mut decls = vec![self.parse_decl()?];
        while self.peek().kind == TokenKind::Comma {
            self.advance();
            decls.push(self.parse_decl()?);
        }
        Ok(decls)
    }

    fn parse_decl(&mut self) -> Parsed<IoDecl> {
        let token = self.advance();
        let path = match token.kind {
            TokenKind::Str(path) => path,
            ref other => {
                return self.error(
                    &token,
                    format!("expected a quoted path, got {}", other.describe()),
                )
            }
        };

        let mut decl = IoDecl::new(path);
        if self.peek().kind == TokenKind::Question {
            self.advance();
            decl.optional = true;
        }
        if self.at_keyword("hash") {
            self.advance();
            let token = self.advance();
            match token.kind {
                TokenKind::Str(digest) => decl.hash = Some(digest),
                ref other => {
                    return self.error(
                        &token,
                        format!("expected a quoted hash, got {}", other.describe()),
                    )
                }
            }
        }
        Ok(decl)
    }

    fn parse_block(&mut self) -> Parsed<Block> {
        self.expect(TokenKind::LBrace)?;
        let mut statements = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::RBrace => {
                    self.advance();
                    return Ok(Block { statements });
                }
                TokenKind::Eof => {
                    let token = self.peek().clone();
                    return self.error(&token, "expected '}', got end of file");
                }
                _ => self.statement_into(&mut statements, false),
            }
        }
    }

    fn parse_if(&mut self) -> Parsed<Stmt> {
        self.advance(); // if
        let condition = self.parse_expr()?;
        let then_block = self.parse_block()?;
        let else_block = if self.at_keyword("else") {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(Stmt::If {
            condition,
            then_block,
            else_block,
        })
    }

    fn parse_foreach(&mut self) -> Parsed<Stmt> {
        self.advance(); // foreach
        let token = self.advance();
        let pattern = match token.kind {
            TokenKind::Str(text) => Expr::Str(text),
            TokenKind::Ident(name) => Expr::Ident(name),
            ref other => {
                return self.error(
                    &token,
                    format!("expected a string or identifier, got {}", other.describe()),
                )
            }
        };

        if self.peek().kind == TokenKind::Dollar {
            self.advance();
        }
        let var = match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                name
            }
            _ => "it".to_string(),
        };

        let body = self.parse_block()?;
        Ok(Stmt::ForEach { pattern, var, body })
    }

    fn parse_expr(&mut self) -> Parsed<Expr> {
        let left = self.parse_primary()?;
        if self.peek().kind == TokenKind::Concat {
            self.advance();
            let right = self.parse_expr()?;
            return Ok(Expr::concat(left, right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Parsed<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::Str(text) => Ok(Expr::Str(text)),
            TokenKind::Number(ref text) => match text.parse::<f64>() {
                Ok(n) => Ok(Expr::Num(n)),
                Err(_) => self.error(&token, format!("invalid number '{text}'")),
            },
            TokenKind::Ident(name) => Ok(Expr::Ident(name)),
            TokenKind::Dollar => {
                let next = self.advance();
                match next.kind {
                    TokenKind::Question => Ok(Expr::ShellVar("?".to_string())),
                    TokenKind::Ident(name) => Ok(Expr::ShellVar(name)),
                    ref other => self.error(
                        &next,
                        format!("expected a variable name after '$', got {}", other.describe()),
                    ),
                }
            }
            ref other => self.error(
                &token,
                format!("expected an expression, got {}", other.describe()),
            ),
        }
    }
}
