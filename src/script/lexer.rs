//! Tokenizer for build scripts
//!
//! Newlines are insignificant; `#` starts a comment that runs to the end of
//! the line. Identifiers may contain `-` and `.` so file-ish names lex whole.

use crate::error::ParseIssue;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Number(String),
    /// `=`
    Assign,
    /// `++`
    Concat,
    /// `$`
    Dollar,
    /// `?`
    Question,
    Comma,
    LBrace,
    RBrace,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier '{name}'"),
            TokenKind::Str(_) => "string".to_string(),
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Assign => "'='".to_string(),
            TokenKind::Concat => "'++'".to_string(),
            TokenKind::Dollar => "'$'".to_string(),
            TokenKind::Question => "'?'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::Eof => "end of file".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
    issues: Vec<ParseIssue>,
}

/// Split `source` into tokens. The token list always ends with `Eof`.
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<ParseIssue>) {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
        issues: Vec::new(),
    };

    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            break;
        }
    }
    (tokens, lexer.issues)
}

impl Lexer<'_> {
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn issue(&mut self, line: usize, column: usize, message: String) {
        self.issues.push(ParseIssue {
            line,
            column,
            message,
        });
    }

    fn next_token(&mut self) -> Token {
        loop {
            self.skip_trivia();

            let (line, column) = (self.line, self.column);
            let token = |kind| Token { kind, line, column };

            let Some(c) = self.bump() else {
                return token(TokenKind::Eof);
            };

            let kind = match c {
                '"' | '\'' => TokenKind::Str(self.read_string(c, line, column)),
                '=' => TokenKind::Assign,
                '$' => TokenKind::Dollar,
                '?' => TokenKind::Question,
                ',' => TokenKind::Comma,
                '{' => TokenKind::LBrace,
                '}' => TokenKind::RBrace,
                '+' if self.chars.peek() == Some(&'+') => {
                    self.bump();
                    TokenKind::Concat
                }
                c if c.is_ascii_digit() => TokenKind::Number(self.read_number(c)),
                c if c.is_alphabetic() || c == '_' => TokenKind::Ident(self.read_ident(c)),
                other => {
                    self.issue(line, column, format!("unexpected character '{other}'"));
                    continue;
                }
            };
            return token(kind);
        }
    }

    /// Whitespace, `;` separators and comments
    fn skip_trivia(&mut self) {
        while let Some(c) = self.chars.peek() {
            match c {
                c if c.is_whitespace() || *c == ';' => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.chars.peek() {
                        if *c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn read_string(&mut self, quote: char, line: usize, column: usize) -> String {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => {
                    self.issue(line, column, "unterminated string".to_string());
                    return text;
                }
                Some(c) if c == quote => return text,
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(c) => text.push(c),
                    None => {
                        self.issue(line, column, "unterminated string".to_string());
                        return text;
                    }
                },
                Some(c) => text.push(c),
            }
        }
    }

    fn read_number(&mut self, first: char) -> String {
        let mut text = String::from(first);
        while let Some(c) = self.chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                text.push(*c);
                self.bump();
            } else {
                break;
            }
        }
        text
    }

    fn read_ident(&mut self, first: char) -> String {
        let mut text = String::from(first);
        while let Some(c) = self.chars.peek() {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                text.push(*c);
                self.bump();
            } else {
                break;
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, issues) = tokenize(source);
        assert!(issues.is_empty(), "{issues:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_task_header() {
        assert_eq!(
            kinds("task build requires lib-a, gen.h {"),
            vec![
                TokenKind::Ident("task".into()),
                TokenKind::Ident("build".into()),
                TokenKind::Ident("requires".into()),
                TokenKind::Ident("lib-a".into()),
                TokenKind::Comma,
                TokenKind::Ident("gen.h".into()),
                TokenKind::LBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_comments_and_operators() {
        assert_eq!(
            kinds("# header\nx = 'a\\'b' ++ $HOME ++ $? # trailing\n"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Str("a'b".into()),
                TokenKind::Concat,
                TokenKind::Dollar,
                TokenKind::Ident("HOME".into()),
                TokenKind::Concat,
                TokenKind::Dollar,
                TokenKind::Question,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_positions_are_tracked() {
        let (tokens, _) = tokenize("task a {\n  push 1.5\n}");
        let push = &tokens[3];
        assert_eq!(push.kind, TokenKind::Ident("push".into()));
        assert_eq!((push.line, push.column), (2, 3));
        assert_eq!(tokens[4].kind, TokenKind::Number("1.5".into()));
    }

    #[test]
    fn test_long_run_of_bad_characters() {
        let (tokens, issues) = tokenize(&"@".repeat(200_000));
        assert_eq!(issues.len(), 200_000);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
    }

    #[test]
    fn test_unterminated_string_is_reported() {
        let (_, issues) = tokenize("push \"oops");
        assert_eq!(issues.len(), 1);
        assert_eq!((issues[0].line, issues[0].column), (1, 6));
    }
}
