//! Condition expression language
//!
//! A small boolean expression evaluated against the run context at
//! graph-build time, e.g. `branch == "main" && event == "push"` or
//! `tag ~= "v[0-9]+\\..*"`. The grammar:
//!
//! ```text
//! expr       := or
//! or         := and ("||" and)*
//! and        := unary ("&&" unary)*
//! unary      := "!" unary | comparison
//! comparison := primary (("==" | "!=" | "~=") primary)?
//! primary    := "(" expr ")" | string | "true" | "false" | field
//! field      := branch | event | tag | sha | message | actor
//! ```
//!
//! `~=` matches the left-hand value against a regex literal and is the
//! only operator with a restricted right-hand side.

use crate::core::context::RunContext;
use regex::Regex;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {detail}")]
    Parse { offset: usize, detail: String },
    #[error("invalid regex in condition: {0}")]
    BadRegex(#[from] regex::Error),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

/// Context field referencable from a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Branch,
    Event,
    Tag,
    Sha,
    Message,
    Actor,
}

impl Field {
    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "branch" => Some(Field::Branch),
            "event" => Some(Field::Event),
            "tag" => Some(Field::Tag),
            "sha" => Some(Field::Sha),
            "message" => Some(Field::Message),
            "actor" => Some(Field::Actor),
            _ => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Branch => "branch",
            Field::Event => "event",
            Field::Tag => "tag",
            Field::Sha => "sha",
            Field::Message => "message",
            Field::Actor => "actor",
        };
        f.write_str(name)
    }
}

/// Condition expression AST
#[derive(Debug, Clone)]
pub enum Expr {
    Bool(bool),
    Str(String),
    Field(Field),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    /// Regex match; the pattern is compiled at parse time
    Match(Box<Expr>, Regex),
}

/// Intermediate evaluation value
enum Value {
    Bool(bool),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
        }
    }
}

impl Expr {
    /// Parse an expression from its source text
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        match parser.peek() {
            Token::Eof => Ok(expr),
            other => Err(ExprError::Parse {
                offset: parser.offset(),
                detail: format!("unexpected trailing {}", other.describe()),
            }),
        }
    }

    /// Evaluate against a run context; the expression must be boolean
    pub fn evaluate(&self, ctx: &RunContext) -> Result<bool, ExprError> {
        match self.eval_value(ctx)? {
            Value::Bool(b) => Ok(b),
            v => Err(ExprError::TypeMismatch(format!(
                "condition must evaluate to a bool, got {}",
                v.type_name()
            ))),
        }
    }

    fn eval_value(&self, ctx: &RunContext) -> Result<Value, ExprError> {
        match self {
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Field(f) => Ok(Value::Str(ctx.field(*f).to_string())),
            Expr::Not(inner) => match inner.eval_value(ctx)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                v => Err(ExprError::TypeMismatch(format!(
                    "'!' applies to bool, got {}",
                    v.type_name()
                ))),
            },
            Expr::And(l, r) => Ok(Value::Bool(
                l.eval_bool(ctx)? && r.eval_bool(ctx)?,
            )),
            Expr::Or(l, r) => Ok(Value::Bool(
                l.eval_bool(ctx)? || r.eval_bool(ctx)?,
            )),
            Expr::Eq(l, r) => Ok(Value::Bool(Self::compare(l, r, ctx)?)),
            Expr::Ne(l, r) => Ok(Value::Bool(!Self::compare(l, r, ctx)?)),
            Expr::Match(l, re) => match l.eval_value(ctx)? {
                Value::Str(s) => Ok(Value::Bool(re.is_match(&s))),
                v => Err(ExprError::TypeMismatch(format!(
                    "'~=' applies to a string, got {}",
                    v.type_name()
                ))),
            },
        }
    }

    fn eval_bool(&self, ctx: &RunContext) -> Result<bool, ExprError> {
        match self.eval_value(ctx)? {
            Value::Bool(b) => Ok(b),
            v => Err(ExprError::TypeMismatch(format!(
                "expected bool operand, got {}",
                v.type_name()
            ))),
        }
    }

    fn compare(l: &Expr, r: &Expr, ctx: &RunContext) -> Result<bool, ExprError> {
        match (l.eval_value(ctx)?, r.eval_value(ctx)?) {
            (Value::Str(a), Value::Str(b)) => Ok(a == b),
            (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
            (a, b) => Err(ExprError::TypeMismatch(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String, usize),
    Str(String, usize),
    EqEq(usize),
    NotEq(usize),
    Tilde(usize),
    AndAnd(usize),
    OrOr(usize),
    Bang(usize),
    LParen(usize),
    RParen(usize),
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s, _) => format!("identifier '{}'", s),
            Token::Str(_, _) => "string literal".to_string(),
            Token::EqEq(_) => "'=='".to_string(),
            Token::NotEq(_) => "'!='".to_string(),
            Token::Tilde(_) => "'~='".to_string(),
            Token::AndAnd(_) => "'&&'".to_string(),
            Token::OrOr(_) => "'||'".to_string(),
            Token::Bang(_) => "'!'".to_string(),
            Token::LParen(_) => "'('".to_string(),
            Token::RParen(_) => "')'".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }

    fn offset(&self) -> usize {
        match self {
            Token::Ident(_, o)
            | Token::Str(_, o)
            | Token::EqEq(o)
            | Token::NotEq(o)
            | Token::Tilde(o)
            | Token::AndAnd(o)
            | Token::OrOr(o)
            | Token::Bang(o)
            | Token::LParen(o)
            | Token::RParen(o) => *o,
            Token::Eof => usize::MAX,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    // Offsets are byte positions into the input; string literals may hold
    // arbitrary UTF-8, so iteration is over chars, never raw bytes.
    while let Some((i, c)) = chars.next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {}
            '(' => tokens.push(Token::LParen(i)),
            ')' => tokens.push(Token::RParen(i)),
            '"' => {
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped)) => s.push(escaped),
                            None => break,
                        },
                        ch => s.push(ch),
                    }
                }
                if !closed {
                    return Err(ExprError::Parse {
                        offset: i,
                        detail: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Token::Str(s, i));
            }
            '=' if matches!(chars.peek(), Some((_, '='))) => {
                chars.next();
                tokens.push(Token::EqEq(i));
            }
            '!' if matches!(chars.peek(), Some((_, '='))) => {
                chars.next();
                tokens.push(Token::NotEq(i));
            }
            '!' => tokens.push(Token::Bang(i)),
            '~' if matches!(chars.peek(), Some((_, '='))) => {
                chars.next();
                tokens.push(Token::Tilde(i));
            }
            '&' if matches!(chars.peek(), Some((_, '&'))) => {
                chars.next();
                tokens.push(Token::AndAnd(i));
            }
            '|' if matches!(chars.peek(), Some((_, '|'))) => {
                chars.next();
                tokens.push(Token::OrOr(i));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i + c.len_utf8();
                while let Some(&(j, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        chars.next();
                        end = j + ch.len_utf8();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(input[i..end].to_string(), i));
            }
            other => {
                return Err(ExprError::Parse {
                    offset: i,
                    detail: format!("unexpected character '{}'", other),
                })
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn offset(&self) -> usize {
        self.peek().offset()
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while matches!(self.peek(), Token::OrOr(_)) {
            self.bump();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while matches!(self.peek(), Token::AndAnd(_)) {
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Token::Bang(_)) {
            self.bump();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.primary()?;
        match self.peek().clone() {
            Token::EqEq(_) => {
                self.bump();
                let rhs = self.primary()?;
                Ok(Expr::Eq(Box::new(lhs), Box::new(rhs)))
            }
            Token::NotEq(_) => {
                self.bump();
                let rhs = self.primary()?;
                Ok(Expr::Ne(Box::new(lhs), Box::new(rhs)))
            }
            Token::Tilde(offset) => {
                self.bump();
                match self.bump() {
                    Token::Str(pattern, _) => {
                        let re = Regex::new(&pattern)?;
                        Ok(Expr::Match(Box::new(lhs), re))
                    }
                    other => Err(ExprError::Parse {
                        offset,
                        detail: format!(
                            "'~=' requires a string literal pattern, got {}",
                            other.describe()
                        ),
                    }),
                }
            }
            _ => Ok(lhs),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Token::LParen(offset) => {
                let inner = self.expr()?;
                match self.bump() {
                    Token::RParen(_) => Ok(inner),
                    other => Err(ExprError::Parse {
                        offset,
                        detail: format!("expected ')', got {}", other.describe()),
                    }),
                }
            }
            Token::Str(s, _) => Ok(Expr::Str(s)),
            Token::Ident(ident, offset) => match ident.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                _ => Field::from_ident(&ident).map(Expr::Field).ok_or_else(|| {
                    ExprError::Parse {
                        offset,
                        detail: format!("unknown field '{}'", ident),
                    }
                }),
            },
            other => Err(ExprError::Parse {
                offset: other.offset(),
                detail: format!("expected expression, got {}", other.describe()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::RunContext;
    use crate::core::trigger::EventKind;

    fn ctx(branch: &str, event: EventKind) -> RunContext {
        RunContext {
            event,
            branch: branch.to_string(),
            tag: String::new(),
            sha: "deadbeef".to_string(),
            message: "fix: align widgets".to_string(),
            actor: "dev".to_string(),
            triggered_at: chrono::Utc::now(),
            variables: Default::default(),
        }
    }

    fn eval(input: &str, ctx: &RunContext) -> bool {
        Expr::parse(input).unwrap().evaluate(ctx).unwrap()
    }

    #[test]
    fn test_equality() {
        let c = ctx("main", EventKind::Push);
        assert!(eval(r#"branch == "main""#, &c));
        assert!(!eval(r#"branch == "develop""#, &c));
        assert!(eval(r#"branch != "develop""#, &c));
    }

    #[test]
    fn test_non_ascii_string_literals() {
        let c = ctx("función", EventKind::Push);
        assert!(eval(r#"branch == "función""#, &c));
        assert!(!eval(r#"branch == "funcion""#, &c));
        assert!(eval(r#"branch ~= "^func""#, &c));
        // A multi-byte literal earlier in the input must not shift the
        // offsets reported for errors after it.
        let err = Expr::parse(r#"branch == "día" $"#).unwrap_err();
        match err {
            ExprError::Parse { offset, .. } => assert_eq!(offset, 17),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_boolean_operators() {
        let c = ctx("main", EventKind::Push);
        assert!(eval(r#"branch == "main" && event == "push""#, &c));
        assert!(!eval(r#"branch == "main" && event == "tag""#, &c));
        assert!(eval(r#"branch == "x" || event == "push""#, &c));
        assert!(eval(r#"!(branch == "develop")"#, &c));
    }

    #[test]
    fn test_precedence_and_binds_tighter_than_or() {
        let c = ctx("main", EventKind::Push);
        // false && false || true => (false && false) || true
        assert!(eval(
            r#"branch == "x" && event == "y" || event == "push""#,
            &c
        ));
    }

    #[test]
    fn test_regex_match() {
        let c = RunContext {
            tag: "v1.2.3".to_string(),
            ..ctx("", EventKind::Tag)
        };
        assert!(eval(r#"tag ~= "v[0-9]+\.[0-9]+\.[0-9]+""#, &c));
        assert!(!eval(r#"tag ~= "^release-""#, &c));
        assert!(eval(r#"message ~= "^fix:""#, &c));
    }

    #[test]
    fn test_absent_field_is_empty_string() {
        let c = ctx("main", EventKind::Push);
        assert!(eval(r#"tag == """#, &c));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse(r#"branch =="#).is_err());
        assert!(Expr::parse(r#"nonsense == "x""#).is_err());
        assert!(Expr::parse(r#"branch == "main" extra"#).is_err());
        assert!(Expr::parse(r#""unterminated"#).is_err());
        assert!(Expr::parse(r#"branch ~= branch"#).is_err());
    }

    #[test]
    fn test_eval_type_errors() {
        let c = ctx("main", EventKind::Push);
        // bare string is not a boolean condition
        let e = Expr::parse(r#""main""#).unwrap();
        assert!(e.evaluate(&c).is_err());
        // negating a string
        let e = Expr::parse(r#"!branch"#).unwrap();
        assert!(e.evaluate(&c).is_err());
        // comparing bool with string
        let e = Expr::parse(r#"true == "main""#).unwrap();
        assert!(e.evaluate(&c).is_err());
    }
}
