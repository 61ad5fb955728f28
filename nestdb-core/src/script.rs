//! Scripted transactions.
//!
//! Scripts are written in a small, loop-free expression language evaluated
//! against three capabilities: `store` (optionally rebased to a sub-key),
//! `expiry` and `events`. Every script terminates.
//!
//! ```text
//! let n = store.get('counter');
//! if n >= 10 {
//!     store.set('counter', 0);
//!     expiry.expire(['session'], 5000);
//!     'reset'
//! } else {
//!     store.add('counter', 1)
//! }
//! ```
//!
//! The language supports:
//!
//! - literals: numbers, `'..'`/`".."` strings, `true`, `false`, `null`,
//!   `[..]` arrays and `{key: value}` objects
//! - `let name = expr;` bindings, scoped to the enclosing block
//! - `if cond { .. } else if cond { .. } else { .. }` as an expression
//! - `!` and unary `-`, `* / %`, `+ -`, `< <= > >=`, `== !=`, `&&`, `||`
//! - indexing with `value[expr]` and `value.name`
//! - `// line comments`
//!
//! The value of a trailing expression (one without `;`) is the script result.

use crate::error::CoreError;
use crate::events::EventRegistry;
use crate::expiry::ExpiryIndex;
use crate::key::KeyPath;
use crate::store::StoreView;
use crate::value::{arith, is_truthy, type_name, values_equal, ArithOp};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Maximum nesting of expressions and blocks. Operators of one precedence
/// level form a flat chain and do not count toward it.
const MAX_DEPTH: usize = 128;

const RESERVED: &[&str] = &[
    "let", "if", "else", "true", "false", "null", "store", "expiry", "events",
];

/// An object a script can call methods on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Store,
    Expiry,
    Events,
}

impl Capability {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "store" => Some(Capability::Store),
            "expiry" => Some(Capability::Expiry),
            "events" => Some(Capability::Events),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::Store => "store",
            Capability::Expiry => "expiry",
            Capability::Events => "events",
        }
    }

    /// Accepted argument counts (min, max) of `method`, if it exists.
    fn arity(self, method: &str) -> Option<(usize, usize)> {
        use Capability::*;
        let arity = match (self, method) {
            (Store, "get" | "remove" | "pop" | "count" | "hasKey") => (1, 1),
            (Store, "set" | "add" | "concat") => (2, 2),
            (Store, "getRange" | "removeRange") => (2, 3),
            (Store, "removeAll" | "getAll") => (0, 0),
            (Expiry, "expire") => (2, 2),
            (Expiry, "unexpire" | "getExpiry") => (1, 1),
            (Events, "isWatched" | "watchers") => (1, 1),
            (Events, "count") => (0, 0),
            _ => return None,
        };
        Some(arity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Var(String),
    Call {
        capability: Capability,
        method: String,
        args: Vec<Expr>,
    },
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// A left-associative run of operators sharing one precedence level.
    Chain(Box<Expr>, Vec<(BinaryOp, Expr)>),
    If {
        cond: Box<Expr>,
        then: Block,
        otherwise: Option<Block>,
    },
}

#[derive(Debug, Clone)]
enum Stmt {
    Let(String, Expr),
    Expr(Expr),
}

#[derive(Debug, Clone)]
struct Block {
    stmts: Vec<Stmt>,
    tail: Option<Box<Expr>>,
}

/// The capabilities bound to a running script.
pub struct ScriptScope<'a> {
    pub store: StoreView<'a>,
    pub expiry: &'a mut ExpiryIndex,
    pub events: &'a EventRegistry,
}

/// A parsed script.
#[derive(Debug, Clone)]
pub struct Script {
    body: Block,
}

impl Script {
    /// Parses script source text.
    pub fn parse(source: &str) -> Result<Self, CoreError> {
        let mut parser = Parser::new(source);
        let body = parser.parse_body(true)?;
        Ok(Self { body })
    }

    /// Runs the script. A `null` result is reported as `None`, the same as a
    /// script with no trailing expression, since missing lookups also yield
    /// `null`.
    pub fn eval(&self, scope: &mut ScriptScope<'_>) -> Result<Option<Value>, CoreError> {
        let mut interpreter = Interpreter {
            scope,
            frames: Vec::new(),
        };
        match interpreter.eval_block(&self.body)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }
}

type BinaryLevel<'a> = fn(&mut Parser<'a>) -> Result<Expr, CoreError>;

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> CoreError {
        CoreError::ScriptSyntax {
            position: self.pos,
            reason: reason.into(),
        }
    }

    fn enter(&mut self) -> Result<(), CoreError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("script is nested too deeply"));
        }
        Ok(())
    }

    /// Parses statements until end of input (top level) or a closing brace.
    fn parse_body(&mut self, top_level: bool) -> Result<Block, CoreError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek_char() {
                None if top_level => return Ok(Block { stmts, tail: None }),
                None => return Err(self.error("expected '}'")),
                Some('}') if top_level => return Err(self.error("unexpected '}'")),
                Some('}') => return Ok(Block { stmts, tail: None }),
                Some(';') => {
                    self.pos += 1;
                    continue;
                }
                Some(_) => {}
            }

            if self.eat_keyword("let") {
                self.skip_whitespace();
                let name = self
                    .parse_ident()
                    .ok_or_else(|| self.error("expected a variable name after 'let'"))?;
                if RESERVED.contains(&name) {
                    return Err(self.error(format!("'{}' is reserved", name)));
                }
                self.expect('=')?;
                let value = self.parse_expr()?;
                self.expect(';')?;
                stmts.push(Stmt::Let(name.to_string(), value));
                continue;
            }

            let expr = self.parse_expr()?;
            self.skip_whitespace();
            match self.peek_char() {
                Some(';') => {
                    self.pos += 1;
                    stmts.push(Stmt::Expr(expr));
                }
                None if top_level => {
                    return Ok(Block {
                        stmts,
                        tail: Some(Box::new(expr)),
                    })
                }
                Some('}') if !top_level => {
                    return Ok(Block {
                        stmts,
                        tail: Some(Box::new(expr)),
                    })
                }
                _ if matches!(expr, Expr::If { .. }) => stmts.push(Stmt::Expr(expr)),
                _ => return Err(self.error("expected ';'")),
            }
        }
    }

    fn parse_block(&mut self) -> Result<Block, CoreError> {
        self.expect('{')?;
        let block = self.parse_body(false)?;
        self.expect('}')?;
        Ok(block)
    }

    fn parse_expr(&mut self) -> Result<Expr, CoreError> {
        self.enter()?;
        let expr = self.parse_or()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        self.parse_binary(&[("||", BinaryOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        self.parse_binary(&[("&&", BinaryOp::And)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr, CoreError> {
        self.parse_binary(
            &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
            Self::parse_comparison,
        )
    }

    fn parse_comparison(&mut self) -> Result<Expr, CoreError> {
        self.parse_binary(
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, CoreError> {
        self.parse_binary(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CoreError> {
        self.parse_binary(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Rem),
            ],
            Self::parse_unary,
        )
    }

    /// Parses a left-associative chain of the operators in `ops`.
    fn parse_binary(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: BinaryLevel<'a>,
    ) -> Result<Expr, CoreError> {
        let first = next(self)?;
        let mut rest = Vec::new();
        loop {
            self.skip_whitespace();
            let Some(&(token, op)) = ops.iter().find(|(token, _)| self.peek_str(token)) else {
                break;
            };
            self.pos += token.len();
            rest.push((op, next(self)?));
        }
        Ok(match rest.len() {
            0 => first,
            1 => {
                let (op, right) = rest.remove(0);
                Expr::Binary(op, Box::new(first), Box::new(right))
            }
            _ => Expr::Chain(Box::new(first), rest),
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();
        let op = match self.peek_char() {
            Some('!') if !self.peek_str("!=") => UnaryOp::Not,
            Some('-') => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.pos += 1;
        self.enter()?;
        let inner = self.parse_unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(inner)))
    }

    fn parse_postfix(&mut self) -> Result<Expr, CoreError> {
        let mut expr = self.parse_primary()?;
        let mut links = 0;
        loop {
            self.skip_whitespace();
            match self.peek_char() {
                Some('[') => {
                    self.enter()?;
                    links += 1;
                    self.pos += 1;
                    let index = self.parse_expr()?;
                    self.expect(']')?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some('.') => {
                    self.enter()?;
                    links += 1;
                    self.pos += 1;
                    self.skip_whitespace();
                    let name = self
                        .parse_ident()
                        .ok_or_else(|| self.error("expected a property name after '.'"))?;
                    let name = Expr::Literal(Value::String(name.to_string()));
                    expr = Expr::Index(Box::new(expr), Box::new(name));
                }
                _ => break,
            }
        }
        self.depth -= links;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();
        let Some(c) = self.peek_char() else {
            return Err(self.error("unexpected end of script"));
        };

        match c {
            '(' => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.expect(')')?;
                Ok(expr)
            }
            '[' => {
                self.pos += 1;
                Ok(Expr::Array(self.parse_list(']')?))
            }
            '{' => self.parse_object(),
            '\'' | '"' => Ok(Expr::Literal(Value::String(self.parse_string(c)?))),
            c if c.is_ascii_digit() => Ok(Expr::Literal(self.parse_number()?)),
            c if is_ident_start(c) => self.parse_word(),
            other => Err(self.error(format!("unexpected character '{}'", other))),
        }
    }

    fn parse_word(&mut self) -> Result<Expr, CoreError> {
        let start = self.pos;
        let word = self
            .parse_ident()
            .ok_or_else(|| self.error("expected an identifier"))?;

        match word {
            "true" => Ok(Expr::Literal(Value::Bool(true))),
            "false" => Ok(Expr::Literal(Value::Bool(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            "if" => self.parse_if(),
            "let" | "else" => Err(CoreError::ScriptSyntax {
                position: start,
                reason: format!("unexpected keyword '{}'", word),
            }),
            _ => match Capability::from_name(word) {
                Some(capability) => self.parse_call(capability),
                None => Ok(Expr::Var(word.to_string())),
            },
        }
    }

    fn parse_call(&mut self, capability: Capability) -> Result<Expr, CoreError> {
        self.skip_whitespace();
        if self.peek_char() != Some('.') {
            return Err(self.error(format!(
                "'{}' can only be used to call methods",
                capability.name()
            )));
        }
        self.pos += 1;
        self.skip_whitespace();
        let method = self
            .parse_ident()
            .ok_or_else(|| self.error("expected a method name"))?;
        let (min, max) = capability.arity(method).ok_or_else(|| {
            self.error(format!("unknown method {}.{}", capability.name(), method))
        })?;

        self.expect('(')?;
        let args = self.parse_list(')')?;
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{} to {}", min, max)
            };
            return Err(self.error(format!(
                "{}.{} expects {} argument(s), got {}",
                capability.name(),
                method,
                expected,
                args.len()
            )));
        }

        Ok(Expr::Call {
            capability,
            method: method.to_string(),
            args,
        })
    }

    fn parse_if(&mut self) -> Result<Expr, CoreError> {
        self.enter()?;
        let cond = self.parse_expr()?;
        let then = self.parse_block()?;
        let otherwise = if self.eat_keyword("else") {
            if self.eat_keyword("if") {
                let nested = self.parse_if()?;
                Some(Block {
                    stmts: Vec::new(),
                    tail: Some(Box::new(nested)),
                })
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        self.depth -= 1;
        Ok(Expr::If {
            cond: Box::new(cond),
            then,
            otherwise,
        })
    }

    /// Parses comma-separated expressions up to `close`. The opening
    /// delimiter has already been consumed.
    fn parse_list(&mut self, close: char) -> Result<Vec<Expr>, CoreError> {
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek_char() == Some(close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    if self.peek_char() == Some(close) {
                        self.pos += 1;
                        return Ok(items);
                    }
                }
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.error(format!("expected ',' or '{}'", close))),
            }
        }
    }

    fn parse_object(&mut self) -> Result<Expr, CoreError> {
        self.expect('{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_whitespace();
            let name = match self.peek_char() {
                Some('}') => {
                    self.pos += 1;
                    return Ok(Expr::Object(entries));
                }
                Some(quote @ ('\'' | '"')) => self.parse_string(quote)?,
                Some(c) if is_ident_start(c) => self
                    .parse_ident()
                    .map(str::to_string)
                    .ok_or_else(|| self.error("expected a property name"))?,
                _ => return Err(self.error("expected a property name or '}'")),
            };
            self.expect(':')?;
            let value = self.parse_expr()?;
            entries.push((name, value));

            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some('}') => {}
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn parse_string(&mut self, quote: char) -> Result<String, CoreError> {
        self.pos += quote.len_utf8();
        let mut out = String::new();
        loop {
            let Some(c) = self.peek_char() else {
                return Err(self.error("unterminated string"));
            };
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }

            let Some(escape) = self.peek_char() else {
                return Err(self.error("unterminated string"));
            };
            self.pos += escape.len_utf8();
            match escape {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' | '\'' | '"' | '/' => out.push(escape),
                'u' => {
                    let decoded = self
                        .input
                        .get(self.pos..self.pos + 4)
                        .filter(|hex| hex.chars().all(|c| c.is_ascii_hexdigit()))
                        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                        .and_then(char::from_u32)
                        .ok_or_else(|| self.error("invalid \\u escape"))?;
                    self.pos += 4;
                    out.push(decoded);
                }
                other => return Err(self.error(format!("unknown escape '\\{}'", other))),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        let start = self.pos;
        self.skip_digits();

        let mut is_float = false;
        let rest = &self.input[self.pos..];
        if rest.starts_with('.') && rest[1..].starts_with(|c: char| c.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            self.skip_digits();
        }

        let mut chars = self.input[self.pos..].chars();
        if matches!(chars.next(), Some('e' | 'E')) {
            let mut len = 1;
            let mut next = chars.next();
            if matches!(next, Some('+' | '-')) {
                len += 1;
                next = chars.next();
            }
            if next.is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += len;
                self.skip_digits();
            }
        }

        let text = &self.input[start..self.pos];
        if !is_float {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::from(n));
            }
        }
        let f: f64 = text
            .parse()
            .map_err(|_| self.error(format!("invalid number '{}'", text)))?;
        Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| self.error(format!("number out of range '{}'", text)))
    }

    fn parse_ident(&mut self) -> Option<&'a str> {
        let start = self.pos;
        match self.peek_char() {
            Some(c) if is_ident_start(c) => self.pos += c.len_utf8(),
            _ => return None,
        }
        while let Some(c) = self.peek_char() {
            if is_ident_char(c) {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        Some(&self.input[start..self.pos])
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace();
        if !self.peek_str(keyword) {
            return false;
        }
        let after = self.input[self.pos + keyword.len()..].chars().next();
        if after.is_some_and(is_ident_char) {
            return false;
        }
        self.pos += keyword.len();
        true
    }

    fn expect(&mut self, c: char) -> Result<(), CoreError> {
        self.skip_whitespace();
        if self.peek_char() != Some(c) {
            return Err(self.error(format!("expected '{}'", c)));
        }
        self.pos += c.len_utf8();
        Ok(())
    }

    fn skip_digits(&mut self) {
        while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek_char() {
                Some(c) if c.is_whitespace() => self.pos += c.len_utf8(),
                Some('/') if self.peek_str("//") => {
                    let rest = &self.input[self.pos..];
                    self.pos += rest.find('\n').unwrap_or(rest.len());
                }
                _ => break,
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

static NULL: Value = Value::Null;

struct Interpreter<'s, 'a> {
    scope: &'s mut ScriptScope<'a>,
    frames: Vec<HashMap<String, Value>>,
}

impl Interpreter<'_, '_> {
    fn eval_block(&mut self, block: &Block) -> Result<Value, CoreError> {
        self.frames.push(HashMap::new());
        let result = self.run_block(block);
        self.frames.pop();
        result
    }

    fn run_block(&mut self, block: &Block) -> Result<Value, CoreError> {
        for stmt in &block.stmts {
            match stmt {
                Stmt::Let(name, expr) => {
                    let value = self.eval(expr)?;
                    if let Some(frame) = self.frames.last_mut() {
                        frame.insert(name.clone(), value);
                    }
                }
                Stmt::Expr(expr) => {
                    self.eval(expr)?;
                }
            }
        }
        match &block.tail {
            Some(expr) => self.eval(expr),
            None => Ok(Value::Null),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, CoreError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (name, expr) in entries {
                    let value = self.eval(expr)?;
                    map.insert(name.clone(), value);
                }
                Ok(Value::Object(map))
            }
            Expr::Var(name) => self
                .frames
                .iter()
                .rev()
                .find_map(|frame| frame.get(name))
                .cloned()
                .ok_or_else(|| CoreError::runtime(format!("undefined variable '{}'", name))),
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(target, &index)
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                apply_unary(*op, value)
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                let left = self.eval(left)?;
                if !is_truthy(&left) {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                let left = self.eval(left)?;
                if is_truthy(&left) {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                apply_binary(*op, left, right)
            }
            Expr::Chain(first, rest) => {
                let mut acc = self.eval(first)?;
                for (op, right) in rest {
                    acc = match op {
                        BinaryOp::And if !is_truthy(&acc) => return Ok(acc),
                        BinaryOp::Or if is_truthy(&acc) => return Ok(acc),
                        BinaryOp::And | BinaryOp::Or => self.eval(right)?,
                        op => {
                            let right = self.eval(right)?;
                            apply_binary(*op, acc, right)?
                        }
                    };
                }
                Ok(acc)
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                if is_truthy(&self.eval(cond)?) {
                    self.eval_block(then)
                } else if let Some(otherwise) = otherwise {
                    self.eval_block(otherwise)
                } else {
                    Ok(Value::Null)
                }
            }
            Expr::Call {
                capability,
                method,
                args,
            } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(*capability, method, &args)
            }
        }
    }

    fn call(
        &mut self,
        capability: Capability,
        method: &str,
        args: &[Value],
    ) -> Result<Value, CoreError> {
        let arg = |i: usize| args.get(i).unwrap_or(&NULL);
        let store = &mut self.scope.store;

        let value = match (capability, method) {
            (Capability::Store, "get") => store.get(&key_arg(arg(0))?).unwrap_or(Value::Null),
            (Capability::Store, "set") => store.set(&key_arg(arg(0))?, arg(1).clone())?,
            (Capability::Store, "add") => store.add(&key_arg(arg(0))?, arg(1))?,
            (Capability::Store, "concat") => store.concat(&key_arg(arg(0))?, arg(1).clone())?,
            (Capability::Store, "getRange") => store
                .get_range(&key_arg(arg(0))?, index_arg(arg(1))?, opt_index_arg(arg(2))?)?
                .unwrap_or(Value::Null),
            (Capability::Store, "removeRange") => store
                .remove_range(&key_arg(arg(0))?, index_arg(arg(1))?, opt_index_arg(arg(2))?)?
                .unwrap_or(Value::Null),
            (Capability::Store, "remove") => {
                store.remove(&key_arg(arg(0))?)?.unwrap_or(Value::Null)
            }
            (Capability::Store, "removeAll") => {
                store.remove_all()?;
                Value::Null
            }
            (Capability::Store, "pop") => store.pop(&key_arg(arg(0))?)?.unwrap_or(Value::Null),
            (Capability::Store, "count") => Value::from(store.count(&key_arg(arg(0))?)),
            (Capability::Store, "hasKey") => Value::Bool(store.has_key(&key_arg(arg(0))?)),
            (Capability::Store, "getAll") => store.get_all(),
            (Capability::Expiry, "expire") => {
                let keys = key_list_arg(arg(0))?;
                let ttl = arg(1).as_u64().ok_or_else(|| {
                    CoreError::runtime("expiry.expire ttl must be a non-negative integer")
                })?;
                self.scope.expiry.expire(&keys, ttl)?;
                Value::Null
            }
            (Capability::Expiry, "unexpire") => {
                Value::from(self.scope.expiry.unexpire(&key_list_arg(arg(0))?))
            }
            (Capability::Expiry, "getExpiry") => self
                .scope
                .expiry
                .get_expiry(&key_arg(arg(0))?)
                .map(Value::from)
                .unwrap_or(Value::Null),
            (Capability::Events, "isWatched") => {
                Value::Bool(self.scope.events.any_subscribed(&key_arg(arg(0))?))
            }
            (Capability::Events, "watchers") => Value::Array(
                self.scope
                    .events
                    .subscribers_of(&key_arg(arg(0))?)
                    .into_iter()
                    .map(Value::from)
                    .collect(),
            ),
            (Capability::Events, "count") => Value::from(self.scope.events.connection_count()),
            _ => {
                return Err(CoreError::runtime(format!(
                    "unknown method {}.{}",
                    capability.name(),
                    method
                )))
            }
        };
        Ok(value)
    }
}

fn key_arg(value: &Value) -> Result<KeyPath, CoreError> {
    KeyPath::from_value(value)
}

/// An array is a list of keys; anything else is a single key.
fn key_list_arg(value: &Value) -> Result<Vec<KeyPath>, CoreError> {
    match value {
        Value::Array(items) => KeyPath::from_values(items),
        other => Ok(vec![KeyPath::from_value(other)?]),
    }
}

fn index_arg(value: &Value) -> Result<usize, CoreError> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| CoreError::runtime("range bounds must be non-negative integers"))
}

fn opt_index_arg(value: &Value) -> Result<Option<usize>, CoreError> {
    match value {
        Value::Null => Ok(None),
        other => index_arg(other).map(Some),
    }
}

fn index_value(target: Value, index: &Value) -> Result<Value, CoreError> {
    match (target, index) {
        (Value::Object(mut map), Value::String(name)) => {
            Ok(map.remove(name.as_str()).unwrap_or(Value::Null))
        }
        (Value::Array(items), Value::String(name)) if name == "length" => {
            Ok(Value::from(items.len()))
        }
        (Value::String(s), Value::String(name)) if name == "length" => {
            Ok(Value::from(s.chars().count()))
        }
        (Value::Array(mut items), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .filter(|&i| i < items.len())
            .map(|i| items.swap_remove(i))
            .unwrap_or(Value::Null)),
        (Value::Array(_) | Value::Object(_) | Value::String(_), _) => Ok(Value::Null),
        (other, index) => Err(CoreError::runtime(format!(
            "cannot read {} of {}",
            index,
            type_name(&other)
        ))),
    }
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value, CoreError> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!is_truthy(&value))),
        (UnaryOp::Neg, Value::Number(n)) => {
            let negated = match n.as_i64().and_then(i64::checked_neg) {
                Some(i) => Some(Number::from(i)),
                None => n.as_f64().and_then(|f| Number::from_f64(-f)),
            };
            negated
                .map(Value::Number)
                .ok_or_else(|| CoreError::runtime("numeric overflow"))
        }
        (UnaryOp::Neg, other) => Err(CoreError::runtime(format!(
            "cannot negate a {}",
            type_name(&other)
        ))),
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, CoreError> {
    let arith_op = match op {
        BinaryOp::Or => return Ok(if is_truthy(&left) { left } else { right }),
        BinaryOp::And => return Ok(if is_truthy(&left) { right } else { left }),
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right)?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        BinaryOp::Add => ArithOp::Add,
        BinaryOp::Sub => ArithOp::Sub,
        BinaryOp::Mul => ArithOp::Mul,
        BinaryOp::Div => ArithOp::Div,
        BinaryOp::Rem => ArithOp::Rem,
    };

    match (left, right) {
        (Value::Number(a), Value::Number(b)) => arith(arith_op, &a, &b)
            .map(Value::Number)
            .ok_or_else(|| {
                if matches!(arith_op, ArithOp::Div | ArithOp::Rem) && b.as_f64() == Some(0.0) {
                    CoreError::runtime("division by zero")
                } else {
                    CoreError::runtime("numeric overflow")
                }
            }),
        (left, right)
            if arith_op == ArithOp::Add && (left.is_string() || right.is_string()) =>
        {
            Ok(Value::String(format!("{}{}", text(&left), text(&right))))
        }
        (left, right) => Err(CoreError::runtime(format!(
            "unsupported operands {} and {}",
            type_name(&left),
            type_name(&right)
        ))),
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, CoreError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .ok_or_else(|| CoreError::runtime("numbers are not comparable")),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(CoreError::runtime(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
