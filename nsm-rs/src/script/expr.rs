//! Numeric expression engine used by backtick substitutions, `exprtk`,
//! conditions and `for` headers.
//!
//! Expressions are compiled against a [`SymbolTable`] (so undefined names
//! are compile errors) and evaluated to an `f64`.  The grammar follows the
//! usual ExprTk conventions: `:=` assigns, `=` and `==` both compare, `^` is
//! power, `and`/`or`/`not` are keywords and `;` sequences statements.
//!
//! Precedence (lowest → highest):
//!   sequence  →  assign  →  ternary  →  or  →  and  →  relational  →
//!   additive  →  multiplicative  →  unary  →  power  →  postfix  →  primary

use std::fmt;
use std::io::Write as _;
use std::path::PathBuf;

use regex::Regex;
use thiserror::Error;

use super::value::NumFormat;

// ── SymbolTable ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Scalar,
    Vector,
    Str,
}

/// The interpreter's view of visible bindings, plus the side-effecting
/// helpers (`print`, file I/O) expressions may call.
pub trait SymbolTable {
    fn symbol(&self, name: &str) -> Option<SymbolKind>;
    fn scalar(&self, name: &str) -> Option<f64>;
    fn vector(&self, name: &str) -> Option<Vec<f64>>;
    fn string(&self, name: &str) -> Option<String>;
    fn set_scalar(&mut self, name: &str, value: f64) -> Result<(), String>;
    fn set_element(&mut self, name: &str, index: usize, value: f64) -> Result<(), String>;
    fn set_string(&mut self, name: &str, value: String) -> Result<(), String>;
    fn print(&mut self, text: &str);
    fn resolve_path(&self, path: &str) -> PathBuf;
}

/// Compile or evaluation failure, in the engine's own words.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .0.join("; "))]
pub struct Diagnostics(pub Vec<String>);

impl Diagnostics {
    fn one(msg: impl Into<String>) -> Self {
        Diagnostics(vec![msg.into()])
    }
}

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Bang,

    Eq, // = or ==
    Ne, // != or <>
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,

    Assign, // :=
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,

    Question,
    Colon,
    Semi,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Unknown(char),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(x) => write!(f, "number {x}"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Ident(s) => write!(f, "'{s}'"),
            Token::Unknown(c) => write!(f, "'{c}'"),
            Token::Eof => f.write_str("end of expression"),
            other => write!(f, "{other:?}"),
        }
    }
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { src, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos + 1).copied()
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn read_number(&mut self, start: usize) -> Result<Token, Diagnostics> {
        while self.peek().is_some_and(|b| b.is_ascii_digit() || b == b'.') {
            self.pos += 1;
        }
        if matches!(self.peek(), Some(b'e' | b'E'))
            && (self.peek2().is_some_and(|b| b.is_ascii_digit())
                || matches!(self.peek2(), Some(b'+' | b'-')))
        {
            self.pos += 2;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        text.parse()
            .map(Token::Num)
            .map_err(|_| Diagnostics::one(format!("malformed number '{text}'")))
    }

    fn read_string(&mut self, quote: char) -> Result<Token, Diagnostics> {
        let mut s = String::new();
        let src = self.src;
        let mut chars = src[self.pos..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, c)) => s.push(c),
                    None => break,
                },
                c if c == quote => {
                    self.pos += i + 1;
                    return Ok(Token::Str(s));
                }
                c => s.push(c),
            }
        }
        Err(Diagnostics::one("unterminated string literal"))
    }

    fn read_ident(&mut self, start: usize) -> Token {
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
        {
            self.pos += 1;
        }
        Token::Ident(self.src[start..self.pos].to_owned())
    }

    fn next_token(&mut self) -> Result<Token, Diagnostics> {
        self.skip_ws();
        let start = self.pos;
        let Some(ch) = self.peek() else {
            return Ok(Token::Eof);
        };
        self.pos += 1;

        Ok(match ch {
            b'0'..=b'9' => return self.read_number(start),
            b'.' if self.peek().is_some_and(|b| b.is_ascii_digit()) => {
                return self.read_number(start)
            }
            b'"' => return self.read_string('"'),
            b'\'' => return self.read_string('\''),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.read_ident(start),
            b'+' if self.eat(b'=') => Token::PlusAssign,
            b'+' => Token::Plus,
            b'-' if self.eat(b'=') => Token::MinusAssign,
            b'-' => Token::Minus,
            b'*' if self.eat(b'=') => Token::StarAssign,
            b'*' => Token::Star,
            b'/' if self.eat(b'=') => Token::SlashAssign,
            b'/' => Token::Slash,
            b'%' if self.eat(b'=') => Token::PercentAssign,
            b'%' => Token::Percent,
            b'^' => Token::Caret,
            b'!' if self.eat(b'=') => Token::Ne,
            b'!' => Token::Bang,
            b'=' => {
                self.eat(b'=');
                Token::Eq
            }
            b'<' if self.eat(b'>') => Token::Ne,
            b'<' if self.eat(b'=') => Token::Le,
            b'<' => Token::Lt,
            b'>' if self.eat(b'=') => Token::Ge,
            b'>' => Token::Gt,
            b'&' if self.eat(b'&') => Token::AndAnd,
            b'|' if self.eat(b'|') => Token::OrOr,
            b':' if self.eat(b'=') => Token::Assign,
            b':' => Token::Colon,
            b'?' => Token::Question,
            b';' => Token::Semi,
            b',' => Token::Comma,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            _ => {
                let c = self.src[start..].chars().next().unwrap_or('?');
                self.pos = start + c.len_utf8();
                Token::Unknown(c)
            }
        })
    }

    fn tokenize(mut self) -> Result<Vec<Token>, Diagnostics> {
        let mut tokens = Vec::new();
        loop {
            let t = self.next_token()?;
            let done = t == Token::Eof;
            tokens.push(t);
            if done {
                return Ok(tokens);
            }
        }
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Abs,
    Ceil,
    Floor,
    Round,
    Trunc,
    Sqrt,
    Exp,
    Log,
    Log10,
    Log2,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Pow,
    Hypot,
    Min,
    Max,
    Clamp,
    Sgn,
    Frac,
    Avg,
    Sum,
    Size,
    Print,
    Println,
    Fwrite,
    Fappend,
    FileExists,
    Matches,
}

impl Func {
    /// Function name → (function, min args, max args).
    fn lookup(name: &str) -> Option<(Func, usize, usize)> {
        const MANY: usize = usize::MAX;
        Some(match name {
            "abs" => (Func::Abs, 1, 1),
            "ceil" => (Func::Ceil, 1, 1),
            "floor" => (Func::Floor, 1, 1),
            "round" => (Func::Round, 1, 1),
            "trunc" => (Func::Trunc, 1, 1),
            "sqrt" => (Func::Sqrt, 1, 1),
            "exp" => (Func::Exp, 1, 1),
            "log" => (Func::Log, 1, 1),
            "log10" => (Func::Log10, 1, 1),
            "log2" => (Func::Log2, 1, 1),
            "sin" => (Func::Sin, 1, 1),
            "cos" => (Func::Cos, 1, 1),
            "tan" => (Func::Tan, 1, 1),
            "asin" => (Func::Asin, 1, 1),
            "acos" => (Func::Acos, 1, 1),
            "atan" => (Func::Atan, 1, 1),
            "atan2" => (Func::Atan2, 2, 2),
            "pow" => (Func::Pow, 2, 2),
            "hypot" => (Func::Hypot, 2, 2),
            "min" => (Func::Min, 1, MANY),
            "max" => (Func::Max, 1, MANY),
            "clamp" => (Func::Clamp, 3, 3),
            "sgn" => (Func::Sgn, 1, 1),
            "frac" => (Func::Frac, 1, 1),
            "avg" => (Func::Avg, 1, MANY),
            "sum" => (Func::Sum, 1, MANY),
            "size" => (Func::Size, 1, 1),
            "print" => (Func::Print, 0, MANY),
            "println" => (Func::Println, 0, MANY),
            "fwrite" => (Func::Fwrite, 1, MANY),
            "fappend" => (Func::Fappend, 1, MANY),
            "file_exists" => (Func::FileExists, 1, 1),
            "matches" => (Func::Matches, 2, 2),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
enum Target {
    Scalar(String),
    Element(String, Box<Node>),
    Str(String),
}

#[derive(Debug, Clone)]
enum Node {
    Num(f64),
    Str(String),
    Scalar(String),
    Vector(String),
    StrVar(String),
    Index(String, Box<Node>),
    Unary(UnaryOp, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Assign(Target, AssignOp, Box<Node>),
    Call(Func, Vec<Node>),
    Seq(Vec<Node>),
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// Bound on the depth of the syntax tree; evaluation recurses as deep.
const MAX_NESTING: usize = 256;

struct Parser<'t> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    table: &'t dyn SymbolTable,
}

impl<'t> Parser<'t> {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), Diagnostics> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(Diagnostics::one(format!("expected {what}, found {}", self.peek())))
        }
    }

    fn nest(&mut self) -> Result<(), Diagnostics> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(Diagnostics::one(format!("expression nested deeper than {MAX_NESTING} levels")));
        }
        Ok(())
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == word)
    }

    // ── Grammar ───────────────────────────────────────────────────────────────

    fn parse_sequence(&mut self) -> Result<Node, Diagnostics> {
        let mut stmts = Vec::new();
        loop {
            while self.eat(&Token::Semi) {}
            if self.peek() == &Token::Eof {
                break;
            }
            stmts.push(self.parse_assign()?);
            if !self.eat(&Token::Semi) {
                break;
            }
        }
        if self.peek() != &Token::Eof {
            return Err(Diagnostics::one(format!("unexpected {}", self.peek())));
        }
        match stmts.len() {
            0 => Err(Diagnostics::one("empty expression")),
            1 => Ok(stmts.remove(0)),
            _ => Ok(Node::Seq(stmts)),
        }
    }

    fn assign_op(tok: &Token) -> Option<AssignOp> {
        Some(match tok {
            Token::Assign => AssignOp::Set,
            Token::PlusAssign => AssignOp::Add,
            Token::MinusAssign => AssignOp::Sub,
            Token::StarAssign => AssignOp::Mul,
            Token::SlashAssign => AssignOp::Div,
            Token::PercentAssign => AssignOp::Rem,
            _ => return None,
        })
    }

    fn parse_assign(&mut self) -> Result<Node, Diagnostics> {
        let base = self.depth;
        self.nest()?;
        let node = self.assign_body()?;
        self.depth = base;
        Ok(node)
    }

    fn assign_body(&mut self) -> Result<Node, Diagnostics> {
        if let Token::Ident(name) = self.peek().clone() {
            // name := rhs
            if let Some(op) = Self::assign_op(self.peek_at(1)) {
                let target = match self.table.symbol(&name) {
                    Some(SymbolKind::Scalar) => Target::Scalar(name),
                    Some(SymbolKind::Str) if op == AssignOp::Set || op == AssignOp::Add => {
                        Target::Str(name)
                    }
                    Some(_) => {
                        return Err(Diagnostics::one(format!("cannot assign to '{name}'")))
                    }
                    None => return Err(Diagnostics::one(format!("undefined symbol '{name}'"))),
                };
                self.pos += 2;
                let rhs = self.parse_assign()?;
                return Ok(Node::Assign(target, op, Box::new(rhs)));
            }
            // name[i] := rhs
            if self.peek_at(1) == &Token::LBracket
                && self.table.symbol(&name) == Some(SymbolKind::Vector)
            {
                let save = self.pos;
                self.pos += 2;
                let index = self.parse_ternary()?;
                if self.eat(&Token::RBracket) {
                    if let Some(op) = Self::assign_op(self.peek()) {
                        self.pos += 1;
                        let rhs = self.parse_assign()?;
                        return Ok(Node::Assign(
                            Target::Element(name, Box::new(index)),
                            op,
                            Box::new(rhs),
                        ));
                    }
                }
                self.pos = save;
            }
        }
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Node, Diagnostics> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_assign()?;
            self.expect(&Token::Colon, "':' in ternary")?;
            let else_ = self.parse_assign()?;
            Ok(Node::Ternary(Box::new(cond), Box::new(then), Box::new(else_)))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Node, Diagnostics> {
        let base = self.depth;
        let mut lhs = self.parse_and()?;
        loop {
            let op = if self.eat(&Token::OrOr) || self.eat_keyword("or") {
                BinOp::Or
            } else if self.eat_keyword("xor") {
                BinOp::Xor
            } else {
                break;
            };
            self.nest()?;
            let rhs = self.parse_and()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.is_keyword(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_and(&mut self) -> Result<Node, Diagnostics> {
        let base = self.depth;
        let mut lhs = self.parse_relational()?;
        while self.eat(&Token::AndAnd) || self.eat_keyword("and") {
            self.nest()?;
            let rhs = self.parse_relational()?;
            lhs = Node::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Node, Diagnostics> {
        let base = self.depth;
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            self.nest()?;
            let rhs = self.parse_additive()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Node, Diagnostics> {
        let base = self.depth;
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.nest()?;
            let rhs = self.parse_multiplicative()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, Diagnostics> {
        let base = self.depth;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            self.nest()?;
            let rhs = self.parse_unary()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, Diagnostics> {
        let base = self.depth;
        self.nest()?;
        let node = self.unary_body()?;
        self.depth = base;
        Ok(node)
    }

    fn unary_body(&mut self) -> Result<Node, Diagnostics> {
        if self.eat(&Token::Minus) {
            return Ok(Node::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::Plus) {
            return self.parse_unary();
        }
        if self.eat(&Token::Bang) || self.eat_keyword("not") {
            return Ok(Node::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Node, Diagnostics> {
        let base = self.parse_primary()?;
        if self.eat(&Token::Caret) {
            // right-associative
            let exp = self.parse_unary()?;
            return Ok(Node::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Node, Diagnostics> {
        match self.advance() {
            Token::Num(x) => Ok(Node::Num(x)),
            Token::Str(s) => Ok(Node::Str(s)),
            Token::LParen => {
                let inner = self.parse_assign()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => self.parse_ident(name),
            other => Err(Diagnostics::one(format!("unexpected {other}"))),
        }
    }

    fn parse_ident(&mut self, name: String) -> Result<Node, Diagnostics> {
        match name.as_str() {
            "true" => return Ok(Node::Num(1.0)),
            "false" => return Ok(Node::Num(0.0)),
            "pi" if self.table.symbol("pi").is_none() => return Ok(Node::Num(std::f64::consts::PI)),
            _ => {}
        }
        if self.peek() == &Token::LParen {
            let (func, min, max) = Func::lookup(&name)
                .ok_or_else(|| Diagnostics::one(format!("unknown function '{name}'")))?;
            self.pos += 1;
            let mut args = Vec::new();
            if self.peek() != &Token::RParen {
                args.push(self.parse_assign()?);
                while self.eat(&Token::Comma) {
                    args.push(self.parse_assign()?);
                }
            }
            self.expect(&Token::RParen, &format!("')' after arguments to {name}"))?;
            if args.len() < min || args.len() > max {
                return Err(Diagnostics::one(format!(
                    "{name}: wrong number of arguments ({})",
                    args.len()
                )));
            }
            return Ok(Node::Call(func, args));
        }
        match self.table.symbol(&name) {
            Some(SymbolKind::Scalar) => Ok(Node::Scalar(name)),
            Some(SymbolKind::Str) => Ok(Node::StrVar(name)),
            Some(SymbolKind::Vector) => {
                if self.eat(&Token::LBracket) {
                    let index = self.parse_assign()?;
                    self.expect(&Token::RBracket, "']'")?;
                    Ok(Node::Index(name, Box::new(index)))
                } else {
                    Ok(Node::Vector(name))
                }
            }
            None => Err(Diagnostics::one(format!("undefined symbol '{name}'"))),
        }
    }
}

// ── Compiled expressions ──────────────────────────────────────────────────────

/// An expression compiled against a symbol table.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    root: Node,
}

/// Compile `text`, resolving every name against `table`.
pub fn compile(text: &str, table: &dyn SymbolTable) -> Result<CompiledExpr, Diagnostics> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser { tokens, pos: 0, depth: 0, table };
    let root = parser.parse_sequence()?;
    Ok(CompiledExpr { root })
}

impl CompiledExpr {
    /// Evaluate to a number.  The value of a sequence is its last statement.
    pub fn evaluate(&self, table: &mut dyn SymbolTable) -> Result<f64, Diagnostics> {
        match eval(&self.root, table)? {
            Val::Num(x) => Ok(x),
            Val::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| Diagnostics::one(format!("expression yields text '{s}'"))),
            Val::Vec(_) => Err(Diagnostics::one("expression yields a vector")),
        }
    }
}

/// Compile and evaluate in one step.
pub fn eval_str(text: &str, table: &mut dyn SymbolTable) -> Result<f64, Diagnostics> {
    compile(text, table)?.evaluate(table)
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Val {
    Num(f64),
    Str(String),
    Vec(Vec<f64>),
}

impl Val {
    fn num(&self) -> f64 {
        match self {
            Val::Num(x) => *x,
            Val::Str(s) => s.trim().parse().unwrap_or(f64::NAN),
            Val::Vec(v) => v.first().copied().unwrap_or(f64::NAN),
        }
    }

    fn text(&self) -> String {
        let fmt = NumFormat::default();
        match self {
            Val::Num(x) => fmt.format(*x),
            Val::Str(s) => s.clone(),
            Val::Vec(v) => v.iter().map(|x| fmt.format(*x)).collect::<Vec<_>>().join(", "),
        }
    }

    fn numbers(&self) -> Vec<f64> {
        match self {
            Val::Vec(v) => v.clone(),
            other => vec![other.num()],
        }
    }
}

fn truth(b: bool) -> Val {
    Val::Num(if b { 1.0 } else { 0.0 })
}

fn eval(node: &Node, table: &mut dyn SymbolTable) -> Result<Val, Diagnostics> {
    Ok(match node {
        Node::Num(x) => Val::Num(*x),
        Node::Str(s) => Val::Str(s.clone()),
        Node::Scalar(name) => Val::Num(
            table
                .scalar(name)
                .ok_or_else(|| Diagnostics::one(format!("'{name}' vanished during evaluation")))?,
        ),
        Node::StrVar(name) => Val::Str(table.string(name).unwrap_or_default()),
        Node::Vector(name) => Val::Vec(table.vector(name).unwrap_or_default()),
        Node::Index(name, index) => {
            let i = eval(index, table)?.num();
            let v = table.vector(name).unwrap_or_default();
            let value = if i >= 0.0 { v.get(i as usize).copied() } else { None };
            Val::Num(value.unwrap_or(f64::NAN))
        }
        Node::Unary(UnaryOp::Neg, inner) => Val::Num(-eval(inner, table)?.num()),
        Node::Unary(UnaryOp::Not, inner) => truth(eval(inner, table)?.num() == 0.0),
        Node::Binary(BinOp::And, lhs, rhs) => {
            if eval(lhs, table)?.num() == 0.0 {
                truth(false)
            } else {
                truth(eval(rhs, table)?.num() != 0.0)
            }
        }
        Node::Binary(BinOp::Or, lhs, rhs) => {
            if eval(lhs, table)?.num() != 0.0 {
                truth(true)
            } else {
                truth(eval(rhs, table)?.num() != 0.0)
            }
        }
        Node::Binary(op, lhs, rhs) => {
            let l = eval(lhs, table)?;
            let r = eval(rhs, table)?;
            eval_binop(*op, l, r)
        }
        Node::Ternary(cond, then, else_) => {
            if eval(cond, table)?.num() != 0.0 {
                eval(then, table)?
            } else {
                eval(else_, table)?
            }
        }
        Node::Assign(target, op, rhs) => {
            let r = eval(rhs, table)?;
            match target {
                Target::Scalar(name) => {
                    let cur = table.scalar(name).unwrap_or(0.0);
                    let x = apply_assign(*op, cur, r.num());
                    table.set_scalar(name, x).map_err(Diagnostics::one)?;
                    Val::Num(x)
                }
                Target::Element(name, index) => {
                    let i = eval(index, table)?.num();
                    let v = table.vector(name).unwrap_or_default();
                    if i < 0.0 || i as usize >= v.len() {
                        return Err(Diagnostics::one(format!("{name}[{i}] is out of range")));
                    }
                    let x = apply_assign(*op, v[i as usize], r.num());
                    table.set_element(name, i as usize, x).map_err(Diagnostics::one)?;
                    Val::Num(x)
                }
                Target::Str(name) => {
                    let mut s = if *op == AssignOp::Add {
                        table.string(name).unwrap_or_default()
                    } else {
                        String::new()
                    };
                    s.push_str(&r.text());
                    table.set_string(name, s.clone()).map_err(Diagnostics::one)?;
                    Val::Str(s)
                }
            }
        }
        Node::Call(func, args) => {
            let mut vals = Vec::with_capacity(args.len());
            for a in args {
                vals.push(eval(a, table)?);
            }
            call_func(*func, &vals, table)?
        }
        Node::Seq(stmts) => {
            let mut last = Val::Num(0.0);
            for s in stmts {
                last = eval(s, table)?;
            }
            last
        }
    })
}

fn apply_assign(op: AssignOp, cur: f64, r: f64) -> f64 {
    match op {
        AssignOp::Set => r,
        AssignOp::Add => cur + r,
        AssignOp::Sub => cur - r,
        AssignOp::Mul => cur * r,
        AssignOp::Div => cur / r,
        AssignOp::Rem => cur % r,
    }
}

fn eval_binop(op: BinOp, l: Val, r: Val) -> Val {
    if let (Val::Str(a), Val::Str(b)) = (&l, &r) {
        match op {
            BinOp::Add => return Val::Str(format!("{a}{b}")),
            BinOp::Eq => return truth(a == b),
            BinOp::Ne => return truth(a != b),
            BinOp::Lt => return truth(a < b),
            BinOp::Le => return truth(a <= b),
            BinOp::Gt => return truth(a > b),
            BinOp::Ge => return truth(a >= b),
            _ => {}
        }
    }
    let (a, b) = (l.num(), r.num());
    match op {
        BinOp::Add => Val::Num(a + b),
        BinOp::Sub => Val::Num(a - b),
        BinOp::Mul => Val::Num(a * b),
        BinOp::Div => Val::Num(a / b),
        BinOp::Rem => Val::Num(a % b),
        BinOp::Pow => Val::Num(a.powf(b)),
        BinOp::Eq => truth(a == b),
        BinOp::Ne => truth(a != b),
        BinOp::Lt => truth(a < b),
        BinOp::Le => truth(a <= b),
        BinOp::Gt => truth(a > b),
        BinOp::Ge => truth(a >= b),
        BinOp::Xor => truth((a != 0.0) != (b != 0.0)),
        BinOp::And | BinOp::Or => unreachable!("short-circuited in eval"),
    }
}

fn call_func(func: Func, args: &[Val], table: &mut dyn SymbolTable) -> Result<Val, Diagnostics> {
    let x = |i: usize| args.get(i).map_or(f64::NAN, Val::num);
    let all = || args.iter().flat_map(Val::numbers).collect::<Vec<f64>>();
    Ok(Val::Num(match func {
        Func::Abs => x(0).abs(),
        Func::Ceil => x(0).ceil(),
        Func::Floor => x(0).floor(),
        Func::Round => x(0).round(),
        Func::Trunc => x(0).trunc(),
        Func::Sqrt => x(0).sqrt(),
        Func::Exp => x(0).exp(),
        Func::Log => x(0).ln(),
        Func::Log10 => x(0).log10(),
        Func::Log2 => x(0).log2(),
        Func::Sin => x(0).sin(),
        Func::Cos => x(0).cos(),
        Func::Tan => x(0).tan(),
        Func::Asin => x(0).asin(),
        Func::Acos => x(0).acos(),
        Func::Atan => x(0).atan(),
        Func::Atan2 => x(0).atan2(x(1)),
        Func::Pow => x(0).powf(x(1)),
        Func::Hypot => x(0).hypot(x(1)),
        Func::Min => all().into_iter().fold(f64::INFINITY, f64::min),
        Func::Max => all().into_iter().fold(f64::NEG_INFINITY, f64::max),
        Func::Clamp => x(1).max(x(0)).min(x(2)),
        Func::Sgn => {
            let v = x(0);
            if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        Func::Frac => x(0).fract(),
        Func::Sum => all().iter().sum(),
        Func::Avg => {
            let v = all();
            if v.is_empty() {
                f64::NAN
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        }
        Func::Size => match &args[0] {
            Val::Vec(v) => v.len() as f64,
            Val::Str(s) => s.chars().count() as f64,
            Val::Num(_) => 1.0,
        },
        Func::Print | Func::Println => {
            let mut text: String = args.iter().map(Val::text).collect();
            if func == Func::Println {
                text.push('\n');
            }
            table.print(&text);
            0.0
        }
        Func::Fwrite | Func::Fappend => {
            let path = table.resolve_path(&args[0].text());
            let text: String = args[1..].iter().map(Val::text).collect();
            let opened = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(func == Func::Fappend)
                .truncate(func == Func::Fwrite)
                .open(&path);
            match opened.and_then(|mut f| f.write_all(text.as_bytes())) {
                Ok(()) => 1.0,
                Err(_) => 0.0,
            }
        }
        Func::FileExists => {
            if table.resolve_path(&args[0].text()).exists() {
                1.0
            } else {
                0.0
            }
        }
        Func::Matches => {
            let re = Regex::new(&args[1].text())
                .map_err(|e| Diagnostics::one(format!("matches: {e}")))?;
            if re.is_match(&args[0].text()) {
                1.0
            } else {
                0.0
            }
        }
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // ── Minimal SymbolTable for tests ─────────────────────────────────────────

    #[derive(Default)]
    struct TestTable {
        scalars: HashMap<String, f64>,
        vectors: HashMap<String, Vec<f64>>,
        strings: HashMap<String, String>,
        printed: String,
    }

    impl TestTable {
        fn with(mut self, k: &str, v: f64) -> Self {
            self.scalars.insert(k.into(), v);
            self
        }
        fn with_vec(mut self, k: &str, v: &[f64]) -> Self {
            self.vectors.insert(k.into(), v.to_vec());
            self
        }
        fn with_str(mut self, k: &str, v: &str) -> Self {
            self.strings.insert(k.into(), v.into());
            self
        }
    }

    impl SymbolTable for TestTable {
        fn symbol(&self, name: &str) -> Option<SymbolKind> {
            if self.scalars.contains_key(name) {
                Some(SymbolKind::Scalar)
            } else if self.vectors.contains_key(name) {
                Some(SymbolKind::Vector)
            } else if self.strings.contains_key(name) {
                Some(SymbolKind::Str)
            } else {
                None
            }
        }
        fn scalar(&self, name: &str) -> Option<f64> {
            self.scalars.get(name).copied()
        }
        fn vector(&self, name: &str) -> Option<Vec<f64>> {
            self.vectors.get(name).cloned()
        }
        fn string(&self, name: &str) -> Option<String> {
            self.strings.get(name).cloned()
        }
        fn set_scalar(&mut self, name: &str, value: f64) -> Result<(), String> {
            self.scalars.insert(name.into(), value);
            Ok(())
        }
        fn set_element(&mut self, name: &str, index: usize, value: f64) -> Result<(), String> {
            let v = self.vectors.get_mut(name).ok_or("no such vector")?;
            v[index] = value;
            Ok(())
        }
        fn set_string(&mut self, name: &str, value: String) -> Result<(), String> {
            self.strings.insert(name.into(), value);
            Ok(())
        }
        fn print(&mut self, text: &str) {
            self.printed.push_str(text);
        }
        fn resolve_path(&self, path: &str) -> PathBuf {
            PathBuf::from(path)
        }
    }

    fn eval(src: &str) -> f64 {
        eval_str(src, &mut TestTable::default()).expect("eval failed")
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("2 + 3 * 4"), 14.0);
        assert_eq!(eval("(2 + 3) * 4"), 20.0);
        assert_eq!(eval("2 ^ 3 ^ 2"), 512.0);
        assert_eq!(eval("-2 ^ 2"), -4.0);
        assert_eq!(eval("10 % 4"), 2.0);
        assert_eq!(eval(".5 + 1e1"), 10.5);
    }

    #[test]
    fn equality_spellings() {
        assert_eq!(eval("3 = 3"), 1.0);
        assert_eq!(eval("3 == 4"), 0.0);
        assert_eq!(eval("3 <> 4"), 1.0);
        assert_eq!(eval("3 != 3"), 0.0);
    }

    #[test]
    fn logic_keywords() {
        assert_eq!(eval("1 and 0"), 0.0);
        assert_eq!(eval("1 or 0"), 1.0);
        assert_eq!(eval("not 0"), 1.0);
        assert_eq!(eval("true xor true"), 0.0);
        assert_eq!(eval("1 < 2 && 2 < 3"), 1.0);
    }

    #[test]
    fn ternary() {
        assert_eq!(eval("1 ? 10 : 20"), 10.0);
        assert_eq!(eval("0 ? 10 : 20"), 20.0);
    }

    #[test]
    fn undefined_symbol_is_compile_error() {
        let t = TestTable::default();
        let err = compile("x + 1", &t).unwrap_err();
        assert_eq!(err.to_string(), "undefined symbol 'x'");
    }

    #[test]
    fn assignment_and_sequence() {
        let mut t = TestTable::default().with("x", 1.0);
        assert_eq!(eval_str("x := x + 4; x * 2", &mut t).unwrap(), 10.0);
        assert_eq!(t.scalars["x"], 5.0);
        eval_str("x += 1", &mut t).unwrap();
        assert_eq!(t.scalars["x"], 6.0);
    }

    #[test]
    fn vectors() {
        let mut t = TestTable::default().with_vec("v", &[1.0, 2.0, 3.0]);
        assert_eq!(eval_str("v[1]", &mut t).unwrap(), 2.0);
        assert_eq!(eval_str("size(v)", &mut t).unwrap(), 3.0);
        assert_eq!(eval_str("sum(v) / avg(v)", &mut t).unwrap(), 3.0);
        eval_str("v[0] := 9", &mut t).unwrap();
        assert_eq!(t.vectors["v"][0], 9.0);
        assert!(eval_str("v[5] := 1", &mut t).is_err());
    }

    #[test]
    fn strings_compare_and_concat() {
        let mut t = TestTable::default().with_str("s", "abc");
        assert_eq!(eval_str("s == 'abc'", &mut t).unwrap(), 1.0);
        eval_str("s += 'd'", &mut t).unwrap();
        assert_eq!(t.strings["s"], "abcd");
        assert_eq!(eval_str("matches(s, '^ab')", &mut t).unwrap(), 1.0);
    }

    #[test]
    fn print_goes_through_table() {
        let mut t = TestTable::default().with("x", 2.5);
        eval_str("println('x=', x)", &mut t).unwrap();
        assert_eq!(t.printed, "x=2.5\n");
    }

    #[test]
    fn functions_check_arity() {
        let t = TestTable::default();
        assert!(compile("pow(2)", &t).is_err());
        assert!(compile("nosuch(2)", &t).is_err());
        assert_eq!(eval("max(1, 7, 3)"), 7.0);
        assert_eq!(eval("clamp(0, 12, 10)"), 10.0);
    }

    #[test]
    fn trailing_garbage_rejected() {
        let t = TestTable::default();
        assert!(compile("1 2", &t).is_err());
        assert!(compile("", &t).is_err());
        assert!(compile("i++", &t).is_err());
    }

    #[test]
    fn deep_nesting_is_a_compile_error() {
        let t = TestTable::default();
        let deep = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        let err = compile(&deep, &t).unwrap_err();
        assert!(err.to_string().contains("nested deeper"), "{err}");
        let negations = format!("{}1", "-".repeat(20_000));
        assert!(compile(&negations, &t).is_err());
        let chain = vec!["1"; 20_000].join(" + ");
        assert!(compile(&chain, &t).is_err());
        let shallow = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(eval(&shallow), 1.0);
    }
}
