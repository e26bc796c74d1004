//! Error taxonomy for the template interpreter.
//!
//! Store-level failures ([`DeclError`], [`AssignError`]) are raised by the
//! [`Store`](super::store::Store) without any source position; the
//! interpreter attaches a [`Location`] when it lifts them into a
//! [`ScriptError`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

// ── Source positions ──────────────────────────────────────────────────────────

/// Name of the file (or pseudo-file such as `<shell>`) being processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef(Arc<str>);

impl SourceRef {
    pub fn new(name: impl AsRef<str>) -> Self {
        SourceRef(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File plus line (or line range, for multi-line constructs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub source: SourceRef,
    pub line: usize,
    pub end_line: Option<usize>,
}

impl Location {
    pub fn new(source: SourceRef, line: usize) -> Self {
        Location { source, line, end_line: None }
    }

    /// Extend to a range ending at `end`; a range of one line stays a line.
    pub fn through(mut self, end: usize) -> Self {
        self.end_line = (end > self.line).then_some(end);
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end_line {
            Some(end) => write!(f, "{}: lines {}-{}", self.source, self.line, end),
            None => write!(f, "{}: line {}", self.source, self.line),
        }
    }
}

// ── Parse errors ──────────────────────────────────────────────────────────────

/// What was left open when input ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delim {
    Quote,
    Paren,
    Bracket,
    Brace,
    Backtick,
    Comment,
}

impl fmt::Display for Delim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Delim::Quote => "quote",
            Delim::Paren => "parenthesis",
            Delim::Bracket => "bracket",
            Delim::Brace => "brace",
            Delim::Backtick => "backtick expression",
            Delim::Comment => "comment",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unterminated {kind} opened on line {opened_at_line}")]
    Unterminated { kind: Delim, opened_at_line: usize },

    #[error("line {line}: block indentation must start with {expected:?}")]
    Indentation { line: usize, expected: String },

    #[error("nesting deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("{0}")]
    Malformed(String),
}

// ── Store errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclError {
    #[error("'{name}' is already declared in layer {layer}")]
    Redeclaration { name: String, layer: usize },

    #[error("'{0}' collides with a type name")]
    StructCollision(String),

    #[error("'{0}' is not a valid name")]
    InvalidName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignError {
    #[error("cannot assign to constant '{0}'")]
    ConstantViolation(String),

    #[error("'{0}' is private to another scope")]
    PrivateViolation(String),

    #[error("cannot store into '{name}' of type {ty}: {reason}")]
    TypeMismatch { name: String, ty: String, reason: String },

    #[error("'{0}' is not defined")]
    Undefined(String),
}

// ── Arity ─────────────────────────────────────────────────────────────────────

/// Accepted parameter/option counts for a built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Between(lo, hi) => (lo..=hi).contains(&n),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(k) => write!(f, "{k}"),
            Arity::AtLeast(k) => write!(f, "at least {k}"),
            Arity::Between(lo, hi) => write!(f, "{lo} to {hi}"),
        }
    }
}

// ── ErrorKind / ScriptError ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{call}: expected {expected} {what}, got {got}")]
    Arity { call: String, what: &'static str, expected: Arity, got: usize },

    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    Scope(String),

    #[error("{0} would result in an input loop")]
    Cycle(String),

    #[error("{what} failed: {diagnostic}")]
    External { what: String, diagnostic: String },

    #[error("unknown call '{0}'")]
    UnknownCall(String),

    #[error("'{0}' is not defined")]
    UndefinedVariable(String),

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Io(String),

    #[error("console still locked at end of build (locked at {0})")]
    ConsoleStillLocked(Location),

    #[error("build killed")]
    Killed,
}

impl From<DeclError> for ErrorKind {
    fn from(e: DeclError) -> Self {
        ErrorKind::Type(e.to_string())
    }
}

impl From<AssignError> for ErrorKind {
    fn from(e: AssignError) -> Self {
        match e {
            AssignError::ConstantViolation(_) | AssignError::PrivateViolation(_) => {
                ErrorKind::Scope(e.to_string())
            }
            AssignError::TypeMismatch { .. } => ErrorKind::Type(e.to_string()),
            AssignError::Undefined(name) => ErrorKind::UndefinedVariable(name),
        }
    }
}

/// An error with the source position it was raised at.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{location}: {kind}")]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub location: Location,
}

impl ScriptError {
    pub fn new(kind: impl Into<ErrorKind>, location: Location) -> Self {
        ScriptError { kind: kind.into(), location }
    }

    pub fn io(err: &std::io::Error, what: impl fmt::Display, location: Location) -> Self {
        ScriptError::new(ErrorKind::Io(format!("{what}: {err}")), location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_display() {
        let loc = Location::new(SourceRef::new("index.html"), 4);
        assert_eq!(loc.to_string(), "index.html: line 4");
        assert_eq!(loc.clone().through(9).to_string(), "index.html: lines 4-9");
        assert_eq!(loc.through(4).end_line, None);
    }

    #[test]
    fn arity_display_and_accepts() {
        assert!(Arity::Between(1, 2).accepts(2));
        assert!(!Arity::Exactly(1).accepts(0));
        let kind = ErrorKind::Arity {
            call: "typeof".into(),
            what: "parameters",
            expected: Arity::Exactly(1),
            got: 3,
        };
        assert_eq!(kind.to_string(), "typeof: expected 1 parameters, got 3");
    }

    #[test]
    fn assign_errors_lift_to_taxonomy() {
        let k: ErrorKind = AssignError::ConstantViolation("x".into()).into();
        assert!(matches!(k, ErrorKind::Scope(_)));
        let k: ErrorKind = AssignError::Undefined("y".into()).into();
        assert_eq!(k, ErrorKind::UndefinedVariable("y".into()));
    }
}
