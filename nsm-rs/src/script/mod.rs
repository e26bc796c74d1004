//! The template language.
//!
//! This module implements the interpreter behind every page build:
//!
//! - Two surface dialects over one variable model: `N` (text passes
//!   through, `@name(…)` calls are expanded) and `F` (every statement is a
//!   call; results are emitted on request)
//! - Substitutions (`$[name]`, `${name}`) and numeric expressions in
//!   backticks
//! - A layered, scoped, typed variable [`Store`](store::Store) with user
//!   functions, lambdas and structs
//! - Control flow: `if` … `else-if` … `else`, `while`, `do-while`, `for`,
//!   `break`, `continue`, `return`, `exit`, `quit`, `kill`
//! - About ninety built-ins, including file I/O and pagination
//!
//! # Quick start
//!
//! ```rust
//! use nsm::console::Console;
//! use nsm::script::{Dialect, Interpreter};
//!
//! let (console, _) = Console::captured();
//! let mut interp = Interpreter::new(console, ".");
//! let out = interp.process_str("@int(x=6)`x * 7`", Dialect::N).unwrap();
//! assert_eq!(out, "42");
//! ```

pub mod builtins;
pub mod cursor;
pub mod error;
pub mod expr;
pub mod interp;
pub mod paginate;
pub mod processor;
pub mod signal;
pub mod store;
pub mod value;

// Re-exports for convenience.
pub use error::{ErrorKind, Location, ScriptError, SourceRef};
pub use interp::{BuildOutput, Interpreter};
pub use processor::Dialect;
pub use signal::ControlSignal;
pub use value::Value;
