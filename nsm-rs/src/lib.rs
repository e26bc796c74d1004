//! nsm: a static site builder driven by a two-dialect template language.
//!
//! - [`script`]: the template interpreter
//! - [`build`]: the parallel build driver
//! - [`config`]: `nsm.toml` and the user config
//! - [`shell`]: interactive mode

pub mod build;
pub mod cli;
pub mod config;
pub mod console;
pub mod lua;
pub mod script;
pub mod shell;
pub mod tracked;
