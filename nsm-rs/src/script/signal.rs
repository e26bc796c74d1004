//! Non-local control flow.

use super::error::ScriptError;

/// What a processed construct asks its enclosing constructs to do.
///
/// Loops consume `Break` and `ContinueLoop`; function calls consume
/// `Return`.  Everything else is re-propagated unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Proceed,
    Break,
    ContinueLoop,
    Return(Option<String>),
    Quit,
    Exit,
    Kill,
}

impl ControlSignal {
    pub fn is_proceed(&self) -> bool {
        matches!(self, ControlSignal::Proceed)
    }
}

/// Result of processing a construct.
pub type Flow = Result<ControlSignal, ScriptError>;
