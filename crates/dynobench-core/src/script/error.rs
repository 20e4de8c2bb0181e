//! Script errors

use thiserror::Error;

/// Errors raised while loading or running a test script
#[derive(Error, Debug)]
pub enum ScriptError {
    /// Source failed to compile or evaluate
    #[error("failed to load script: {0}")]
    Load(mlua::Error),

    /// Chunk returned something other than a table
    #[error("script did not evaluate to a table of entry points")]
    NoEntryTable,

    /// `Test` is required
    #[error("script has no Test entry point")]
    MissingTest,

    /// Voluntary termination through `stop()`
    #[error("script stopped")]
    Stopped,

    /// The session ended while the entry point ran
    #[error("script cancelled")]
    Cancelled,

    /// The script was shut down
    #[error("script has been shut down")]
    Released,

    /// Error raised by script code or a bound command
    #[error("{0}")]
    Runtime(mlua::Error),
}

impl ScriptError {
    /// Whether this ends a session normally
    pub fn is_stop(&self) -> bool {
        matches!(self, ScriptError::Stopped)
    }
}
