use crate::breakpoint::BreakpointId;
use crate::handler::HandlerId;

/// Debugger error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct DebuggerError<E>(pub E);

/// Error returned by breakpoint callbacks and event handlers.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error<E> {
    /// A debugger error occurred.
    #[error(transparent)]
    Debugger(#[from] DebuggerError<E>),

    /// A breakpoint callback failed.
    ///
    /// The thread which triggered the breakpoint is kept stopped.
    #[error("Breakpoint {id} callback failed")]
    Callback {
        /// Breakpoint whose callback failed.
        id: BreakpointId,

        /// Error returned by the callback.
        #[source]
        source: CallbackError,
    },

    /// An event handler failed.
    ///
    /// The thread which triggered the event (if any) is kept stopped.
    #[error("Event handler {id} failed")]
    Handler {
        /// Event handler which failed.
        id: HandlerId,

        /// Error returned by the event handler.
        #[source]
        source: CallbackError,
    },

    /// The debuggee is gone (exited or killed).
    #[error("No debuggee")]
    NoDebuggee,

    /// No thread of the debuggee is currently stopped.
    #[error("No stopped thread")]
    NoStoppedThread,

    /// The debuggee was not in its initial suspended state.
    #[error("Debuggee not suspended at start")]
    NotSuspended,

    /// No register has the given name on the debuggee's architecture.
    #[error("Unknown register {0}")]
    UnknownRegister(String),

    /// A symbol wasn't found within the mapped binaries.
    #[error("Symbol {1} not found in {0}")]
    SymbolNotFound(String, String),
}

/// Result type of this crate.
pub type Result<T, E> = core::result::Result<T, Error<E>>;
