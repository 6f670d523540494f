/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error from the [wholesym] crate.
    #[error(transparent)]
    Wholesym(#[from] wholesym::Error),

    /// Internal debugger error.
    #[error(transparent)]
    DebuggerInternal(#[from] crate::sys::Error),

    /// A debug event was reported for a thread the debugger doesn't know of.
    #[error("untracked thread: {0}")]
    UntrackedThread(u64),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
