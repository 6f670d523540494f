pub mod binary;
pub mod breakpoint;
pub mod debugger;
pub mod session;
pub mod thread;

use trapdoor_dispatch::debugger::ExitStatus;

use crate::sys::Exception;

/// Raw stop of a debuggee's thread, as reported by the OS.
pub enum DebugStop {
    Exception {
        thread_id: u64,
        exception: Exception,
    },

    ThreadCreated {
        thread_id: u64,
        new_thread_id: u64,
    },

    ThreadExited {
        thread_id: u64,
        exit_code: i32,
    },

    /// The thread stopped for an event of no interest, and must be resumed.
    Silent {
        thread_id: u64,
    },

    Exited(ExitStatus<Exception>),
}
