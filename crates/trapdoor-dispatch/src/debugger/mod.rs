mod binary;
mod thread;

use std::fmt;
use std::future::Future;
use std::process::{ChildStderr, ChildStdin, ChildStdout};

pub use self::binary::MappedBinary;
pub use self::thread::Thread;
use crate::Command;

/// Trait implementing the spawning logic of a debugger.
pub trait Debugger {
    /// Debugging session returned by this debugger.
    type Session: DebugSession;

    /// Spawns a process with the given command line.
    ///
    /// The process is spawned in a **suspended** state. Its initial thread is
    /// reported by the first call to [wait_event](DebugSession::wait_event),
    /// as a [DebugEvent::StateInit].
    #[allow(clippy::type_complexity)]
    fn spawn(
        &mut self,
        command: Command,
    ) -> impl Future<
        Output = Result<(Self::Session, DebuggeeStdio), <Self::Session as DebugSession>::Error>,
    >;
}

/// Trait implementing the instrumentation logic of a debugger.
pub trait DebugSession {
    /// Type of a binary mapped into the debuggee's address space.
    type MappedBinary: MappedBinary<Error: Into<Self::Error>>;

    /// Type of a debuggee's stopped thread.
    type StoppedThread: Thread;

    /// Type of an exception (e.g., signal) raised within the debuggee.
    type Exception: fmt::Display + fmt::Debug;

    /// Error returned by this trait.
    type Error: std::error::Error;

    /// Returns the process ID of the debuggee.
    fn process_id(&self) -> u64;

    /// Returns the entry point address of the debuggee's executable.
    fn entry_addr(&self) -> u64;

    /// Waits for the next debug event.
    ///
    /// # Note
    ///
    /// This call blocks until some thread of the debuggee stops, or until
    /// the debuggee exits.
    fn wait_event(&mut self) -> impl Future<Output = Result<DebugEvent<Self>, Self::Error>>;

    /// Enumerates the binaries currently mapped into the debuggee's address
    /// space.
    ///
    /// The main executable comes first.
    fn mapped_binaries(
        &mut self,
    ) -> impl Future<Output = Result<Vec<Self::MappedBinary>, Self::Error>>;

    /// Adds a breakpoint at the given address of the debuggee's address space.
    ///
    /// Breakpoints are reference counted: adding a breakpoint twice at the
    /// same address requires removing it twice.
    fn add_breakpoint(&mut self, thread: &Self::StoppedThread, addr: u64)
    -> Result<(), Self::Error>;

    /// Removes a breakpoint from the given address of the debuggee's address
    /// space.
    ///
    /// Removing a breakpoint which doesn't exist is a no-op.
    fn remove_breakpoint(
        &mut self,
        thread: &Self::StoppedThread,
        addr: u64,
    ) -> Result<(), Self::Error>;

    /// Reads data from the debuggee's address space.
    ///
    /// The trap opcodes of the breakpoints are hidden from the returned data.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes data to the debuggee's address space.
    fn write_memory(
        &mut self,
        thread: &Self::StoppedThread,
        addr: u64,
        buf: &[u8],
    ) -> Result<(), Self::Error>;

    /// Reads a register of a stopped thread by name (e.g., `rip`, `x0`).
    ///
    /// Returns [None] if the register doesn't exist on this architecture.
    fn read_register(
        &self,
        thread: &Self::StoppedThread,
        name: &str,
    ) -> Result<Option<u64>, Self::Error>;

    /// Resumes the thread's execution.
    ///
    /// # Note
    ///
    /// If the thread is in [single-step mode](self::thread::Thread::is_single_step),
    /// this function makes the thread execute a single instruction.
    fn resume(&mut self, thread: Self::StoppedThread) -> Result<(), Self::Error>;

    /// Terminates the debuggee.
    ///
    /// The next call to [wait_event](Self::wait_event) reports the exit.
    fn kill(&mut self) -> Result<(), Self::Error>;
}

/// Event describing some action taking place within the debuggee.
pub enum DebugEvent<S: DebugSession + ?Sized> {
    /// The initial (suspended) thread of the debuggee.
    StateInit(S::StoppedThread),

    /// A thread has stopped by triggering a breakpoint.
    ///
    /// The thread's instruction address is the breakpoint address.
    Breakpoint(S::StoppedThread),

    /// A thread in single-step mode has executed an instruction.
    Singlestep(S::StoppedThread),

    /// A thread has stopped by raising an exception.
    ///
    /// Resuming the thread delivers the exception to the debuggee.
    Exception {
        /// The stopped thread.
        thread: S::StoppedThread,

        /// The exception raised by the thread.
        exception: S::Exception,
    },

    /// A thread is created by the debuggee.
    ///
    /// Both threads must be resumed.
    ThreadCreated {
        /// The thread which created the new thread.
        parent: S::StoppedThread,

        /// The new thread.
        thread: S::StoppedThread,
    },

    /// A thread is about to exit.
    ///
    /// The thread must be resumed for the exit to complete.
    ThreadExited {
        /// The exiting thread.
        thread: S::StoppedThread,

        /// Exit code of the thread.
        exit_code: i32,
    },

    /// The debuggee has exited.
    Exited(ExitStatus<S::Exception>),
}

/// Exit status of the debuggee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus<E> {
    /// The debuggee exited normally.
    ExitCode(i32),

    /// The debuggee was terminated by an exception.
    Exception(E),
}

impl<E: fmt::Display> fmt::Display for ExitStatus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode(code) => write!(f, "exit code {code}"),
            Self::Exception(exception) => write!(f, "terminated by {exception}"),
        }
    }
}

/// Standard I/O handles of a spawned debuggee.
pub struct DebuggeeStdio {
    /// Handle for writing to the debuggee's stdin.
    pub stdin: ChildStdin,

    /// Handle for reading from the debuggee's stdout.
    pub stdout: ChildStdout,

    /// Handle for reading from the debuggee's stderr.
    pub stderr: ChildStderr,
}
