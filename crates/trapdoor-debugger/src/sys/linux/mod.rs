mod error;
pub mod mem;
pub mod process;
mod session;
pub mod thread;

use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use trapdoor_dispatch::Command;
use trapdoor_dispatch::debugger::DebuggeeStdio;

pub use self::error::{Error, Result};
use self::process::TracedProcessHandle;
pub use self::session::Session;

/// Signal raised within the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception(pub Signal);

impl Exception {
    /// Returns whether this is a `SIGTRAP`.
    pub fn is_trap(&self) -> bool {
        self.0 == Signal::SIGTRAP
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Spawns a new child process.
///
/// # Note
///
/// The process is spawned in debug-mode, and stays stopped right after
/// `exec` until resumed.
pub async fn spawn_debuggee(command: Command) -> Result<(TracedProcessHandle, DebuggeeStdio)> {
    let mut std_command = std::process::Command::new(&command.program);
    std_command.args(&command.args);

    if let Some(env) = command.env.captured() {
        std_command.env_clear().envs(env);
    }

    if let Some(dir) = command.current_dir.as_ref() {
        std_command.current_dir(dir);
    }

    // On Linux, if a `pre_exec` closure is specified, `rust-std` will
    // spawn the process with `fork`+`exec`, otherwise `posix_spawn` is used.
    unsafe {
        std_command
            .pre_exec(|| ptrace::traceme().map_err(|e| io::Error::from_raw_os_error(e as i32)))
    };

    let mut child = std_command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(Error::ChildExec)?;

    let pid = Pid::from_raw(child.id() as i32);

    // from now on, the debuggee is killed along with its handle
    let handle = TracedProcessHandle::new(process::pidfd_open(pid)?, pid);

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(Error::MissingStdio);
    };

    wait_for_thread_ready(pid)?;

    tracing::debug!(pid = pid.as_raw(), program = %command.program.display(), "debuggee spawned");

    Ok((
        handle,
        DebuggeeStdio {
            stdin,
            stdout,
            stderr,
        },
    ))
}

fn wait_for_thread_ready(pid: Pid) -> Result<()> {
    // ptrace requests must be issued from the thread which spawned the
    // debuggee, so the wait happens in place
    let status = waitpid(pid, None)?;

    if !matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP)) {
        return Err(Error::BadChildWait(status));
    }

    ptrace::setoptions(
        pid,
        ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXIT
            | ptrace::Options::PTRACE_O_EXITKILL,
    )?;

    Ok(())
}
