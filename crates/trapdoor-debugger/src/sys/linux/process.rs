use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Handle of a traced process.
///
/// The process is killed once the handle is dropped.
pub struct TracedProcessHandle {
    pidfd: OwnedFd,
    pid: Pid,
}

impl TracedProcessHandle {
    pub const fn new(pidfd: OwnedFd, pid: Pid) -> Self {
        Self { pidfd, pid }
    }

    /// Returns the process ID of the process associated with this handle.
    pub const fn id(&self) -> Pid {
        self.pid
    }

    /// Returns the process ID of the process associated with this handle.
    pub const fn raw_id(&self) -> u64 {
        self.pid.as_raw() as u64
    }

    /// Sends `SIGKILL` to the process.
    ///
    /// Killing a process which is already gone is not an error.
    pub fn kill(&self) -> nix::Result<()> {
        let res = unsafe {
            Errno::result(libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.pidfd.as_raw_fd(),
                Signal::SIGKILL as libc::c_int,
                ptr::null::<libc::siginfo_t>(),
                0,
            ))
        };

        match res {
            Ok(_) => {
                tracing::debug!(pid = self.pid.as_raw(), "process killed");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for TracedProcessHandle {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::error!(error = %e, pidfd = self.pidfd.as_raw_fd(), "pidfd_send_signal");
        }
    }
}

/// Opens a file descriptor referring to the given process.
pub fn pidfd_open(pid: Pid) -> nix::Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { Errno::result(libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0))? };

    Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}
