mod auxv;
mod maps;

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use goblin::container::Container;
use goblin::elf::Elf;
use goblin::elf::header::header64::SIZEOF_EHDR;
use nix::errno::Errno;
use nix::libc::{self, PTRACE_EVENT_CLONE, PTRACE_EVENT_EXIT};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use trapdoor_dispatch::debugger::ExitStatus;

use self::maps::MappedFile;
use super::Exception;
use super::process::TracedProcessHandle;
use super::thread::{TrapKind, trap_kind};
use crate::common::DebugStop;

#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = goblin::elf::header::EM_X86_64;
#[cfg(target_arch = "aarch64")]
const HOST_MACHINE: u16 = goblin::elf::header::EM_AARCH64;

pub struct Session {
    /// Debuggee handle.
    debuggee_handle: TracedProcessHandle,

    /// Entry point address of the debuggee's executable.
    entry_addr: u64,

    /// Path of the debuggee's executable.
    exe_path: PathBuf,

    /// Threads of the debuggee.
    threads: HashSet<Pid>,

    /// Threads whose initial `SIGSTOP` was reported before their creation.
    early_stops: HashSet<Pid>,

    /// Stops collected while a single thread was being waited for.
    pending: VecDeque<WaitStatus>,

    /// Threads sent a `SIGSTOP` which wasn't reported yet.
    expected_stops: HashSet<Pid>,
}

impl Session {
    /// Initializes a new debug session with the given (suspended) process.
    pub async fn init(debuggee_handle: TracedProcessHandle) -> crate::sys::Result<Self> {
        let pid = debuggee_handle.id();

        let exe_link: PathBuf = format!("/proc/{pid}/exe").into();
        let exe_path = tokio::fs::read_link(&exe_link)
            .await
            .map_err(|e| crate::sys::Error::File(exe_link, e))?;

        let header = read_elf_header(pid).await?;

        if header.container()? != Container::Big {
            return Err(crate::sys::Error::Unsupported32Bit);
        }

        if header.e_machine != HOST_MACHINE {
            return Err(crate::sys::Error::ElfPlatform(header.e_machine));
        }

        let entry_addr = self::auxv::auxv_value(pid, header.endianness()?, libc::AT_ENTRY)
            .await?
            .ok_or(crate::sys::Error::MissingAuxv)?;

        tracing::debug!(
            exe = %exe_path.display(),
            entry = format_args!("{entry_addr:#x}"),
            "debuggee executable"
        );

        Ok(Self {
            debuggee_handle,
            entry_addr,
            exe_path,
            threads: HashSet::from([pid]),
            early_stops: HashSet::new(),
            pending: VecDeque::new(),
            expected_stops: HashSet::new(),
        })
    }

    pub const fn process_id(&self) -> u64 {
        self.debuggee_handle.raw_id()
    }

    pub const fn entry_addr(&self) -> u64 {
        self.entry_addr
    }

    pub fn kill(&self) -> crate::sys::Result<()> {
        self.debuggee_handle.kill().map_err(Into::into)
    }

    /// Enumerates the files mapped into the debuggee's address space, the
    /// executable first.
    pub async fn mapped_files(&self) -> crate::sys::Result<Vec<MappedFile>> {
        self::maps::mapped_files(self.debuggee_handle.id(), &self.exe_path).await
    }

    pub async fn wait_for_debug_stop(&mut self) -> crate::sys::Result<DebugStop> {
        let main_pid = self.debuggee_handle.id();

        loop {
            let status = match self.pending.pop_front() {
                Some(status) => status,
                // only the tracees of this thread
                None => waitpid(None, Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD))?,
            };

            let stop = match status {
                WaitStatus::Stopped(pid, Signal::SIGSTOP) if self.expected_stops.remove(&pid) => {
                    DebugStop::Silent {
                        thread_id: pid.as_raw() as u64,
                    }
                }
                WaitStatus::Stopped(pid, Signal::SIGSTOP) if !self.threads.contains(&pid) => {
                    self.early_stops.insert(pid);
                    continue;
                }
                WaitStatus::Stopped(pid, signal) => DebugStop::Exception {
                    thread_id: pid.as_raw() as u64,
                    exception: Exception(signal),
                },
                WaitStatus::PtraceEvent(pid, Signal::SIGTRAP, PTRACE_EVENT_CLONE) => {
                    let new_pid = ptrace::getevent(pid).map(|id| Pid::from_raw(id as i32))?;

                    if !self.early_stops.remove(&new_pid) {
                        match waitpid(new_pid, Some(WaitPidFlag::__WALL))? {
                            WaitStatus::Stopped(_, Signal::SIGSTOP) => (),
                            status => return Err(crate::sys::Error::BadChildWait(status)),
                        }
                    }

                    let is_thread =
                        tokio::fs::try_exists(format!("/proc/{main_pid}/task/{new_pid}"))
                            .await
                            .unwrap_or(false);

                    if is_thread {
                        self.threads.insert(new_pid);

                        DebugStop::ThreadCreated {
                            thread_id: pid.as_raw() as u64,
                            new_thread_id: new_pid.as_raw() as u64,
                        }
                    } else {
                        tracing::debug!(pid = new_pid.as_raw(), "detaching from child process");
                        ptrace::detach(new_pid, None)?;

                        DebugStop::Silent {
                            thread_id: pid.as_raw() as u64,
                        }
                    }
                }
                WaitStatus::PtraceEvent(pid, Signal::SIGTRAP, PTRACE_EVENT_EXIT) => {
                    let status = ptrace::getevent(pid)? as libc::c_int;

                    let exit_code = if libc::WIFSIGNALED(status) {
                        128 + libc::WTERMSIG(status)
                    } else {
                        libc::WEXITSTATUS(status)
                    };

                    DebugStop::ThreadExited {
                        thread_id: pid.as_raw() as u64,
                        exit_code,
                    }
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    tracing::warn!(event, tid = pid.as_raw(), "unexpected ptrace event");

                    DebugStop::Silent {
                        thread_id: pid.as_raw() as u64,
                    }
                }
                WaitStatus::Exited(pid, exit_code) if pid == main_pid => {
                    DebugStop::Exited(ExitStatus::ExitCode(exit_code))
                }
                WaitStatus::Signaled(pid, signal, _) if pid == main_pid => {
                    DebugStop::Exited(ExitStatus::Exception(Exception(signal)))
                }
                WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                    self.threads.remove(&pid);
                    self.expected_stops.remove(&pid);
                    continue;
                }
                _ => continue,
            };

            break Ok(stop);
        }
    }

    /// Stops the given running threads, waiting for each of them.
    ///
    /// Returns the threads suspended this way. A thread which stopped for
    /// another reason stays stopped, and its stop is reported by
    /// [Self::wait_for_debug_stop].
    pub fn suspend_threads(
        &mut self,
        thread_ids: impl IntoIterator<Item = u64>,
    ) -> crate::sys::Result<Vec<u64>> {
        let main_pid = self.debuggee_handle.id();
        let mut suspended = Vec::new();

        for thread_id in thread_ids {
            let pid = Pid::from_raw(thread_id as libc::pid_t);

            if self.pending.iter().any(|status| status.pid() == Some(pid)) {
                continue;
            }

            if !self.expected_stops.contains(&pid) {
                let res = Errno::result(unsafe {
                    libc::syscall(
                        libc::SYS_tgkill,
                        main_pid.as_raw(),
                        pid.as_raw(),
                        libc::SIGSTOP,
                    )
                });

                match res {
                    Ok(_) => {
                        self.expected_stops.insert(pid);
                    }
                    Err(Errno::ESRCH) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {
                    self.expected_stops.remove(&pid);
                    suspended.push(thread_id);
                }
                Ok(status) => self.pending.push_back(status),
                Err(Errno::ECHILD) => {
                    self.expected_stops.remove(&pid);
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::trace!(?suspended, "threads suspended");

        Ok(suspended)
    }

    /// Single-steps a stopped thread and waits for it.
    ///
    /// Returns `true` if the step completed and the thread is stopped
    /// silently. Otherwise, the thread's stop is reported by
    /// [Self::wait_for_debug_stop] (always the case with `report`).
    pub fn step_thread(&mut self, thread_id: u64, report: bool) -> crate::sys::Result<bool> {
        let pid = Pid::from_raw(thread_id as libc::pid_t);

        loop {
            match ptrace::step(pid, None) {
                Ok(()) => (),
                Err(Errno::ESRCH) => return Ok(false),
                Err(e) => return Err(e.into()),
            }

            let status = waitpid(pid, Some(WaitPidFlag::__WALL))?;

            match status {
                // the stop was requested before the step
                WaitStatus::Stopped(_, Signal::SIGSTOP) if self.expected_stops.remove(&pid) => {
                    continue;
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP)
                    if !report && trap_kind(thread_id)? == Some(TrapKind::Singlestep) =>
                {
                    return Ok(true);
                }
                status => {
                    self.pending.push_back(status);
                    return Ok(false);
                }
            }
        }
    }
}

async fn read_elf_header(pid: Pid) -> crate::sys::Result<goblin::elf::Header> {
    let path: PathBuf = format!("/proc/{pid}/exe").into();

    let mut file = File::open(&path)
        .await
        .map_err(|e| crate::sys::Error::File(path.clone(), e))?;

    let mut bytes = Vec::with_capacity(SIZEOF_EHDR);

    (&mut file)
        .take(SIZEOF_EHDR as u64)
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| crate::sys::Error::File(path, e))?;

    Ok(Elf::parse_header(&bytes)?)
}
