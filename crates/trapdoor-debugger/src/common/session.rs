use std::sync::Arc;

use trapdoor_dispatch::debugger::{DebugEvent, DebugSession, Thread};
use wholesym::{SymbolManager, SymbolManagerConfig};

use super::DebugStop;
use super::binary::MappedElf;
use super::breakpoint::{self, BreakpointManager, TRAP_PC_OFFSET};
use super::thread::{StopCause, StoppedThread, ThreadManager};
use crate::sys;
use crate::sys::process::TracedProcessHandle;
use crate::sys::thread::{TrapKind, get_thread_registers, set_thread_registers};

/// Debugging session created by [Debugger](crate::Debugger).
pub struct Session {
    inner: sys::Session,

    /// Breakpoint manager.
    breakpoint_manager: BreakpointManager,

    /// Thread manager.
    thread_manager: ThreadManager,

    /// Binary symbol resolver.
    symbol_manager: Arc<SymbolManager>,

    /// Initial thread, not reported yet.
    init_thread: Option<StoppedThread>,
}

impl Session {
    #[tracing::instrument(name = "DebugSessionInit", skip_all, fields(pid = debuggee_handle.raw_id()))]
    pub(super) async fn init(debuggee_handle: TracedProcessHandle) -> crate::Result<Self> {
        let main_thread_id = debuggee_handle.raw_id();

        let inner = sys::Session::init(debuggee_handle).await?;

        let mut thread_manager = ThreadManager::new();
        thread_manager.register_thread_create(main_thread_id);

        let init_thread = thread_manager
            .register_thread_stop(
                main_thread_id,
                get_thread_registers(main_thread_id)?.instr_addr(),
            )
            .ok_or(crate::Error::UntrackedThread(main_thread_id))?;

        Ok(Self {
            inner,
            breakpoint_manager: BreakpointManager::new(),
            thread_manager,
            symbol_manager: Arc::new(SymbolManager::with_config(SymbolManagerConfig::default())),
            init_thread: Some(init_thread),
        })
    }

    fn stopped_thread(&mut self, thread_id: u64) -> crate::Result<StoppedThread> {
        let instr_addr = get_thread_registers(thread_id)?.instr_addr();

        self.thread_manager
            .register_thread_stop(thread_id, instr_addr)
            .ok_or(crate::Error::UntrackedThread(thread_id))
    }

    /// Resumes a thread stopped on an enabled breakpoint.
    ///
    /// The other running threads are suspended while the breakpoint's
    /// original instruction executes, so none of them misses it.
    #[tracing::instrument(level = "debug", skip(self, thread), fields(tid = thread.id))]
    fn step_over_breakpoint(&mut self, thread: StoppedThread, addr: u64) -> crate::Result<()> {
        let thread_id = thread.id;

        let running = self.thread_manager.running_threads(thread_id);
        let suspended = self
            .inner
            .suspend_threads(running.iter().map(|(id, _)| *id))?;

        self.breakpoint_manager.disable(thread_id, addr)?;
        let stepped = self.inner.step_thread(thread_id, thread.single_step);
        self.breakpoint_manager.enable(thread_id, addr)?;

        if stepped? {
            sys::thread::resume_thread(thread_id, false, None)?;
        }

        self.thread_manager
            .register_thread_resume(thread_id, thread.single_step);

        for (id, single_step) in running {
            if suspended.contains(&id) {
                sys::thread::resume_thread(id, single_step, None)?;
            }
        }

        Ok(())
    }

    /// Handles the case where a thread was stopped by some exception.
    ///
    /// Returns [None] if the thread was resumed silently.
    fn handle_exception(
        &mut self,
        thread_id: u64,
        exception: sys::Exception,
    ) -> crate::Result<Option<DebugEvent<Self>>> {
        let mut thread = self.stopped_thread(thread_id)?;

        let trap = if exception.is_trap() {
            sys::thread::trap_kind(thread_id)?
        } else {
            None
        };

        match trap {
            Some(TrapKind::Singlestep) => {
                if thread.single_step {
                    // the breakpoint won't trap, so it is stepped over on resume
                    if self.breakpoint_manager.is_enabled(thread.instr_addr) {
                        thread.stopped_by = Some(StopCause::Breakpoint(thread.instr_addr));
                    }

                    return Ok(Some(DebugEvent::Singlestep(thread)));
                }

                self.resume(thread)?;
                return Ok(None);
            }
            Some(TrapKind::Breakpoint) => {
                let trap_addr = thread.instr_addr.wrapping_sub(TRAP_PC_OFFSET);

                let is_ours = self.breakpoint_manager.is_enabled(trap_addr);

                // trap of a breakpoint removed in the meantime
                let is_stale = !is_ours && !breakpoint::has_trap_opcodes(thread_id, trap_addr)?;

                if is_ours || is_stale {
                    if TRAP_PC_OFFSET != 0 {
                        let mut regs = get_thread_registers(thread_id)?;
                        regs.set_instr_addr(trap_addr);
                        set_thread_registers(thread_id, &regs)?;
                    }

                    thread.instr_addr = trap_addr;
                }

                if is_ours {
                    thread.stopped_by = Some(StopCause::Breakpoint(trap_addr));
                    return Ok(Some(DebugEvent::Breakpoint(thread)));
                }

                if is_stale {
                    tracing::trace!(addr = format_args!("{trap_addr:#x}"), "stale trap");

                    self.resume(thread)?;
                    return Ok(None);
                }
            }
            None => (),
        }

        thread.stopped_by = Some(StopCause::Exception(exception));

        Ok(Some(DebugEvent::Exception { thread, exception }))
    }
}

impl DebugSession for Session {
    type MappedBinary = MappedElf;
    type StoppedThread = StoppedThread;

    type Exception = sys::Exception;

    type Error = crate::Error;

    fn process_id(&self) -> u64 {
        self.inner.process_id()
    }

    fn entry_addr(&self) -> u64 {
        self.inner.entry_addr()
    }

    #[tracing::instrument(name = "DebugEventLoop", skip_all)]
    async fn wait_event(&mut self) -> Result<DebugEvent<Self>, Self::Error> {
        if let Some(thread) = self.init_thread.take() {
            return Ok(DebugEvent::StateInit(thread));
        }

        loop {
            match self.inner.wait_for_debug_stop().await? {
                DebugStop::Exception {
                    thread_id,
                    exception,
                } => {
                    if let Some(event) = self.handle_exception(thread_id, exception)? {
                        break Ok(event);
                    }
                }
                DebugStop::ThreadCreated {
                    thread_id,
                    new_thread_id,
                } => {
                    let parent = self.stopped_thread(thread_id)?;

                    self.thread_manager.register_thread_create(new_thread_id);
                    let thread = self.stopped_thread(new_thread_id)?;

                    break Ok(DebugEvent::ThreadCreated { parent, thread });
                }
                DebugStop::ThreadExited {
                    thread_id,
                    exit_code,
                } => {
                    // registers are gone if the thread was killed
                    let instr_addr = get_thread_registers(thread_id)
                        .map(|regs| regs.instr_addr())
                        .unwrap_or_default();

                    let thread = self
                        .thread_manager
                        .register_thread_stop(thread_id, instr_addr)
                        .ok_or(crate::Error::UntrackedThread(thread_id))?;

                    self.thread_manager.register_thread_exit(thread_id);

                    break Ok(DebugEvent::ThreadExited { thread, exit_code });
                }
                DebugStop::Silent { thread_id } => {
                    let thread = self.stopped_thread(thread_id)?;
                    self.resume(thread)?;
                }
                DebugStop::Exited(status) => {
                    break Ok(DebugEvent::Exited(status));
                }
            }
        }
    }

    async fn mapped_binaries(&mut self) -> Result<Vec<MappedElf>, Self::Error> {
        let binaries = self
            .inner
            .mapped_files()
            .await?
            .into_iter()
            .map(|file| MappedElf::new(file.addr_range, file.path, self.symbol_manager.clone()))
            .collect();

        Ok(binaries)
    }

    fn add_breakpoint(&mut self, thread: &StoppedThread, addr: u64) -> Result<(), Self::Error> {
        self.breakpoint_manager
            .add_breakpoint_or_increment_usage(thread.id(), addr)
            .map_err(Into::into)
    }

    fn remove_breakpoint(&mut self, thread: &StoppedThread, addr: u64) -> Result<(), Self::Error> {
        self.breakpoint_manager
            .remove_breakpoint_or_decrement_usage(thread.id(), addr)
            .map_err(Into::into)
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
        sys::mem::read_process_memory(self.process_id(), addr, buf)?;
        self.breakpoint_manager.mask_traps(addr, buf);

        Ok(())
    }

    fn write_memory(
        &mut self,
        thread: &StoppedThread,
        addr: u64,
        buf: &[u8],
    ) -> Result<(), Self::Error> {
        let mut data = buf.to_vec();
        self.breakpoint_manager.shadow_write(addr, &mut data);

        sys::mem::write_process_memory(thread.id(), addr, &data).map_err(Into::into)
    }

    fn read_register(
        &self,
        thread: &StoppedThread,
        name: &str,
    ) -> Result<Option<u64>, Self::Error> {
        Ok(get_thread_registers(thread.id)?.by_name(name))
    }

    fn resume(&mut self, thread: StoppedThread) -> Result<(), Self::Error> {
        let signal = match thread.stopped_by {
            // the breakpoint may have been removed while the thread was stopped
            Some(StopCause::Breakpoint(addr)) if self.breakpoint_manager.is_enabled(addr) => {
                return self.step_over_breakpoint(thread, addr);
            }
            Some(StopCause::Exception(exception)) => Some(exception.0),
            _ => None,
        };

        sys::thread::resume_thread(thread.id, thread.single_step, signal)?;

        self.thread_manager
            .register_thread_resume(thread.id, thread.single_step);

        Ok(())
    }

    fn kill(&mut self) -> Result<(), Self::Error> {
        self.inner.kill().map_err(Into::into)
    }
}
