mod config;


use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub use self::config::DispatcherConfig;
use crate::Command;
use crate::breakpoint::{BreakpointCallback, BreakpointId, BreakpointInfo, BreakpointTable};
use crate::breakpoint::{CallbackResult, Location, ScopedBreakpoint};
use crate::debugger::{DebugEvent, DebugSession, DebuggeeStdio, Debugger, ExitStatus};
use crate::debugger::{MappedBinary, Thread};
use crate::error::DebuggerError;
use crate::handler::{BreakpointHit, EventHandler, HandlerId, HandlerSet};

/// Reason why [go](Dispatcher::go) (or [step](Dispatcher::step)) returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The debuggee is gone.
    NoDebuggee,

    /// A breakpoint trap asked to stop (or the initial break was reached).
    Break,

    /// The debuggee stopped for another reason (single step, exception).
    Other,
}

/// Breakpoint dispatcher over a debug session.
///
/// At most one thread of the debuggee is held stopped by the dispatcher
/// between two calls to [go](Self::go). Breakpoints can only be set or
/// removed while a thread is held.
///
/// If the dispatcher is dropped, the debuggee is killed.
pub struct Dispatcher<S: DebugSession> {
    /// Debug session over the debuggee (`None` once it exited).
    session: Option<S>,

    /// State used to route traps.
    state: DispatchState<S>,

    /// Thread held stopped until the next `go`.
    held: Option<S::StoppedThread>,

    /// Binaries mapped into the debuggee, as of the last lookup.
    binaries: Vec<S::MappedBinary>,

    /// Whether the debuggee ran since the binaries were enumerated.
    binaries_stale: bool,

    /// Exit status of the debuggee, once it exited.
    exit_status: Option<ExitStatus<S::Exception>>,

    /// Sending half of the scoped breakpoints' removal queue.
    removal_tx: UnboundedSender<BreakpointId>,
}

struct DispatchState<S: DebugSession> {
    config: DispatcherConfig,
    breakpoints: BreakpointTable<S>,
    handlers: HandlerSet<S>,

    /// Address of the entry point breakpoint, until it is reached.
    initial_break: Option<u64>,

    /// Breakpoints whose scoped guard was dropped.
    removals: UnboundedReceiver<BreakpointId>,
}

enum Outcome<S: DebugSession> {
    Stopped(S::StoppedThread, StopReason),
    Exited(ExitStatus<S::Exception>),
}

impl<S: DebugSession> Dispatcher<S> {
    /// Spawns the debuggee with the given debugger and command line.
    ///
    /// The debuggee is suspended until [go](Self::go) is called.
    #[tracing::instrument(name = "Spawn", skip_all, fields(%command))]
    pub async fn spawn<D>(
        debugger: &mut D,
        command: Command,
        config: DispatcherConfig,
    ) -> crate::Result<(Self, DebuggeeStdio), S::Error>
    where
        D: Debugger<Session = S>,
    {
        let (session, stdio) = debugger.spawn(command).await.map_err(DebuggerError)?;

        tracing::info!(pid = session.process_id(), "spawned");

        Ok((Self::new(session, config).await?, stdio))
    }

    /// Creates a dispatcher over a freshly spawned debug session.
    ///
    /// The session must report its initial suspended thread first.
    pub async fn new(mut session: S, config: DispatcherConfig) -> crate::Result<Self, S::Error> {
        let thread = match session.wait_event().await.map_err(DebuggerError)? {
            DebugEvent::StateInit(thread) => thread,
            DebugEvent::Exited(status) => {
                tracing::warn!(%status, "debuggee exited before start");
                return Err(crate::Error::NoDebuggee);
            }
            _ => return Err(crate::Error::NotSuspended),
        };

        let initial_break = if config.initial_break {
            let entry_addr = session.entry_addr();

            session
                .add_breakpoint(&thread, entry_addr)
                .map_err(DebuggerError)?;

            tracing::debug!(addr = format_args!("{entry_addr:#x}"), "initial break set");

            Some(entry_addr)
        } else {
            None
        };

        let (removal_tx, removals) = mpsc::unbounded_channel();

        Ok(Self {
            session: Some(session),
            state: DispatchState {
                config,
                breakpoints: BreakpointTable::new(),
                handlers: HandlerSet::new(),
                initial_break,
                removals,
            },
            held: Some(thread),
            binaries: Vec::new(),
            binaries_stale: true,
            exit_status: None,
            removal_tx,
        })
    }

    /// Resumes the debuggee until a breakpoint asks to stop, or until another
    /// stopping event occurs.
    ///
    /// Once the debuggee is gone, [NoDebuggee](StopReason::NoDebuggee) is
    /// returned by every call.
    #[tracing::instrument(name = "Go", skip_all)]
    pub async fn go(&mut self) -> crate::Result<StopReason, S::Error> {
        if let Some(thread) = self.held.as_mut() {
            thread.set_single_step(false);
        }

        self.run().await
    }

    /// Makes the held thread execute a single instruction.
    #[tracing::instrument(name = "Step", skip_all)]
    pub async fn step(&mut self) -> crate::Result<StopReason, S::Error> {
        if self.session.is_none() {
            return Ok(StopReason::NoDebuggee);
        }

        self.held
            .as_mut()
            .ok_or(crate::Error::NoStoppedThread)?
            .set_single_step(true);

        self.run().await
    }

    /// Terminates the debuggee, and waits for it to exit.
    #[tracing::instrument(name = "Kill", skip_all)]
    pub async fn kill(&mut self) -> crate::Result<(), S::Error> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        session.kill().map_err(DebuggerError)?;

        // the killed threads don't need to be resumed
        self.held = None;

        while self.run().await? != StopReason::NoDebuggee {}

        Ok(())
    }

    /// Sets a breakpoint with a callback at the given location.
    ///
    /// Symbols are resolved against the binaries currently mapped into the
    /// debuggee.
    pub async fn set_breakpoint<C>(
        &mut self,
        location: impl Into<Location>,
        callback: C,
    ) -> crate::Result<BreakpointId, S::Error>
    where
        C: BreakpointCallback<S> + Send + 'static,
    {
        self.insert_breakpoint(location.into(), Some(Box::new(callback)))
            .await
    }

    /// Sets a breakpoint without callback at the given location.
    ///
    /// Such a breakpoint always stops the debuggee.
    pub async fn set_breakpoint_at(
        &mut self,
        location: impl Into<Location>,
    ) -> crate::Result<BreakpointId, S::Error> {
        self.insert_breakpoint(location.into(), None).await
    }

    /// Sets a breakpoint which is removed once the returned guard is dropped.
    pub async fn set_scoped_breakpoint<C>(
        &mut self,
        location: impl Into<Location>,
        callback: C,
    ) -> crate::Result<ScopedBreakpoint, S::Error>
    where
        C: BreakpointCallback<S> + Send + 'static,
    {
        let id = self.set_breakpoint(location, callback).await?;

        Ok(ScopedBreakpoint::new(id, self.removal_tx.clone()))
    }

    #[tracing::instrument(name = "SetBreakpoint", skip_all, fields(%location))]
    async fn insert_breakpoint(
        &mut self,
        location: Location,
        callback: Option<Box<dyn BreakpointCallback<S> + Send>>,
    ) -> crate::Result<BreakpointId, S::Error> {
        if self.session.is_none() {
            return Err(crate::Error::NoDebuggee);
        }

        if self.held.is_none() {
            return Err(crate::Error::NoStoppedThread);
        }

        let addr = self.resolve(&location).await?;

        let (Some(session), Some(thread)) = (self.session.as_mut(), self.held.as_ref()) else {
            return Err(crate::Error::NoDebuggee);
        };

        session
            .add_breakpoint(thread, addr)
            .map_err(DebuggerError)?;

        let id = self.state.breakpoints.insert(location, addr, callback);

        tracing::info!(%id, addr = format_args!("{addr:#x}"), "breakpoint set");

        Ok(id)
    }

    /// Removes a breakpoint.
    ///
    /// Returns whether the breakpoint was still registered. Removing a
    /// breakpoint twice, or after the debuggee exited, is a no-op.
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> crate::Result<bool, S::Error> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };

        let Some(thread) = self.held.as_ref() else {
            return Err(crate::Error::NoStoppedThread);
        };

        Ok(self
            .state
            .remove_breakpoint(session, thread, id)
            .map_err(DebuggerError)?)
    }

    /// Returns the registered breakpoints, in registration order.
    pub fn breakpoints(&self) -> impl Iterator<Item = BreakpointInfo> + '_ {
        self.state.breakpoints.iter()
    }

    /// Returns the breakpoint with the given identifier, if still registered.
    pub fn breakpoint(&self, id: BreakpointId) -> Option<BreakpointInfo> {
        self.state.breakpoints.info(id)
    }

    /// Subscribes an event handler.
    pub fn add_event_handler<H>(&mut self, handler: H) -> HandlerId
    where
        H: EventHandler<S> + Send + 'static,
    {
        self.state.handlers.add(Box::new(handler))
    }

    /// Unsubscribes an event handler.
    ///
    /// Returns whether the handler was subscribed.
    pub fn remove_event_handler(&mut self, id: HandlerId) -> bool {
        self.state.handlers.remove(id).is_some()
    }

    /// Returns the process ID of the debuggee, unless it is gone.
    pub fn process_id(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.process_id())
    }

    /// Returns the exit status of the debuggee, once it is gone.
    pub const fn exit_status(&self) -> Option<&ExitStatus<S::Exception>> {
        self.exit_status.as_ref()
    }

    /// Returns the thread currently held stopped.
    pub const fn stopped_thread(&self) -> Option<&S::StoppedThread> {
        self.held.as_ref()
    }

    /// Returns the underlying debug session, unless the debuggee is gone.
    pub const fn session(&self) -> Option<&S> {
        self.session.as_ref()
    }

    /// Reads data from the debuggee's address space.
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> crate::Result<(), S::Error> {
        let session = self.session.as_ref().ok_or(crate::Error::NoDebuggee)?;

        Ok(session.read_memory(addr, buf).map_err(DebuggerError)?)
    }

    /// Writes data to the debuggee's address space.
    pub fn write_memory(&mut self, addr: u64, buf: &[u8]) -> crate::Result<(), S::Error> {
        let session = self.session.as_mut().ok_or(crate::Error::NoDebuggee)?;
        let thread = self.held.as_ref().ok_or(crate::Error::NoStoppedThread)?;

        Ok(session
            .write_memory(thread, addr, buf)
            .map_err(DebuggerError)?)
    }

    /// Reads a register of the held thread by name.
    pub fn read_register(&self, name: &str) -> crate::Result<u64, S::Error> {
        let session = self.session.as_ref().ok_or(crate::Error::NoDebuggee)?;
        let thread = self.held.as_ref().ok_or(crate::Error::NoStoppedThread)?;

        session
            .read_register(thread, name)
            .map_err(DebuggerError)?
            .ok_or_else(|| crate::Error::UnknownRegister(name.to_owned()))
    }

    /// Returns the binaries currently mapped into the debuggee.
    ///
    /// The main executable comes first.
    pub async fn binaries(&mut self) -> crate::Result<&[S::MappedBinary], S::Error> {
        self.refresh_binaries().await?;

        Ok(&self.binaries)
    }

    /// Resolves a location to an address of the debuggee's address space.
    pub async fn resolve(&mut self, location: &Location) -> crate::Result<u64, S::Error> {
        if self.session.is_none() {
            return Err(crate::Error::NoDebuggee);
        }

        let (binary, name) = match location {
            Location::Addr(addr) => return Ok(*addr),
            Location::Symbol { binary, name } => (binary.as_deref(), name.as_str()),
        };

        self.refresh_binaries().await?;

        for mapped in self
            .binaries
            .iter_mut()
            .filter(|mapped| binary.is_none_or(|file_name| mapped.file_name() == file_name))
        {
            let addr = mapped
                .addr_of_symbol(name)
                .await
                .map_err(|e| DebuggerError(e.into()))?;

            if let Some(addr) = addr {
                tracing::debug!(
                    binary = mapped.file_name(),
                    addr = format_args!("{addr:#x}"),
                    "symbol resolved"
                );
                return Ok(addr);
            }
        }

        Err(crate::Error::SymbolNotFound(
            binary.unwrap_or("*").to_owned(),
            name.to_owned(),
        ))
    }

    /// Returns the symbol closest to the given address, and the offset from
    /// its start.
    pub async fn symbolize(&mut self, addr: u64) -> crate::Result<Option<(String, u64)>, S::Error> {
        self.refresh_binaries().await?;

        let Some(mapped) = self
            .binaries
            .iter_mut()
            .find(|mapped| mapped.contains(addr))
        else {
            return Ok(None);
        };

        Ok(mapped
            .symbol_of_addr(addr)
            .await
            .map_err(|e| DebuggerError(e.into()))?)
    }

    /// Enumerates the mapped binaries again if the debuggee ran since last
    /// time.
    ///
    /// Binaries which are still mapped at the same place are kept, along
    /// with their loaded symbols.
    async fn refresh_binaries(&mut self) -> crate::Result<(), S::Error> {
        let session = self.session.as_mut().ok_or(crate::Error::NoDebuggee)?;

        if !self.binaries_stale {
            return Ok(());
        }

        let fresh = session.mapped_binaries().await.map_err(DebuggerError)?;
        let mut known = std::mem::take(&mut self.binaries);

        self.binaries = fresh
            .into_iter()
            .map(|mapped| {
                known
                    .iter()
                    .position(|k| k.path() == mapped.path() && k.addr_range() == mapped.addr_range())
                    .map_or(mapped, |pos| known.swap_remove(pos))
            })
            .collect();

        tracing::debug!(count = self.binaries.len(), "mapped binaries enumerated");

        self.binaries_stale = false;

        Ok(())
    }

    async fn run(&mut self) -> crate::Result<StopReason, S::Error> {
        let Some(session) = self.session.as_mut() else {
            return Ok(StopReason::NoDebuggee);
        };

        if let Some(thread) = self.held.take() {
            if let Err(e) = self.state.apply_removals(session, &thread) {
                self.held = Some(thread);
                return Err(DebuggerError(e).into());
            }

            session.resume(thread).map_err(DebuggerError)?;
        }

        self.binaries_stale = true;

        let outcome: Outcome<S> = loop {
            match session.wait_event().await.map_err(DebuggerError)? {
                DebugEvent::Breakpoint(thread) => {
                    match self.state.on_breakpoint(session, &thread) {
                        Ok(CallbackResult::Proceed) => {
                            session.resume(thread).map_err(DebuggerError)?;
                        }
                        Ok(CallbackResult::StopWait) => {
                            break Outcome::Stopped(thread, StopReason::Break);
                        }
                        Err(e) => {
                            self.held = Some(thread);
                            return Err(e);
                        }
                    }
                }
                DebugEvent::Singlestep(mut thread) => {
                    thread.set_single_step(false);

                    // a step landing on a breakpoint triggers it
                    if !self.state.is_trap_site(thread.instr_addr()) {
                        break Outcome::Stopped(thread, StopReason::Other);
                    }

                    match self.state.on_breakpoint(session, &thread) {
                        Ok(CallbackResult::Proceed) => {
                            break Outcome::Stopped(thread, StopReason::Other);
                        }
                        Ok(CallbackResult::StopWait) => {
                            break Outcome::Stopped(thread, StopReason::Break);
                        }
                        Err(e) => {
                            self.held = Some(thread);
                            return Err(e);
                        }
                    }
                }
                DebugEvent::Exception { thread, exception } => {
                    tracing::debug!(tid = thread.id(), %exception, "exception raised");

                    match self.state.on_exception(session, &thread, &exception) {
                        Ok(CallbackResult::Proceed) => {
                            session.resume(thread).map_err(DebuggerError)?;
                        }
                        Ok(CallbackResult::StopWait) => {
                            break Outcome::Stopped(thread, StopReason::Other);
                        }
                        Err(e) => {
                            self.held = Some(thread);
                            return Err(e);
                        }
                    }
                }
                DebugEvent::ThreadCreated { parent, thread } => {
                    tracing::debug!(parent_tid = parent.id(), tid = thread.id(), "thread created");

                    let res = self
                        .state
                        .handlers
                        .notify(|h| h.thread_created(session, parent.id(), &thread));

                    session.resume(thread).map_err(DebuggerError)?;

                    if let Err((id, source)) = res {
                        self.held = Some(parent);
                        return Err(crate::Error::Handler { id, source });
                    }

                    session.resume(parent).map_err(DebuggerError)?;
                }
                DebugEvent::ThreadExited { thread, exit_code } => {
                    tracing::debug!(tid = thread.id(), exit_code, "thread exiting");

                    if let Err((id, source)) = self
                        .state
                        .handlers
                        .notify(|h| h.thread_exited(session, thread.id(), exit_code))
                    {
                        self.held = Some(thread);
                        return Err(crate::Error::Handler { id, source });
                    }

                    session.resume(thread).map_err(DebuggerError)?;
                }
                DebugEvent::StateInit(thread) => {
                    tracing::warn!(tid = thread.id(), "unexpected initial state");

                    session.resume(thread).map_err(DebuggerError)?;
                }
                DebugEvent::Exited(status) => break Outcome::Exited(status),
            }
        };

        match outcome {
            Outcome::Stopped(thread, reason) => {
                tracing::debug!(
                    tid = thread.id(),
                    addr = format_args!("{:#x}", thread.instr_addr()),
                    ?reason,
                    "debuggee stopped"
                );

                self.held = Some(thread);

                Ok(reason)
            }
            Outcome::Exited(status) => {
                tracing::info!(%status, "debuggee has exited");

                let res = self
                    .state
                    .handlers
                    .notify(|h| h.process_exited(&status));

                self.session = None;
                self.state.breakpoints.clear();
                self.state.initial_break = None;
                self.binaries.clear();
                self.exit_status = Some(status);

                res.map_err(|(id, source)| crate::Error::Handler { id, source })?;

                Ok(StopReason::NoDebuggee)
            }
        }
    }
}

impl<S: DebugSession> DispatchState<S> {
    /// Removes the breakpoints whose scoped guard was dropped.
    fn apply_removals(&mut self, session: &mut S, thread: &S::StoppedThread) -> Result<(), S::Error> {
        while let Ok(id) = self.removals.try_recv() {
            self.remove_breakpoint(session, thread, id)?;
        }

        Ok(())
    }

    fn remove_breakpoint(
        &mut self,
        session: &mut S,
        thread: &S::StoppedThread,
        id: BreakpointId,
    ) -> Result<bool, S::Error> {
        let Some(addr) = self.breakpoints.remove(id) else {
            return Ok(false);
        };

        session.remove_breakpoint(thread, addr)?;

        tracing::info!(%id, addr = format_args!("{addr:#x}"), "breakpoint removed");

        Ok(true)
    }

    fn is_trap_site(&self, addr: u64) -> bool {
        self.initial_break == Some(addr) || self.breakpoints.contains_addr(addr)
    }

    /// Routes a breakpoint trap to the callbacks and event handlers.
    fn on_breakpoint(
        &mut self,
        session: &mut S,
        thread: &S::StoppedThread,
    ) -> crate::Result<CallbackResult, S::Error> {
        self.apply_removals(session, thread).map_err(DebuggerError)?;

        let addr = thread.instr_addr();
        let mut decision = CallbackResult::Proceed;

        if self.initial_break == Some(addr) {
            self.initial_break = None;

            session
                .remove_breakpoint(thread, addr)
                .map_err(DebuggerError)?;

            tracing::info!(addr = format_args!("{addr:#x}"), "initial break reached");

            self.handlers
                .notify(|h| h.initial_break(session, thread))
                .map_err(|(id, source)| crate::Error::Handler { id, source })?;

            decision = CallbackResult::StopWait;
        }

        let ids = self.breakpoints.ids_at(addr);

        if ids.is_empty() {
            if decision == CallbackResult::Proceed {
                tracing::debug!(addr = format_args!("{addr:#x}"), "trap without live breakpoint");
            }
            return Ok(decision);
        }

        for id in ids.iter().copied() {
            tracing::debug!(%id, tid = thread.id(), "breakpoint triggered");

            let result = self
                .breakpoints
                .fire(id, session, thread)
                .map_err(|source| crate::Error::Callback { id, source })?;

            if result == CallbackResult::StopWait {
                decision = CallbackResult::StopWait;
            }
        }

        let hit = BreakpointHit {
            addr,
            thread_id: thread.id(),
            ids,
        };

        let handlers_decision = self
            .handlers
            .decide(|h| h.breakpoint_hit(session, thread, &hit))
            .map_err(|(id, source)| crate::Error::Handler { id, source })?;

        if handlers_decision == CallbackResult::StopWait {
            decision = CallbackResult::StopWait;
        }

        Ok(decision)
    }

    fn on_exception(
        &mut self,
        session: &mut S,
        thread: &S::StoppedThread,
        exception: &S::Exception,
    ) -> crate::Result<CallbackResult, S::Error> {
        let decision = self
            .handlers
            .decide(|h| h.exception(session, thread, exception))
            .map_err(|(id, source)| crate::Error::Handler { id, source })?;

        if self.config.stop_on_exception {
            Ok(CallbackResult::StopWait)
        } else {
            Ok(decision)
        }
    }
}
