use std::fmt;

use crate::CallbackError;
use crate::breakpoint::{BreakpointId, CallbackResult};
use crate::debugger::{DebugSession, ExitStatus};

/// Identifier of an event handler subscribed to a [Dispatcher](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(pub(crate) u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Breakpoint trap, as seen by event handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointHit {
    /// Address of the trap.
    pub addr: u64,

    /// ID of the thread which triggered the trap.
    pub thread_id: u64,

    /// Live breakpoints registered at the trap address, in registration
    /// order.
    pub ids: Vec<BreakpointId>,
}

/// Trait for implementing a debug event handler.
///
/// Every function has a default implementation, so that a handler only
/// implements the notifications it cares about. Handlers are notified in
/// subscription order.
pub trait EventHandler<S: DebugSession> {
    /// Function called once per breakpoint trap.
    ///
    /// This is called after the callbacks of the triggered breakpoints.
    /// Returning [StopWait](CallbackResult::StopWait) stops the debuggee,
    /// even if every breakpoint callback asked to proceed.
    fn breakpoint_hit(
        &mut self,
        _session: &mut S,
        _thread: &S::StoppedThread,
        _hit: &BreakpointHit,
    ) -> Result<CallbackResult, CallbackError> {
        Ok(CallbackResult::Proceed)
    }

    /// Function called when the debuggee reaches the entry point of its
    /// executable for the first time.
    fn initial_break(
        &mut self,
        _session: &mut S,
        _thread: &S::StoppedThread,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Function called when a thread raises an exception which isn't a
    /// breakpoint trap.
    ///
    /// [Proceed](CallbackResult::Proceed) delivers the exception to the
    /// debuggee.
    fn exception(
        &mut self,
        _session: &mut S,
        _thread: &S::StoppedThread,
        _exception: &S::Exception,
    ) -> Result<CallbackResult, CallbackError> {
        Ok(CallbackResult::Proceed)
    }

    /// Function called when a new thread is created by the debuggee.
    fn thread_created(
        &mut self,
        _session: &mut S,
        _parent_thread_id: u64,
        _new_thread: &S::StoppedThread,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Function called when a thread of the debuggee is about to exit.
    fn thread_exited(
        &mut self,
        _session: &mut S,
        _thread_id: u64,
        _exit_code: i32,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Function called when the debuggee has exited.
    fn process_exited(&mut self, _status: &ExitStatus<S::Exception>) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Event handlers subscribed to a dispatcher.
pub(crate) struct HandlerSet<S: DebugSession> {
    handlers: Vec<(HandlerId, Box<dyn EventHandler<S> + Send>)>,
    next_id: u64,
}

impl<S: DebugSession> HandlerSet<S> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add(&mut self, handler: Box<dyn EventHandler<S> + Send>) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, handler));
        id
    }

    pub fn remove(&mut self, id: HandlerId) -> Option<Box<dyn EventHandler<S> + Send>> {
        let pos = self.handlers.iter().position(|(h, _)| *h == id)?;
        Some(self.handlers.remove(pos).1)
    }

    /// Calls `f` on every handler, stopping at the first failure.
    pub fn notify<F>(&mut self, mut f: F) -> Result<(), (HandlerId, CallbackError)>
    where
        F: FnMut(&mut Box<dyn EventHandler<S> + Send>) -> Result<(), CallbackError>,
    {
        for (id, handler) in self.handlers.iter_mut() {
            f(handler).map_err(|e| (*id, e))?;
        }

        Ok(())
    }

    /// Like [notify](Self::notify), but collects the handlers' decisions.
    ///
    /// Every handler is called, and the debuggee stops if any of them asked
    /// to.
    pub fn decide<F>(&mut self, mut f: F) -> Result<CallbackResult, (HandlerId, CallbackError)>
    where
        F: FnMut(&mut Box<dyn EventHandler<S> + Send>) -> Result<CallbackResult, CallbackError>,
    {
        let mut decision = CallbackResult::Proceed;

        for (id, handler) in self.handlers.iter_mut() {
            if f(handler).map_err(|e| (*id, e))? == CallbackResult::StopWait {
                decision = CallbackResult::StopWait;
            }
        }

        Ok(decision)
    }
}
