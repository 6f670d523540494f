use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use trapdoor_dispatch::CallbackError;
use trapdoor_dispatch::breakpoint::{BreakpointCallback, BreakpointId, CallbackResult};
use trapdoor_dispatch::debugger::DebugSession;
use trapdoor_dispatch::handler::{BreakpointHit, EventHandler};

/// Shared hit counter.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Breakpoint callback counting its calls, always deciding `result`.
    pub fn callback(
        &self,
        result: CallbackResult,
    ) -> impl FnMut(BreakpointId) -> CallbackResult + Send + use<> {
        let counter = self.clone();

        move |_| {
            counter.incr();
            result
        }
    }
}

/// Event handler counting the breakpoint traps.
pub struct BreakpointCounter(pub Counter);

impl<S: DebugSession> EventHandler<S> for BreakpointCounter {
    fn breakpoint_hit(
        &mut self,
        _session: &mut S,
        _thread: &S::StoppedThread,
        hit: &BreakpointHit,
    ) -> Result<CallbackResult, CallbackError> {
        assert!(!hit.ids.is_empty());

        self.0.incr();
        Ok(CallbackResult::Proceed)
    }
}

/// Breakpoint callback which always fails.
pub struct FailingCallback;

impl<S: DebugSession> BreakpointCallback<S> for FailingCallback {
    fn on_breakpoint(
        &mut self,
        _session: &mut S,
        _thread: &S::StoppedThread,
        _id: BreakpointId,
    ) -> Result<CallbackResult, CallbackError> {
        Err("callback failure".into())
    }
}

/// Event handler recording the debuggee's threads and exceptions.
#[derive(Clone, Default)]
pub struct EventRecorder {
    pub threads_created: Counter,
    pub threads_exited: Counter,
    pub exceptions: Counter,

    /// Threads which triggered a breakpoint.
    pub hit_threads: Arc<Mutex<HashSet<u64>>>,
}

impl<S: DebugSession> EventHandler<S> for EventRecorder {
    fn breakpoint_hit(
        &mut self,
        _session: &mut S,
        _thread: &S::StoppedThread,
        hit: &BreakpointHit,
    ) -> Result<CallbackResult, CallbackError> {
        self.hit_threads.lock().unwrap().insert(hit.thread_id);
        Ok(CallbackResult::Proceed)
    }

    fn exception(
        &mut self,
        _session: &mut S,
        _thread: &S::StoppedThread,
        _exception: &S::Exception,
    ) -> Result<CallbackResult, CallbackError> {
        self.exceptions.incr();
        Ok(CallbackResult::Proceed)
    }

    fn thread_created(
        &mut self,
        _session: &mut S,
        _parent_thread_id: u64,
        _new_thread: &S::StoppedThread,
    ) -> Result<(), CallbackError> {
        self.threads_created.incr();
        Ok(())
    }

    fn thread_exited(
        &mut self,
        _session: &mut S,
        _thread_id: u64,
        _exit_code: i32,
    ) -> Result<(), CallbackError> {
        self.threads_exited.incr();
        Ok(())
    }
}
