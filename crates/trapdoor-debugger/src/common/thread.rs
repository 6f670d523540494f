use std::collections::HashMap;

use crate::sys::Exception;

/// Book-keeping of the debuggee's threads, between their stops.
pub struct ThreadManager {
    threads: HashMap<u64, ThreadState>,
}

#[derive(Default)]
struct ThreadState {
    single_step: bool,

    /// Whether the thread was resumed since its last stop.
    running: bool,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            threads: HashMap::new(),
        }
    }

    pub fn register_thread_create(&mut self, thread_id: u64) {
        self.threads.insert(thread_id, ThreadState::default());
    }

    pub fn register_thread_exit(&mut self, thread_id: u64) {
        self.threads.remove(&thread_id);
    }

    /// Returns [None] if the thread is unknown.
    pub fn register_thread_stop(
        &mut self,
        thread_id: u64,
        instr_addr: u64,
    ) -> Option<StoppedThread> {
        let state = self.threads.get_mut(&thread_id)?;
        state.running = false;

        Some(StoppedThread {
            id: thread_id,
            instr_addr,
            single_step: state.single_step,
            stopped_by: None,
        })
    }

    pub fn register_thread_resume(&mut self, thread_id: u64, single_step: bool) {
        if let Some(state) = self.threads.get_mut(&thread_id) {
            state.single_step = single_step;
            state.running = true;
        }
    }

    /// Returns the threads resumed since their last stop (except the given
    /// one), along with their single-step mode.
    pub fn running_threads(&self, except: u64) -> Vec<(u64, bool)> {
        self.threads
            .iter()
            .filter(|(id, state)| **id != except && state.running)
            .map(|(id, state)| (*id, state.single_step))
            .collect()
    }
}

/// Thread of the debuggee, stopped by the debugger.
#[derive(Debug)]
pub struct StoppedThread {
    pub(crate) id: u64,
    pub(crate) instr_addr: u64,
    pub(crate) single_step: bool,
    pub(crate) stopped_by: Option<StopCause>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum StopCause {
    /// Trap of the breakpoint at the given address.
    Breakpoint(u64),

    /// Exception to deliver on resume.
    Exception(Exception),
}

impl trapdoor_dispatch::debugger::Thread for StoppedThread {
    fn id(&self) -> u64 {
        self.id
    }

    fn instr_addr(&self) -> u64 {
        self.instr_addr
    }

    fn is_single_step(&self) -> bool {
        self.single_step
    }

    fn set_single_step(&mut self, enable: bool) {
        self.single_step = enable;
    }
}
