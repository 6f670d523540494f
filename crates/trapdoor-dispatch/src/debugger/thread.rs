/// Trait providing functions for working with stopped threads.
pub trait Thread {
    /// Returns the thread's ID.
    fn id(&self) -> u64;

    /// Returns the thread's instruction address.
    fn instr_addr(&self) -> u64;

    /// Returns whether the thread is in single-step mode.
    fn is_single_step(&self) -> bool;

    /// Enables or disables single-step mode for this thread.
    fn set_single_step(&mut self, enable: bool);
}
