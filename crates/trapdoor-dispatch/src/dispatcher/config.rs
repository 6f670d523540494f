/// Configuration of a [Dispatcher](super::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Whether the first [go](super::Dispatcher::go) stops at the entry point
    /// of the debuggee's executable.
    pub initial_break: bool,

    /// Whether exceptions which aren't breakpoint traps (e.g., signals) stop
    /// the debuggee, even if no event handler asked to.
    pub stop_on_exception: bool,
}

impl DispatcherConfig {
    /// Sets whether the first `go` stops at the entry point.
    pub const fn with_initial_break(mut self, enable: bool) -> Self {
        self.initial_break = enable;
        self
    }

    /// Sets whether exceptions stop the debuggee.
    pub const fn with_stop_on_exception(mut self, enable: bool) -> Self {
        self.stop_on_exception = enable;
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            initial_break: true,
            stop_on_exception: false,
        }
    }
}
