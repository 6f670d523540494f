use trapdoor_dispatch::breakpoint::Location;

/// Configuration of a debugging run.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct RunConfig {
    /// Whether to run the debuggee to its entry point before setting the
    /// breakpoints.
    ///
    /// Breakpoints in shared libraries require it.
    #[knus(child, default = true, unwrap(argument))]
    pub initial_break: bool,

    /// Breakpoints to set.
    #[knus(children(name = "breakpoint"))]
    pub breakpoints: Vec<BreakpointConfig>,
}

/// Configuration of a breakpoint.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct BreakpointConfig {
    /// Location of the breakpoint (`0x401000`, `symbol` or `binary!symbol`).
    #[knus(argument, str)]
    pub location: Location,

    /// What to do when the breakpoint is hit.
    #[knus(property, default)]
    pub action: BreakpointAction,

    /// Number of hits after which the breakpoint is removed.
    #[knus(property)]
    pub max_hits: Option<u64>,
}

/// What to do when a breakpoint is hit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, knus::DecodeScalar)]
pub enum BreakpointAction {
    /// Log the hit and keep running.
    #[default]
    Log,

    /// Report the stopped location, then keep running.
    Stop,
}
