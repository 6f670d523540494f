use trapdoor_dispatch::Command;
use trapdoor_dispatch::debugger::DebuggeeStdio;

use super::session::Session;
use crate::sys;

/// Default debugger (local debugging) implementation.
///
/// # Note
///
/// Right now, only **Linux** is supported.
#[derive(Default)]
pub struct Debugger;

impl Debugger {
    /// Creates a new debugger.
    pub const fn new() -> Self {
        Self
    }
}

impl trapdoor_dispatch::debugger::Debugger for Debugger {
    type Session = Session;

    async fn spawn(&mut self, command: Command) -> crate::Result<(Session, DebuggeeStdio)> {
        let (debuggee_handle, debuggee_stdio) = sys::spawn_debuggee(command).await?;

        let session = Session::init(debuggee_handle).await?;

        Ok((session, debuggee_stdio))
    }
}
