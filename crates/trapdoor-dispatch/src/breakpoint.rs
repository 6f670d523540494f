use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::CallbackError;
use crate::debugger::DebugSession;

/// Identifier of a breakpoint set through a [Dispatcher](crate::dispatcher::Dispatcher).
///
/// Identifiers are never reused by a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(pub(crate) u64);

impl BreakpointId {
    /// Returns the raw value of this identifier.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Decision of a breakpoint callback (or event handler) on a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackResult {
    /// Keep the debuggee running.
    #[default]
    Proceed,

    /// Stop the debuggee and hand control back to the caller of
    /// [go](crate::dispatcher::Dispatcher::go).
    StopWait,
}

/// Code location of a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Absolute address in the debuggee's address space.
    Addr(u64),

    /// Symbol name, optionally restricted to a single mapped binary.
    Symbol {
        /// File name of the binary containing the symbol.
        binary: Option<String>,

        /// Name of the symbol.
        name: String,
    },
}

impl Location {
    /// Location of a symbol, searched within every mapped binary.
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol {
            binary: None,
            name: name.into(),
        }
    }

    /// Location of a symbol within the binary with the given file name.
    pub fn symbol_in(binary: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Symbol {
            binary: Some(binary.into()),
            name: name.into(),
        }
    }
}

impl From<u64> for Location {
    fn from(addr: u64) -> Self {
        Self::Addr(addr)
    }
}

impl From<&str> for Location {
    /// Parses the location, falling back to a symbol name.
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| Self::symbol(s))
    }
}

impl FromStr for Location {
    type Err = ParseLocationError;

    /// Parses `0x401000`, `4198400`, `binary!symbol` or `symbol`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s.is_empty() {
            return Err(ParseLocationError::Empty);
        }

        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16)
                .map(Self::Addr)
                .map_err(|_| ParseLocationError::BadAddress(s.to_owned()));
        }

        if s.starts_with(|c: char| c.is_ascii_digit()) {
            return s
                .parse()
                .map(Self::Addr)
                .map_err(|_| ParseLocationError::BadAddress(s.to_owned()));
        }

        match s.split_once('!') {
            Some((binary, name)) if binary.is_empty() || name.is_empty() => {
                Err(ParseLocationError::BadSymbol(s.to_owned()))
            }
            Some((binary, name)) => Ok(Self::symbol_in(binary, name)),
            None => Ok(Self::symbol(s)),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => write!(f, "{addr:#x}"),
            Self::Symbol {
                binary: Some(binary),
                name,
            } => write!(f, "{binary}!{name}"),
            Self::Symbol { binary: None, name } => f.write_str(name),
        }
    }
}

/// Error returned when parsing a [Location].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseLocationError {
    /// Empty location.
    #[error("empty location")]
    Empty,

    /// Malformed address.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// Malformed `binary!symbol` pair.
    #[error("bad symbol: {0}")]
    BadSymbol(String),
}

/// Trait for implementing a breakpoint callback.
///
/// Closures taking the [BreakpointId] and returning a [CallbackResult]
/// implement this trait.
pub trait BreakpointCallback<S: DebugSession> {
    /// Function called when the breakpoint is triggered.
    ///
    /// The returned value tells whether the debuggee should keep running.
    fn on_breakpoint(
        &mut self,
        session: &mut S,
        thread: &S::StoppedThread,
        id: BreakpointId,
    ) -> Result<CallbackResult, CallbackError>;
}

impl<S, F> BreakpointCallback<S> for F
where
    S: DebugSession,
    F: FnMut(BreakpointId) -> CallbackResult,
{
    fn on_breakpoint(
        &mut self,
        _session: &mut S,
        _thread: &S::StoppedThread,
        id: BreakpointId,
    ) -> Result<CallbackResult, CallbackError> {
        Ok(self(id))
    }
}

/// Breakpoint which is removed once dropped.
///
/// The removal is applied by the dispatcher before it resumes the debuggee
/// again, so the breakpoint never fires after the drop.
#[must_use = "the breakpoint is removed when the guard is dropped"]
pub struct ScopedBreakpoint {
    id: BreakpointId,
    removals: Option<UnboundedSender<BreakpointId>>,
}

impl ScopedBreakpoint {
    pub(crate) const fn new(id: BreakpointId, removals: UnboundedSender<BreakpointId>) -> Self {
        Self {
            id,
            removals: Some(removals),
        }
    }

    /// Returns the identifier of the breakpoint.
    pub const fn id(&self) -> BreakpointId {
        self.id
    }

    /// Keeps the breakpoint alive past the guard.
    pub fn keep(mut self) -> BreakpointId {
        self.removals = None;
        self.id
    }
}

impl Drop for ScopedBreakpoint {
    fn drop(&mut self) {
        if let Some(removals) = self.removals.take() {
            // the dispatcher is already gone, and so are its breakpoints
            let _ = removals.send(self.id);
        }
    }
}

/// Public view over a registered breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo {
    /// Identifier of the breakpoint.
    pub id: BreakpointId,

    /// Location given when the breakpoint was set.
    pub location: Location,

    /// Resolved address of the breakpoint.
    pub addr: u64,

    /// Number of times the breakpoint fired.
    pub hits: u64,
}

struct BreakpointEntry<S: DebugSession> {
    location: Location,
    addr: u64,
    hits: u64,
    callback: Option<Box<dyn BreakpointCallback<S> + Send>>,
}

/// Breakpoints registered by the user, keyed by identifier.
pub(crate) struct BreakpointTable<S: DebugSession> {
    entries: IndexMap<BreakpointId, BreakpointEntry<S>>,

    /// Live breakpoints per address, in registration order.
    by_addr: HashMap<u64, Vec<BreakpointId>>,

    next_id: u64,
}

impl<S: DebugSession> BreakpointTable<S> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            by_addr: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert(
        &mut self,
        location: Location,
        addr: u64,
        callback: Option<Box<dyn BreakpointCallback<S> + Send>>,
    ) -> BreakpointId {
        let id = BreakpointId(self.next_id);
        self.next_id += 1;

        self.by_addr.entry(addr).or_default().push(id);

        self.entries.insert(
            id,
            BreakpointEntry {
                location,
                addr,
                hits: 0,
                callback,
            },
        );

        id
    }

    /// On success, returns the address of the removed breakpoint.
    pub fn remove(&mut self, id: BreakpointId) -> Option<u64> {
        let addr = self.entries.shift_remove(&id)?.addr;

        if let Some(ids) = self.by_addr.get_mut(&addr) {
            ids.retain(|other| *other != id);

            if ids.is_empty() {
                self.by_addr.remove(&addr);
            }
        }

        Some(addr)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_addr.clear();
    }

    /// Returns whether a live breakpoint is registered at the given address.
    pub fn contains_addr(&self, addr: u64) -> bool {
        self.by_addr.contains_key(&addr)
    }

    /// Returns the live breakpoints at the given address, in registration
    /// order.
    pub fn ids_at(&self, addr: u64) -> Vec<BreakpointId> {
        self.by_addr.get(&addr).cloned().unwrap_or_default()
    }

    pub fn info(&self, id: BreakpointId) -> Option<BreakpointInfo> {
        self.entries.get(&id).map(|entry| BreakpointInfo {
            id,
            location: entry.location.clone(),
            addr: entry.addr,
            hits: entry.hits,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = BreakpointInfo> + '_ {
        self.entries.keys().filter_map(|id| self.info(*id))
    }

    /// Fires the breakpoint with the given identifier.
    ///
    /// A breakpoint without callback always stops the debuggee.
    pub fn fire(
        &mut self,
        id: BreakpointId,
        session: &mut S,
        thread: &S::StoppedThread,
    ) -> Result<CallbackResult, CallbackError> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Ok(CallbackResult::Proceed);
        };

        entry.hits += 1;

        match entry.callback {
            Some(ref mut callback) => callback.on_breakpoint(session, thread, id),
            None => Ok(CallbackResult::StopWait),
        }
    }
}
