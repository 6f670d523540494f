//! This crate allows to spawn a process, place breakpoints in it and route
//! the resulting traps to user callbacks.
//!
//! Two main components are provided:
//! - The [Dispatcher](self::dispatcher::Dispatcher), which keeps track of the
//!   breakpoints set by the user, resumes the debuggee and decides, based on
//!   the results of the breakpoint callbacks and event handlers, whether a
//!   trap should hand control back to the caller.
//! - A few traits to implement a custom debugger, responsible for spawning a
//!   process and instrumenting it.
//!
//! # Handling breakpoints
//!
//! This is the main use case of this crate.
//!
//! ```no_run
//! use trapdoor_debugger::Debugger;
//!
//! use trapdoor_dispatch::Command;
//! use trapdoor_dispatch::breakpoint::{BreakpointId, CallbackResult};
//! use trapdoor_dispatch::dispatcher::{Dispatcher, DispatcherConfig, StopReason};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (mut dispatcher, _) = Dispatcher::spawn(
//!         &mut Debugger::new(),
//!         Command::new("ls").arg("/"),
//!         DispatcherConfig::default(),
//!     )
//!     .await
//!     .unwrap();
//!
//!     // run until the entry point of the executable
//!     assert_eq!(dispatcher.go().await.unwrap(), StopReason::Break);
//!
//!     // log every call to `opendir`, without stopping
//!     dispatcher
//!         .set_breakpoint("opendir", |id: BreakpointId| {
//!             tracing::info!(%id, "opendir called");
//!             CallbackResult::Proceed
//!         })
//!         .await
//!         .unwrap();
//!
//!     // wait for the process to exit
//!     assert_eq!(dispatcher.go().await.unwrap(), StopReason::NoDebuggee);
//! }
//! ```
//!
//! # Implementing a custom debugger
//!
//! The [Debugger](self::debugger::Debugger)/[DebugSession](self::debugger::DebugSession)
//! traits allow to plug a different debugging backend under the dispatcher
//! (e.g., remote debugging through `gdbserver`). Most of the time, the
//! default debugger provided by `trapdoor-debugger` is what you want.

/// Module containing the breakpoint types and callbacks.
pub mod breakpoint;

/// Module containing traits for implementing a custom debugger.
pub mod debugger;

/// Module implementing the breakpoint dispatcher.
pub mod dispatcher;

/// Module containing traits for handling debug events.
pub mod handler;

mod command;
mod error;

pub use self::command::{Command, CommandEnv};
pub use self::error::{CallbackError, DebuggerError, Error, Result};
