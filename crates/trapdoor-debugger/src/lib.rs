//! This crate provides a default implementation of a debugger (to be used with
//! `trapdoor-dispatch`).
//!
//! The debugger is able to spawn a process (on the **same host machine**) as
//! a child and debug it.
//!
//! <div class="warning">
//!
//! *This crate is not meant to be used on its own! It merely implements the
//! interface (traits) provided by `trapdoor-dispatch`, so that the debugger
//! can be driven by its breakpoint dispatcher.*
//!
//! </div>
//!
//! # Supported Platforms
//!
//! <table>
//!     <thead>
//!         <tr>
//!             <th>Host Machine</th>
//!             <th>Debuggee Platform</th>
//!         </tr>
//!     </thead>
//!     <tbody>
//!         <tr>
//!             <td>Linux <code>x86_64</code></td>
//!             <td><code>x86_64</code></td>
//!         </tr>
//!         <tr>
//!             <td>Linux <code>aarch64</code></td>
//!             <td><code>aarch64</code></td>
//!         </tr>
//!     </tbody>
//! </table>

mod common;
mod error;
mod sys;

pub use self::common::binary::MappedElf;
pub use self::common::debugger::Debugger;
pub use self::common::session::Session;
pub use self::common::thread::StoppedThread;
pub use self::error::{Error, Result};
pub use self::sys::Exception;
