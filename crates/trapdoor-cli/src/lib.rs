//! Crate implementing the CLI commands.

mod cli;
mod config;
mod report;
mod run;

pub use self::cli::{CliAction, CliOpts};
pub use self::config::{BreakpointAction, BreakpointConfig, RunConfig};
pub use self::run::evaluate_run;
