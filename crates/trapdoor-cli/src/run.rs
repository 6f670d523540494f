use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use miette::IntoDiagnostic;
use tokio::process::{ChildStderr, ChildStdout};
use trapdoor_debugger::{Debugger, Exception, Session, StoppedThread};
use trapdoor_dispatch::breakpoint::{BreakpointId, CallbackResult, Location};
use trapdoor_dispatch::debugger::{ExitStatus, Thread};
use trapdoor_dispatch::dispatcher::{Dispatcher, DispatcherConfig, StopReason};
use trapdoor_dispatch::handler::EventHandler;
use trapdoor_dispatch::{CallbackError, Command};

use crate::report;
use crate::{BreakpointAction, RunConfig};

/// Runs the subcommand for running a program with breakpoints.
///
/// Returns the exit code of the debuggee.
pub fn evaluate_run(config: String, program: PathBuf, args: Vec<String>) -> miette::Result<i32> {
    let config = parse_run_config(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    // the debuggee is traced by this thread, which `block_on` runs on
    runtime.block_on(async move {
        let mut output = std::io::stderr();
        let disass = report::disassembler()?;

        let command = Command::new(program).args(args);

        let (mut dispatcher, stdio) = Dispatcher::spawn(
            &mut Debugger::new(),
            command,
            DispatcherConfig::default().with_initial_break(config.initial_break),
        )
        .await
        .into_diagnostic()?;

        let stdout = ChildStdout::from_std(stdio.stdout)
            .map(|mut stdout| {
                tokio::spawn(
                    async move { tokio::io::copy(&mut stdout, &mut tokio::io::stdout()).await },
                )
            })
            .into_diagnostic()?;

        let stderr = ChildStderr::from_std(stdio.stderr)
            .map(|mut stderr| {
                tokio::spawn(
                    async move { tokio::io::copy(&mut stderr, &mut tokio::io::stderr()).await },
                )
            })
            .into_diagnostic()?;

        let mut stdin = stdio.stdin;
        std::thread::spawn(move || std::io::copy(&mut std::io::stdin(), &mut stdin));

        dispatcher.add_event_handler(EventLogger);

        if config.initial_break && dispatcher.go().await.into_diagnostic()? == StopReason::Break {
            report::write_stop(&mut dispatcher, &disass, "initial break", &mut output).await?;
        }

        let mut breakpoints = Vec::with_capacity(config.breakpoints.len());

        if dispatcher.process_id().is_some() {
            for bp in config.breakpoints {
                breakpoints.push(TrackedBreakpoint::set(&mut dispatcher, bp).await?);
            }
        }

        loop {
            let reason = dispatcher.go().await.into_diagnostic()?;

            match reason {
                StopReason::NoDebuggee => break,
                StopReason::Break => {
                    let addr = dispatcher.stopped_thread().map(Thread::instr_addr);

                    let stops_here = breakpoints
                        .iter()
                        .any(|bp| bp.action == BreakpointAction::Stop && Some(bp.addr) == addr);

                    if stops_here {
                        report::write_stop(&mut dispatcher, &disass, "breakpoint", &mut output)
                            .await?;
                    }
                }
                StopReason::Other => {
                    report::write_stop(&mut dispatcher, &disass, "stopped", &mut output).await?;
                }
            }

            for bp in breakpoints.iter_mut().filter(|bp| bp.is_exhausted()) {
                if dispatcher.remove_breakpoint(bp.id).into_diagnostic()? {
                    tracing::info!(id = %bp.id, location = %bp.location, "breakpoint removed");
                }

                bp.removed = true;
            }
        }

        let _ = stdout.await;
        let _ = stderr.await;

        writeln!(output, "breakpoints:").into_diagnostic()?;

        for bp in breakpoints.iter() {
            writeln!(
                output,
                "  #{:<4} {:<32} {} hit(s)",
                bp.id.to_string(),
                bp.location.to_string(),
                bp.hits.load(Ordering::Relaxed)
            )
            .into_diagnostic()?;
        }

        let exit_code = match dispatcher.exit_status() {
            Some(status) => {
                writeln!(output, "debuggee exited with {status}").into_diagnostic()?;

                match status {
                    ExitStatus::ExitCode(code) => *code,
                    ExitStatus::Exception(Exception(signal)) => 128 + *signal as i32,
                }
            }
            None => 1,
        };

        Ok(exit_code)
    })
}

/// Breakpoint set from the configuration.
struct TrackedBreakpoint {
    id: BreakpointId,
    location: Location,
    addr: u64,
    action: BreakpointAction,
    max_hits: Option<u64>,
    hits: Arc<AtomicU64>,
    removed: bool,
}

impl TrackedBreakpoint {
    async fn set(
        dispatcher: &mut Dispatcher<Session>,
        config: crate::BreakpointConfig,
    ) -> miette::Result<Self> {
        let hits = Arc::new(AtomicU64::new(0));

        let callback = {
            let hits = hits.clone();
            let location = config.location.clone();
            let action = config.action;
            let max_hits = config.max_hits;

            move |id: BreakpointId| {
                let count = hits.fetch_add(1, Ordering::Relaxed) + 1;

                tracing::info!(%id, %location, hits = count, "breakpoint hit");

                // exhausted breakpoints are removed by the caller of `go`
                if action == BreakpointAction::Stop || max_hits.is_some_and(|max| count >= max) {
                    CallbackResult::StopWait
                } else {
                    CallbackResult::Proceed
                }
            }
        };

        let id = dispatcher
            .set_breakpoint(config.location.clone(), callback)
            .await
            .into_diagnostic()?;

        let addr = dispatcher
            .breakpoint(id)
            .map(|info| info.addr)
            .unwrap_or_default();

        Ok(Self {
            id,
            location: config.location,
            addr,
            action: config.action,
            max_hits: config.max_hits,
            hits,
            removed: false,
        })
    }

    fn is_exhausted(&self) -> bool {
        !self.removed
            && self
                .max_hits
                .is_some_and(|max| self.hits.load(Ordering::Relaxed) >= max)
    }
}

/// Logs the debug events which aren't breakpoint hits.
struct EventLogger;

impl EventHandler<Session> for EventLogger {
    fn initial_break(
        &mut self,
        _session: &mut Session,
        thread: &StoppedThread,
    ) -> Result<(), CallbackError> {
        tracing::info!(tid = thread.id(), "entry point reached");
        Ok(())
    }

    fn exception(
        &mut self,
        _session: &mut Session,
        thread: &StoppedThread,
        exception: &Exception,
    ) -> Result<CallbackResult, CallbackError> {
        tracing::info!(tid = thread.id(), %exception, "exception");
        Ok(CallbackResult::Proceed)
    }

    fn thread_created(
        &mut self,
        _session: &mut Session,
        parent_thread_id: u64,
        new_thread: &StoppedThread,
    ) -> Result<(), CallbackError> {
        tracing::info!(parent = parent_thread_id, tid = new_thread.id(), "thread created");
        Ok(())
    }

    fn thread_exited(
        &mut self,
        _session: &mut Session,
        thread_id: u64,
        exit_code: i32,
    ) -> Result<(), CallbackError> {
        tracing::info!(tid = thread_id, exit_code, "thread exited");
        Ok(())
    }

    fn process_exited(&mut self, status: &ExitStatus<Exception>) -> Result<(), CallbackError> {
        tracing::info!(%status, "process exited");
        Ok(())
    }
}

fn parse_run_config(config: String) -> miette::Result<RunConfig> {
    let path = Path::new(&config);

    let config = if let Some((filename, "kdl")) = path
        .file_name()
        .and_then(OsStr::to_str)
        .zip(path.extension().and_then(OsStr::to_str))
    {
        let content = std::fs::read_to_string(path).into_diagnostic()?;
        knus::parse(filename, &content)?
    } else {
        knus::parse("<content>", &config)?
    };

    Ok(config)
}
