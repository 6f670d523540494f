mod utils;

use std::path::Path;

use test_log::test;
use trapdoor_debugger::{Debugger, Session};
use trapdoor_dispatch::breakpoint::{BreakpointId, CallbackResult, Location};
use trapdoor_dispatch::debugger::{DebugSession, ExitStatus, MappedBinary, Thread};
use trapdoor_dispatch::dispatcher::{Dispatcher, DispatcherConfig, StopReason};
use trapdoor_dispatch::{Command, Error};

use crate::common::{BreakpointCounter, Counter, EventRecorder, FailingCallback};

async fn spawn_tracee(
    asm_path: &str,
    is_pie: bool,
    config: DispatcherConfig,
) -> (Dispatcher<Session>, tempfile::TempPath) {
    let tracee_path = self::utils::compile_tracee(Path::new(asm_path), is_pie);

    let (dispatcher, _) = Dispatcher::spawn(
        &mut Debugger::new(),
        Command::new(tracee_path.to_path_buf()),
        config,
    )
    .await
    .expect("spawn");

    (dispatcher, tracee_path)
}

async fn spawn_breakhandlertest(is_pie: bool) -> (Dispatcher<Session>, tempfile::TempPath) {
    spawn_tracee(
        "tests/linux/breakhandlertest.asm",
        is_pie,
        DispatcherConfig::default(),
    )
    .await
}

/// Spawns the tracee and runs it until its entry point.
async fn break_at_entry(is_pie: bool) -> (Dispatcher<Session>, tempfile::TempPath) {
    let (mut dispatcher, tracee_path) = spawn_breakhandlertest(is_pie).await;

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);

    let entry_addr = dispatcher.session().expect("session").entry_addr();
    let thread = dispatcher.stopped_thread().expect("stopped thread");
    assert_eq!(thread.instr_addr(), entry_addr);

    (dispatcher, tracee_path)
}

fn assert_exited_normally(dispatcher: &Dispatcher<Session>) {
    match dispatcher.exit_status() {
        Some(ExitStatus::ExitCode(exit_code)) => assert_eq!(*exit_code, 0),
        Some(ExitStatus::Exception(exception)) => {
            panic!("Debuggee exited by {exception}");
        }
        None => panic!("Debuggee still running"),
    }
}

#[test(tokio::test)]
async fn no_breakpoint() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_exited_normally(&dispatcher);

    // every later call sees the debuggee gone
    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_eq!(dispatcher.step().await.expect("step"), StopReason::NoDebuggee);
    assert!(dispatcher.process_id().is_none());
    assert!(dispatcher.stopped_thread().is_none());
}

#[test(tokio::test)]
async fn set_breakpoint_nopie() {
    test_set_breakpoint(false).await;
}

#[test(tokio::test)]
async fn set_breakpoint_pie() {
    test_set_breakpoint(true).await;
}

async fn test_set_breakpoint(is_pie: bool) {
    let (mut dispatcher, tracee_path) = break_at_entry(is_pie).await;
    let tracee_name = tracee_path.file_name().unwrap().to_string_lossy();

    let id = dispatcher
        .set_breakpoint_at(Location::symbol_in(tracee_name.as_ref(), "CdeclFunc"))
        .await
        .expect("set_breakpoint_at");

    let addr = dispatcher.breakpoint(id).expect("breakpoint").addr;

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);

    let thread = dispatcher.stopped_thread().expect("stopped thread");
    assert_eq!(thread.instr_addr(), addr);

    assert_eq!(
        dispatcher.symbolize(addr).await.expect("symbolize"),
        Some(("CdeclFunc".to_owned(), 0))
    );
    assert_eq!(dispatcher.breakpoint(id).expect("breakpoint").hits, 1);

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_exited_normally(&dispatcher);

    // breakpoints die with the debuggee
    assert_eq!(dispatcher.breakpoints().count(), 0);
}

#[test(tokio::test)]
async fn remove_breakpoint() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    let id = dispatcher
        .set_breakpoint_at("CdeclFunc")
        .await
        .expect("set_breakpoint_at");

    assert!(dispatcher.remove_breakpoint(id).expect("remove_breakpoint"));
    assert!(!dispatcher.remove_breakpoint(id).expect("remove_breakpoint"));

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_exited_normally(&dispatcher);

    assert!(!dispatcher.remove_breakpoint(id).expect("remove_breakpoint"));
}

#[test(tokio::test)]
async fn break_callback() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;
    let counter = Counter::default();

    dispatcher
        .set_breakpoint("CdeclFunc", counter.callback(CallbackResult::StopWait))
        .await
        .expect("set_breakpoint");

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);
    assert_eq!(counter.get(), 1);

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_eq!(counter.get(), 1);
}

#[test(tokio::test)]
async fn no_break_callback() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;
    let counter = Counter::default();

    dispatcher
        .set_breakpoint("CdeclFunc", counter.callback(CallbackResult::Proceed))
        .await
        .expect("set_breakpoint");

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_eq!(counter.get(), 1);
    assert_exited_normally(&dispatcher);
}

#[test(tokio::test)]
async fn callbacks_sharing_an_address() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    let first = Counter::default();
    let second = Counter::default();

    dispatcher
        .set_breakpoint("CdeclFunc", first.callback(CallbackResult::Proceed))
        .await
        .expect("set_breakpoint");

    dispatcher
        .set_breakpoint("CdeclFunc", second.callback(CallbackResult::StopWait))
        .await
        .expect("set_breakpoint");

    // one decision to stop is enough, but every callback is called
    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);
    assert_eq!(first.get(), 1);
    assert_eq!(second.get(), 1);

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
}

#[test(tokio::test)]
async fn breakpoint_handler() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;
    let counter = Counter::default();

    dispatcher.add_event_handler(BreakpointCounter(counter.clone()));

    dispatcher
        .set_breakpoint_at("CdeclFunc")
        .await
        .expect("set_breakpoint_at");

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);
    assert_eq!(counter.get(), 1);

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_eq!(counter.get(), 1);
}

#[test(tokio::test)]
async fn removed_handler() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;
    let counter = Counter::default();

    let handler_id = dispatcher.add_event_handler(BreakpointCounter(counter.clone()));
    assert!(dispatcher.remove_event_handler(handler_id));
    assert!(!dispatcher.remove_event_handler(handler_id));

    dispatcher
        .set_breakpoint("CdeclFunc", |_: BreakpointId| CallbackResult::Proceed)
        .await
        .expect("set_breakpoint");

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_eq!(counter.get(), 0);
}

#[test(tokio::test)]
async fn scoped_breakpoint() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;
    let counter = Counter::default();

    let scoped = dispatcher
        .set_scoped_breakpoint("CdeclFunc", counter.callback(CallbackResult::StopWait))
        .await
        .expect("set_scoped_breakpoint");

    let id = scoped.id();
    drop(scoped);

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_eq!(counter.get(), 0);
    assert!(dispatcher.breakpoint(id).is_none());
}

#[test(tokio::test)]
async fn kept_scoped_breakpoint() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;
    let counter = Counter::default();

    let id = dispatcher
        .set_scoped_breakpoint("CdeclFunc", counter.callback(CallbackResult::StopWait))
        .await
        .expect("set_scoped_breakpoint")
        .keep();

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);
    assert_eq!(counter.get(), 1);
    assert!(dispatcher.breakpoint(id).is_some());
}

#[test(tokio::test)]
async fn failing_callback() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    let id = dispatcher
        .set_breakpoint("CdeclFunc", FailingCallback)
        .await
        .expect("set_breakpoint");

    match dispatcher.go().await {
        Err(Error::Callback { id: failed_id, .. }) => assert_eq!(failed_id, id),
        res => panic!("unexpected result: {res:?}"),
    }

    // the trapping thread is kept stopped
    let addr = dispatcher.breakpoint(id).expect("breakpoint").addr;
    let thread = dispatcher.stopped_thread().expect("stopped thread");
    assert_eq!(thread.instr_addr(), addr);

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_exited_normally(&dispatcher);
}

#[test(tokio::test)]
async fn set_breakpoint_without_debuggee() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);

    assert!(matches!(
        dispatcher.set_breakpoint_at("CdeclFunc").await,
        Err(Error::NoDebuggee)
    ));
}

#[test(tokio::test)]
async fn unknown_symbol() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    assert!(matches!(
        dispatcher.set_breakpoint_at("NoSuchFunc").await,
        Err(Error::SymbolNotFound(..))
    ));
    assert_eq!(dispatcher.breakpoints().count(), 0);
}

#[test(tokio::test)]
async fn step_from_breakpoint() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    let id = dispatcher
        .set_breakpoint_at("CdeclFunc")
        .await
        .expect("set_breakpoint_at");

    let addr = dispatcher.breakpoint(id).expect("breakpoint").addr;

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);

    // `push rbp` is a single byte
    assert_eq!(dispatcher.step().await.expect("step"), StopReason::Other);

    let thread = dispatcher.stopped_thread().expect("stopped thread");
    assert_eq!(thread.instr_addr(), addr + 1);

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_exited_normally(&dispatcher);
}

#[test(tokio::test)]
async fn step_onto_breakpoint() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;
    let counter = Counter::default();

    let id = dispatcher
        .set_breakpoint_at("CdeclFunc")
        .await
        .expect("set_breakpoint_at");

    let addr = dispatcher.breakpoint(id).expect("breakpoint").addr;

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);

    // right after `push rbp`
    let next_id = dispatcher
        .set_breakpoint(addr + 1, counter.callback(CallbackResult::StopWait))
        .await
        .expect("set_breakpoint");

    assert_eq!(dispatcher.step().await.expect("step"), StopReason::Break);
    assert_eq!(counter.get(), 1);
    assert_eq!(dispatcher.breakpoint(next_id).expect("breakpoint").hits, 1);

    let thread = dispatcher.stopped_thread().expect("stopped thread");
    assert_eq!(thread.instr_addr(), addr + 1);

    // the breakpoint doesn't trap again when the thread resumes
    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_eq!(counter.get(), 1);
    assert_exited_normally(&dispatcher);
}

#[test(tokio::test)]
async fn read_registers() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    let id = dispatcher
        .set_breakpoint_at("CdeclFunc")
        .await
        .expect("set_breakpoint_at");

    let addr = dispatcher.breakpoint(id).expect("breakpoint").addr;

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);

    assert_eq!(dispatcher.read_register("rdi").expect("rdi"), 1);
    assert_eq!(dispatcher.read_register("rsi").expect("rsi"), 2);
    assert_eq!(dispatcher.read_register("rip").expect("rip"), addr);

    assert!(matches!(
        dispatcher.read_register("r16"),
        Err(Error::UnknownRegister(name)) if name == "r16"
    ));

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);

    assert!(matches!(
        dispatcher.read_register("rip"),
        Err(Error::NoDebuggee)
    ));
}

#[test(tokio::test)]
async fn breakpoint_hit_by_every_thread() {
    let (mut dispatcher, _tracee_path) = spawn_tracee(
        "tests/linux/threadtest.asm",
        false,
        DispatcherConfig::default(),
    )
    .await;

    let recorder = EventRecorder::default();
    dispatcher.add_event_handler(recorder.clone());

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);

    let counter = Counter::default();

    dispatcher
        .set_breakpoint("CdeclFunc", counter.callback(CallbackResult::Proceed))
        .await
        .expect("set_breakpoint");

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
    assert_exited_normally(&dispatcher);

    // no thread runs past the breakpoint while another steps over it
    assert_eq!(counter.get(), 400);
    assert_eq!(recorder.hit_threads.lock().unwrap().len(), 4);

    assert_eq!(recorder.threads_created.get(), 4);
    assert!(recorder.threads_exited.get() >= 4);
}

#[test(tokio::test)]
async fn exception_delivered() {
    let (mut dispatcher, _tracee_path) = spawn_tracee(
        "tests/linux/signaltest.asm",
        false,
        DispatcherConfig::default(),
    )
    .await;

    let recorder = EventRecorder::default();
    dispatcher.add_event_handler(recorder.clone());

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);
    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);

    assert_eq!(recorder.exceptions.get(), 1);

    match dispatcher.exit_status() {
        Some(ExitStatus::Exception(exception)) => assert_eq!(exception.to_string(), "SIGUSR1"),
        status => panic!("unexpected exit status: {status:?}"),
    }
}

#[test(tokio::test)]
async fn stop_on_exception() {
    let (mut dispatcher, _tracee_path) = spawn_tracee(
        "tests/linux/signaltest.asm",
        false,
        DispatcherConfig::default().with_stop_on_exception(true),
    )
    .await;

    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Break);
    assert_eq!(dispatcher.go().await.expect("go"), StopReason::Other);
    assert!(dispatcher.stopped_thread().is_some());

    // the signal is delivered on resume
    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);

    match dispatcher.exit_status() {
        Some(ExitStatus::Exception(exception)) => assert_eq!(exception.to_string(), "SIGUSR1"),
        status => panic!("unexpected exit status: {status:?}"),
    }
}

#[test(tokio::test)]
async fn read_memory_hides_traps() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    let id = dispatcher
        .set_breakpoint_at("CdeclFunc")
        .await
        .expect("set_breakpoint_at");

    let addr = dispatcher.breakpoint(id).expect("breakpoint").addr;

    // push rbp; mov rbp, rsp
    let mut buf = [0; 4];
    dispatcher.read_memory(addr, &mut buf).expect("read_memory");
    assert_eq!(buf, [0x55, 0x48, 0x89, 0xe5]);
}

#[test(tokio::test)]
async fn executable_mapped_first() {
    let (mut dispatcher, tracee_path) = break_at_entry(true).await;
    let tracee_name = tracee_path.file_name().unwrap().to_string_lossy();

    let binaries = dispatcher.binaries().await.expect("binaries");

    assert_eq!(binaries[0].file_name(), tracee_name);
    assert!(
        binaries
            .iter()
            .any(|binary| binary.file_name().starts_with("libc.so"))
    );
}

#[test(tokio::test)]
async fn kill_debuggee() {
    let (mut dispatcher, _tracee_path) = break_at_entry(false).await;

    dispatcher.kill().await.expect("kill");

    assert!(dispatcher.process_id().is_none());
    assert!(matches!(
        dispatcher.exit_status(),
        Some(ExitStatus::Exception(_))
    ));
    assert_eq!(dispatcher.go().await.expect("go"), StopReason::NoDebuggee);
}
