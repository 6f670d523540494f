use std::io::Write;

use capstone::Capstone;
use capstone::arch::BuildsCapstone;
use miette::IntoDiagnostic;
use trapdoor_debugger::Session;
use trapdoor_dispatch::debugger::Thread;
use trapdoor_dispatch::dispatcher::Dispatcher;

/// Longest instruction of the supported architectures.
const MAX_INSN_LEN: usize = 15;

pub fn disassembler() -> miette::Result<Capstone> {
    let disass = if cfg!(target_arch = "x86_64") {
        Capstone::new()
            .x86()
            .mode(capstone::arch::x86::ArchMode::Mode64)
            .build()
            .into_diagnostic()?
    } else if cfg!(target_arch = "aarch64") {
        Capstone::new()
            .arm64()
            .mode(capstone::arch::arm64::ArchMode::Arm)
            .build()
            .into_diagnostic()?
    } else {
        miette::bail!("unsupported CPU architecture")
    };

    Ok(disass)
}

/// Writes where the held thread of the debuggee is stopped.
pub async fn write_stop(
    dispatcher: &mut Dispatcher<Session>,
    disass: &Capstone,
    reason: &str,
    output: &mut dyn Write,
) -> miette::Result<()> {
    let Some((thread_id, addr)) = dispatcher
        .stopped_thread()
        .map(|thread| (thread.id(), thread.instr_addr()))
    else {
        return Ok(());
    };

    write!(output, "[{thread_id}] {reason} at {addr:#x}").into_diagnostic()?;

    match dispatcher.symbolize(addr).await.into_diagnostic()? {
        Some((symbol, 0)) => write!(output, " <{symbol}>").into_diagnostic()?,
        Some((symbol, offset)) => write!(output, " <{symbol}+{offset:#x}>").into_diagnostic()?,
        None => (),
    }

    // the instruction may be near the end of a mapping
    let insn = (1..=MAX_INSN_LEN)
        .rev()
        .step_by(7)
        .find_map(|len| {
            let mut opcodes = vec![0u8; len];
            dispatcher.read_memory(addr, &mut opcodes).ok()?;
            disassemble(disass, &opcodes, addr)
        });

    match insn {
        Some(insn) => writeln!(output, ": {insn}").into_diagnostic(),
        None => writeln!(output).into_diagnostic(),
    }
}

fn disassemble(disass: &Capstone, opcodes: &[u8], addr: u64) -> Option<String> {
    let code = disass.disasm_count(opcodes, addr, 1).ok()?;

    code.first().map(|insn| {
        let mut asm = String::new();

        if let Some(m) = insn.mnemonic() {
            asm.push_str(m);
        }

        if let Some(op) = insn.op_str() {
            asm.push(' ');
            asm.push_str(op);
        }

        asm.trim().to_owned()
    })
}
