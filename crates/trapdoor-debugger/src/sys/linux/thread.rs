use std::ffi::c_void;
use std::mem;

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::regset::NT_PRSTATUS;
use nix::sys::ptrace::{self, RegisterSet};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

#[cfg(target_arch = "x86_64")]
const SI_CODE_BREAKPOINT: i32 = 0x80; // SI_KERNEL (int3)
#[cfg(target_arch = "aarch64")]
const SI_CODE_BREAKPOINT: i32 = 1; // TRAP_BRKPT

const SI_CODE_SINGLESTEP: i32 = 2; // TRAP_TRACE

/// Origin of a `SIGTRAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Breakpoint,
    Singlestep,
}

/// Resumes a stopped thread, optionally delivering a signal to it.
///
/// Resuming a thread which vanished (e.g., killed along with its process)
/// is not an error.
pub fn resume_thread(
    thread_id: u64,
    single_step: bool,
    signal: Option<Signal>,
) -> crate::sys::Result<()> {
    let pid = Pid::from_raw(thread_id as libc::pid_t);

    let res = if single_step {
        ptrace::step(pid, signal)
    } else {
        ptrace::cont(pid, signal)
    };

    match res {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Tells why the given thread stopped with a `SIGTRAP`.
///
/// Returns [None] if the trap was neither caused by a software breakpoint
/// nor by a single-step (e.g., sent by another process).
pub fn trap_kind(thread_id: u64) -> crate::sys::Result<Option<TrapKind>> {
    let siginfo = ptrace::getsiginfo(Pid::from_raw(thread_id as libc::pid_t))?;

    Ok(match siginfo.si_code {
        SI_CODE_BREAKPOINT => Some(TrapKind::Breakpoint),
        SI_CODE_SINGLESTEP => Some(TrapKind::Singlestep),
        _ => None,
    })
}

pub fn get_thread_registers(thread_id: u64) -> crate::sys::Result<Registers> {
    let mut data = mem::MaybeUninit::<libc::user_regs_struct>::uninit();

    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: mem::size_of::<libc::user_regs_struct>(),
    };

    unsafe {
        Errno::result(libc::ptrace(
            ptrace::Request::PTRACE_GETREGSET as u32,
            thread_id as libc::pid_t,
            NT_PRSTATUS::VALUE as i32,
            &mut iov as *mut libc::iovec,
        ))?
    };

    // the kernel fills a smaller register set for 32-bit threads
    if iov.iov_len != mem::size_of::<libc::user_regs_struct>() {
        return Err(crate::sys::Error::RegisterSetSize(iov.iov_len));
    }

    Ok(Registers(unsafe { data.assume_init() }))
}

pub fn set_thread_registers(thread_id: u64, regs: &Registers) -> crate::sys::Result<()> {
    let mut iov = libc::iovec {
        iov_base: &regs.0 as *const libc::user_regs_struct as *mut c_void,
        iov_len: mem::size_of::<libc::user_regs_struct>(),
    };

    unsafe {
        Errno::result(libc::ptrace(
            ptrace::Request::PTRACE_SETREGSET as u32,
            thread_id as libc::pid_t,
            NT_PRSTATUS::VALUE as i32,
            &mut iov as *mut libc::iovec,
        ))?
    };

    Ok(())
}

/// General-purpose registers of a 64-bit thread.
pub struct Registers(libc::user_regs_struct);

impl Registers {
    pub fn instr_addr(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.0.rip
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.0.pc
        }
    }

    /// Returns the value of the register with the given (lowercase) name.
    #[cfg(target_arch = "x86_64")]
    pub fn by_name(&self, name: &str) -> Option<u64> {
        let regs = &self.0;

        Some(match name {
            "rax" => regs.rax,
            "rbx" => regs.rbx,
            "rcx" => regs.rcx,
            "rdx" => regs.rdx,
            "rsi" => regs.rsi,
            "rdi" => regs.rdi,
            "rbp" => regs.rbp,
            "rsp" | "sp" => regs.rsp,
            "r8" => regs.r8,
            "r9" => regs.r9,
            "r10" => regs.r10,
            "r11" => regs.r11,
            "r12" => regs.r12,
            "r13" => regs.r13,
            "r14" => regs.r14,
            "r15" => regs.r15,
            "rip" | "pc" => regs.rip,
            "eflags" => regs.eflags,
            "orig_rax" => regs.orig_rax,
            "cs" => regs.cs,
            "ss" => regs.ss,
            "ds" => regs.ds,
            "es" => regs.es,
            "fs" => regs.fs,
            "gs" => regs.gs,
            "fs_base" => regs.fs_base,
            "gs_base" => regs.gs_base,
            _ => return None,
        })
    }

    /// Returns the value of the register with the given (lowercase) name.
    #[cfg(target_arch = "aarch64")]
    pub fn by_name(&self, name: &str) -> Option<u64> {
        let regs = &self.0;

        Some(match name {
            "sp" => regs.sp,
            "pc" => regs.pc,
            "pstate" => regs.pstate,
            "fp" => regs.regs[29],
            "lr" => regs.regs[30],
            _ => {
                let index: usize = name.strip_prefix('x')?.parse().ok()?;
                *regs.regs.get(index)?
            }
        })
    }

    pub fn set_instr_addr(&mut self, addr: u64) {
        #[cfg(target_arch = "x86_64")]
        {
            self.0.rip = addr;
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.0.pc = addr;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use nix::libc;

    use super::Registers;

    #[test]
    fn register_names() {
        let mut regs = Registers(unsafe { mem::zeroed::<libc::user_regs_struct>() });
        regs.set_instr_addr(0x401000);

        assert_eq!(regs.by_name("pc"), Some(0x401000));
        assert_eq!(regs.by_name("xmm0"), None);
        assert_eq!(regs.by_name(""), None);

        #[cfg(target_arch = "x86_64")]
        {
            regs.0.rdi = 1;
            assert_eq!(regs.by_name("rip"), Some(0x401000));
            assert_eq!(regs.by_name("rdi"), Some(1));
        }

        #[cfg(target_arch = "aarch64")]
        {
            regs.0.regs[30] = 0x1234;
            assert_eq!(regs.by_name("x30"), Some(0x1234));
            assert_eq!(regs.by_name("lr"), Some(0x1234));
            assert_eq!(regs.by_name("x31"), None);
        }
    }
}
