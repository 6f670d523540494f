use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::sys;

#[cfg(target_arch = "aarch64")]
pub const TRAP_OPCODES: [u8; 4] = [0x0, 0x0, 0x20, 0xd4];
#[cfg(target_arch = "x86_64")]
pub const TRAP_OPCODES: [u8; 1] = [0xcc];

/// Distance between the instruction address reported after a trap and the
/// trap itself.
#[cfg(target_arch = "aarch64")]
pub const TRAP_PC_OFFSET: u64 = 0;
#[cfg(target_arch = "x86_64")]
pub const TRAP_PC_OFFSET: u64 = TRAP_OPCODES.len() as u64;

/// Software breakpoints placed within the debuggee.
///
/// Breakpoints are reference counted per address, and the original opcodes
/// are restored once the last reference is gone.
pub struct BreakpointManager {
    bks: HashMap<u64, BreakpointContext>,
}

struct BreakpointContext {
    orig_opcodes: [u8; TRAP_OPCODES.len()],
    ref_count: usize,

    /// Whether the trap opcodes are currently written. A breakpoint is
    /// disabled while a thread steps over it.
    enabled: bool,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self {
            bks: HashMap::new(),
        }
    }

    pub fn is_enabled(&self, addr: u64) -> bool {
        self.bks.get(&addr).is_some_and(|cx| cx.enabled)
    }

    /// Adds a breakpoint, or increments its usage if one already exists at
    /// the given address.
    ///
    /// `thread_id` must designate a stopped thread of the debuggee.
    pub fn add_breakpoint_or_increment_usage(
        &mut self,
        thread_id: u64,
        addr: u64,
    ) -> sys::Result<()> {
        match self.bks.entry(addr) {
            Entry::Occupied(mut e) => {
                e.get_mut().ref_count = e.get().ref_count.saturating_add(1);
            }
            Entry::Vacant(v) => {
                let mut orig_opcodes = [0u8; TRAP_OPCODES.len()];

                sys::mem::read_process_memory(thread_id, addr, &mut orig_opcodes)?;
                sys::mem::write_process_memory(thread_id, addr, &TRAP_OPCODES)?;

                v.insert(BreakpointContext {
                    orig_opcodes,
                    ref_count: 1,
                    enabled: true,
                });

                tracing::trace!(addr = format_args!("{addr:#x}"), "trap written");
            }
        }

        Ok(())
    }

    /// Removes a breakpoint, or decrements its usage if it is still used.
    ///
    /// Nothing happens if there is no breakpoint at the given address.
    pub fn remove_breakpoint_or_decrement_usage(
        &mut self,
        thread_id: u64,
        addr: u64,
    ) -> sys::Result<()> {
        let Entry::Occupied(mut e) = self.bks.entry(addr) else {
            return Ok(());
        };

        e.get_mut().ref_count = e.get().ref_count.saturating_sub(1);

        if e.get().ref_count == 0 {
            let cx = e.remove();

            if cx.enabled {
                sys::mem::write_process_memory(thread_id, addr, &cx.orig_opcodes)?;
            }

            tracing::trace!(addr = format_args!("{addr:#x}"), "trap erased");
        }

        Ok(())
    }

    /// Writes the trap opcodes of a disabled breakpoint back.
    pub fn enable(&mut self, thread_id: u64, addr: u64) -> sys::Result<()> {
        if let Some(cx) = self.bks.get_mut(&addr).filter(|cx| !cx.enabled) {
            sys::mem::write_process_memory(thread_id, addr, &TRAP_OPCODES)?;
            cx.enabled = true;
        }

        Ok(())
    }

    /// Restores the original opcodes of a breakpoint, without removing it.
    ///
    /// Returns whether a breakpoint exists at the given address.
    pub fn disable(&mut self, thread_id: u64, addr: u64) -> sys::Result<bool> {
        let Some(cx) = self.bks.get_mut(&addr) else {
            return Ok(false);
        };

        if cx.enabled {
            sys::mem::write_process_memory(thread_id, addr, &cx.orig_opcodes)?;
            cx.enabled = false;
        }

        Ok(true)
    }

    /// Replaces the trap opcodes within `buf` (read from `addr`) by the
    /// original ones.
    pub fn mask_traps(&self, addr: u64, buf: &mut [u8]) {
        for (bk_addr, cx) in self.bks.iter().filter(|(_, cx)| cx.enabled) {
            for (byte_addr, orig) in (*bk_addr..).zip(cx.orig_opcodes) {
                if let Some(byte) = offset_in(addr, buf.len(), byte_addr).map(|i| &mut buf[i]) {
                    *byte = orig;
                }
            }
        }
    }

    /// Prepares `buf` to be written at `addr`.
    ///
    /// Bytes overlapping a breakpoint become its new original opcodes, and
    /// the trap opcodes are kept in place within `buf`.
    pub fn shadow_write(&mut self, addr: u64, buf: &mut [u8]) {
        for (bk_addr, cx) in self.bks.iter_mut() {
            for (i, byte_addr) in (*bk_addr..).take(TRAP_OPCODES.len()).enumerate() {
                let Some(offset) = offset_in(addr, buf.len(), byte_addr) else {
                    continue;
                };

                cx.orig_opcodes[i] = buf[offset];

                if cx.enabled {
                    buf[offset] = TRAP_OPCODES[i];
                }
            }
        }
    }
}

/// Returns whether the trap opcodes are written at the given address.
pub fn has_trap_opcodes(thread_id: u64, addr: u64) -> sys::Result<bool> {
    let mut opcodes = [0u8; TRAP_OPCODES.len()];
    sys::mem::read_process_memory(thread_id, addr, &mut opcodes)?;

    Ok(opcodes == TRAP_OPCODES)
}

fn offset_in(start: u64, len: usize, addr: u64) -> Option<usize> {
    addr.checked_sub(start)
        .and_then(|offset| usize::try_from(offset).ok())
        .filter(|offset| *offset < len)
}

#[cfg(test)]
impl BreakpointManager {
    fn insert_raw(&mut self, addr: u64, orig_opcodes: [u8; TRAP_OPCODES.len()], enabled: bool) {
        self.bks.insert(
            addr,
            BreakpointContext {
                orig_opcodes,
                ref_count: 1,
                enabled,
            },
        );
    }
}
