use std::mem;
use std::ops::Range;

use nix::errno::Errno;
use nix::libc::{self, iovec};
use nix::sys::ptrace;
use nix::unistd::Pid;

const WORD_SIZE: usize = mem::size_of::<u64>();

/// Reads memory from the address space of the given thread's process.
pub fn read_process_memory(thread_id: u64, addr: u64, buf: &mut [u8]) -> crate::sys::Result<()> {
    let local_iov = iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let remote_iov = iovec {
        iov_base: addr as *mut _,
        iov_len: buf.len(),
    };

    let len = unsafe {
        Errno::result(libc::process_vm_readv(
            thread_id as libc::pid_t,
            &local_iov as *const _,
            1,
            &remote_iov as *const _,
            1,
            0,
        ))
        .inspect_err(
            |e| tracing::debug!(error = %e, addr = format_args!("{addr:#x}"), "process_vm_readv"),
        )? as usize
    };

    if len != buf.len() {
        Err(crate::sys::Error::PartialMemOp(len, buf.len()))
    } else {
        Ok(())
    }
}

/// Writes memory into the address space of the given thread's process.
///
/// The memory is written with `PTRACE_POKEDATA`, so read-only pages (e.g.,
/// code) can be patched. `thread_id` must designate a stopped thread.
pub fn write_process_memory(thread_id: u64, addr: u64, buf: &[u8]) -> crate::sys::Result<()> {
    let pid = Pid::from_raw(thread_id as libc::pid_t);

    for span in word_spans(addr, buf.len()) {
        let word_addr = span.word_addr;

        // partial words keep their other bytes
        let mut word = if span.is_partial() {
            ptrace::read(pid, word_addr as *mut _)
                .inspect_err(|e| tracing::debug!(error = %e, addr = format_args!("{word_addr:#x}"), "ptrace(PTRACE_PEEKDATA)"))?
                .to_le_bytes()
        } else {
            [0u8; WORD_SIZE]
        };

        word[span.offset..span.offset + span.bytes.len()].copy_from_slice(&buf[span.bytes]);

        ptrace::write(pid, word_addr as *mut _, i64::from_le_bytes(word))
            .inspect_err(|e| tracing::debug!(error = %e, addr = format_args!("{word_addr:#x}"), "ptrace(PTRACE_POKEDATA)"))?;
    }

    Ok(())
}

/// Part of a write falling into a single aligned word.
#[derive(Debug, PartialEq, Eq)]
struct WordSpan {
    word_addr: u64,

    /// Offset of the first written byte within the word.
    offset: usize,

    /// Written bytes, as a range of the source buffer.
    bytes: Range<usize>,
}

impl WordSpan {
    fn is_partial(&self) -> bool {
        self.bytes.len() != WORD_SIZE
    }
}

/// Splits a write of `len` bytes at `addr` into aligned words.
///
/// Aligned words never cross a page boundary, so the memory around a
/// partial write is always readable.
fn word_spans(addr: u64, len: usize) -> impl Iterator<Item = WordSpan> {
    let end = addr.saturating_add(len as u64);
    let first = if len == 0 {
        end
    } else {
        addr & !(WORD_SIZE as u64 - 1)
    };

    (first..end).step_by(WORD_SIZE).map(move |word_addr| {
        let start = word_addr.max(addr);
        let stop = (word_addr + WORD_SIZE as u64).min(end);

        WordSpan {
            word_addr,
            offset: (start - word_addr) as usize,
            bytes: (start - addr) as usize..(stop - addr) as usize,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{WordSpan, word_spans};

    #[test]
    fn aligned_write() {
        let spans: Vec<_> = word_spans(0x1000, 16).collect();

        assert_eq!(
            spans,
            [
                WordSpan {
                    word_addr: 0x1000,
                    offset: 0,
                    bytes: 0..8,
                },
                WordSpan {
                    word_addr: 0x1008,
                    offset: 0,
                    bytes: 8..16,
                },
            ]
        );
        assert!(spans.iter().all(|span| !span.is_partial()));
    }

    #[test]
    fn unaligned_write() {
        let spans: Vec<_> = word_spans(0x1005, 6).collect();

        assert_eq!(
            spans,
            [
                WordSpan {
                    word_addr: 0x1000,
                    offset: 5,
                    bytes: 0..3,
                },
                WordSpan {
                    word_addr: 0x1008,
                    offset: 0,
                    bytes: 3..6,
                },
            ]
        );
    }

    #[test]
    fn write_at_page_end() {
        // a single trap opcode on the last byte of a page
        let spans: Vec<_> = word_spans(0x1fff, 1).collect();

        assert_eq!(
            spans,
            [WordSpan {
                word_addr: 0x1ff8,
                offset: 7,
                bytes: 0..1,
            }]
        );
        assert!(spans[0].is_partial());
        assert!(spans.iter().all(|span| span.word_addr + 8 <= 0x2000));
    }

    #[test]
    fn empty_write() {
        assert_eq!(word_spans(0x1003, 0).count(), 0);
    }
}
