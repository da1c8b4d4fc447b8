use std::hint;
use std::io::IoSliceMut;
use std::mem;

use nix::libc::c_void;
use nix::sys::ptrace;
use nix::sys::uio::{RemoteIoVec, process_vm_readv};
use nix::unistd::Pid;

const WORD: usize = mem::size_of::<usize>();

/// Word-granular access to the memory holding a stack.
///
/// Reads must fail rather than fault on unmapped addresses.
pub trait MemoryReader {
    fn read_word(&self, addr: usize) -> Option<usize>;

    /// Reads a frame record: the caller's frame pointer at `fp` and the
    /// return address right above it. The layout is the same on x86_64
    /// (RBP chain) and aarch64 (X29/X30 pair).
    fn read_frame(&self, fp: usize) -> Option<(usize, usize)> {
        let prev_fp = self.read_word(fp)?;
        let return_addr = self.read_word(fp.checked_add(WORD)?)?;
        Some((prev_fp, return_addr))
    }
}

/// Memory of a task stopped under ptrace by the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct PtraceMemory {
    pid: Pid,
}

impl PtraceMemory {
    pub fn new(pid: Pid) -> Self {
        PtraceMemory { pid }
    }
}

impl MemoryReader for PtraceMemory {
    fn read_word(&self, addr: usize) -> Option<usize> {
        let word = ptrace::read(self.pid, addr as *mut c_void).ok()?;
        Some(word as usize)
    }
}

/// Memory of the calling process, read through `process_vm_readv` so that a
/// bogus frame pointer yields `EFAULT` instead of a segfault.
#[derive(Debug, Clone, Copy)]
pub struct LocalMemory {
    pid: Pid,
}

impl LocalMemory {
    pub fn new() -> Self {
        LocalMemory { pid: Pid::this() }
    }
}

impl Default for LocalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReader for LocalMemory {
    fn read_word(&self, addr: usize) -> Option<usize> {
        let mut word = [0u8; WORD];
        let read = process_vm_readv(
            self.pid,
            &mut [IoSliceMut::new(&mut word)],
            &[RemoteIoVec { base: addr, len: WORD }],
        )
        .ok()?;
        (read == WORD).then(|| usize::from_ne_bytes(word))
    }

    fn read_frame(&self, fp: usize) -> Option<(usize, usize)> {
        let mut record = [0u8; 2 * WORD];
        let read = process_vm_readv(
            self.pid,
            &mut [IoSliceMut::new(&mut record)],
            &[RemoteIoVec { base: fp, len: 2 * WORD }],
        )
        .ok()?;
        if read != record.len() {
            return None;
        }
        let (prev_fp, return_addr) = record.split_at(WORD);
        Some((
            usize::from_ne_bytes(prev_fp.try_into().ok()?),
            usize::from_ne_bytes(return_addr.try_into().ok()?),
        ))
    }
}

/// Follows the frame-pointer chain from `fp`, storing return addresses.
///
/// Frames whose record lies below `skip_below` belong to the caller's own
/// machinery and are not stored. The walk stops at a null or misaligned
/// frame pointer, a null return address, an unreadable record, a chain that
/// does not move towards the stack base, or when `entries` is full.
pub fn walk_frame_pointers<R: MemoryReader>(
    reader: &R,
    mut fp: usize,
    entries: &mut [usize],
    skip_below: usize,
) -> usize {
    let mut nr = 0;
    while nr < entries.len() {
        if fp == 0 || fp % WORD != 0 {
            break;
        }
        let Some((prev_fp, return_addr)) = reader.read_frame(fp) else {
            break;
        };
        if return_addr == 0 {
            break;
        }
        if fp >= skip_below {
            entries[nr] = return_addr;
            nr += 1;
        }
        // Prevent infinite loops
        if prev_fp <= fp {
            break;
        }
        fp = prev_fp;
    }
    nr
}

/// Frame pointer of the calling function.
#[inline(always)]
pub(crate) fn current_frame_pointer() -> usize {
    #[allow(unused_assignments, unused_mut)]
    let mut fp = 0usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    fp
}

/// An address inside the calling function's frame. Frames deeper than the
/// caller lie below it.
#[inline(always)]
pub(crate) fn stack_marker() -> usize {
    let marker = 0u8;
    hint::black_box(&marker) as *const u8 as usize
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// A fake stack built from (frame pointer, caller fp, return address) records.
    #[derive(Default)]
    struct FakeStack {
        words: HashMap<usize, usize>,
    }

    impl FakeStack {
        fn frame(mut self, fp: usize, prev_fp: usize, return_addr: usize) -> Self {
            self.words.insert(fp, prev_fp);
            self.words.insert(fp + WORD, return_addr);
            self
        }
    }

    impl MemoryReader for FakeStack {
        fn read_word(&self, addr: usize) -> Option<usize> {
            self.words.get(&addr).copied()
        }
    }

    fn three_frames() -> FakeStack {
        FakeStack::default()
            .frame(0x1000, 0x1040, 0xa0)
            .frame(0x1040, 0x1100, 0xa1)
            .frame(0x1100, 0, 0xa2)
    }

    #[test]
    fn walks_until_null_frame_pointer() {
        let mut entries = [0; 8];
        let nr = walk_frame_pointers(&three_frames(), 0x1000, &mut entries, 0);
        assert_eq!(&entries[..nr], &[0xa0, 0xa1, 0xa2]);
    }

    #[test]
    fn stops_when_entries_full() {
        let mut entries = [0; 2];
        let nr = walk_frame_pointers(&three_frames(), 0x1000, &mut entries, 0);
        assert_eq!(nr, 2);
        assert_eq!(entries, [0xa0, 0xa1]);
    }

    #[test]
    fn skips_frames_below_marker() {
        let mut entries = [0; 8];
        let nr = walk_frame_pointers(&three_frames(), 0x1000, &mut entries, 0x1040);
        assert_eq!(&entries[..nr], &[0xa1, 0xa2]);
    }

    #[test]
    fn stops_on_loop_or_garbage() {
        let looping = FakeStack::default()
            .frame(0x2000, 0x2040, 0xb0)
            .frame(0x2040, 0x2000, 0xb1);
        let mut entries = [0; 8];
        assert_eq!(walk_frame_pointers(&looping, 0x2000, &mut entries, 0), 2);

        assert_eq!(walk_frame_pointers(&looping, 0x2003, &mut entries, 0), 0);
        assert_eq!(walk_frame_pointers(&FakeStack::default(), 0x3000, &mut entries, 0), 0);
        assert_eq!(walk_frame_pointers(&looping, 0, &mut entries, 0), 0);
    }

    #[test]
    fn local_memory_reads_own_stack() {
        let value: usize = 0xdead_beef;
        let reader = LocalMemory::new();
        assert_eq!(reader.read_word(&value as *const usize as usize), Some(0xdead_beef));
        assert_eq!(reader.read_word(0), None);
    }
}
