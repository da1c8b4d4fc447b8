//! Per-occurrence record state and the trace output sink.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::capture::UserTask;

static NEXT_OCCURRENCE: AtomicU64 = AtomicU64::new(1);

/// One traced event occurrence, as seen by context field callbacks.
///
/// The CPU and nesting level are fixed when the occurrence starts, so every
/// callback of the occurrence addresses the same callstack slot.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    cpu: usize,
    nesting: usize,
    occurrence: u64,
    task: Option<&'a UserTask>,
}

impl<'a> RecordContext<'a> {
    /// Starts a new occurrence on `cpu` at interrupt nesting level `nesting`
    /// (0 is normal context).
    pub fn new(cpu: usize, nesting: usize) -> Self {
        RecordContext {
            cpu,
            nesting,
            occurrence: NEXT_OCCURRENCE.fetch_add(1, Ordering::Relaxed),
            task: None,
        }
    }

    /// Sets the task whose userspace stack `UserStack` contexts record.
    pub fn with_task(self, task: &'a UserTask) -> RecordContext<'a> {
        RecordContext {
            task: Some(task),
            ..self
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn nesting(&self) -> usize {
        self.nesting
    }

    /// Unique id of this occurrence. Copies of a context share it.
    pub fn occurrence(&self) -> u64 {
        self.occurrence
    }

    pub fn task(&self) -> Option<&'a UserTask> {
        self.task
    }
}

/// Per-CPU count of occurrences in flight, the same bookkeeping a ring
/// buffer does to know how deeply it is nested on a CPU.
pub struct NestingTracker {
    per_cpu: Box<[AtomicUsize]>,
}

impl NestingTracker {
    pub fn new(nr_cpus: usize) -> Self {
        NestingTracker {
            per_cpu: (0..nr_cpus.max(1)).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Enters an occurrence on the CPU the calling thread runs on.
    pub fn enter(&self) -> NestingGuard<'_> {
        let cpu = nix::sched::sched_getcpu().unwrap_or(0);
        self.enter_on(cpu)
    }

    /// Enters an occurrence on `cpu`. The level is released when the guard drops.
    pub fn enter_on(&self, cpu: usize) -> NestingGuard<'_> {
        let counter = self.per_cpu.get(cpu);
        let level = counter.map_or(0, |c| c.fetch_add(1, Ordering::Relaxed));
        NestingGuard {
            counter,
            cpu,
            level,
        }
    }
}

pub struct NestingGuard<'a> {
    counter: Option<&'a AtomicUsize>,
    cpu: usize,
    level: usize,
}

impl NestingGuard<'_> {
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn record_context(&self) -> RecordContext<'static> {
        RecordContext::new(self.cpu, self.level)
    }
}

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Padding needed to bring `offset` to a multiple of `align` (a power of two).
pub fn align_padding(offset: usize, align: usize) -> usize {
    offset.wrapping_neg() & (align - 1)
}

/// Destination of record callbacks. Only ever appended to.
pub trait TraceSink {
    /// Bytes written so far in the current record.
    fn offset(&self) -> usize;

    fn write(&mut self, bytes: &[u8]);

    /// Pads with zeroes up to the natural alignment `align`.
    fn align(&mut self, align: usize) {
        const ZEROES: [u8; 16] = [0; 16];
        let mut pad = align_padding(self.offset(), align);
        while pad > 0 {
            let chunk = pad.min(ZEROES.len());
            self.write(&ZEROES[..chunk]);
            pad -= chunk;
        }
    }
}

/// An in-memory trace sink.
#[derive(Debug, Default, Clone)]
pub struct RecordBuffer {
    bytes: Vec<u8>,
}

impl RecordBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        RecordBuffer {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl TraceSink for RecordBuffer {
    fn offset(&self) -> usize {
        self.bytes.len()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }
}

const WORD: usize = mem::size_of::<usize>();

fn read_word(bytes: &[u8], offset: usize) -> Option<usize> {
    let word = bytes.get(offset..offset + WORD)?;
    Some(usize::from_ne_bytes(word.try_into().ok()?))
}

/// Decodes one callstack context (length then sequence) starting at `offset`.
///
/// Returns the addresses and the offset just past the sequence.
pub fn read_callstack(bytes: &[u8], offset: usize) -> Option<(Vec<usize>, usize)> {
    let mut offset = offset + align_padding(offset, mem::align_of::<usize>());
    let len = read_word(bytes, offset)?;
    offset += WORD;
    offset += align_padding(offset, mem::align_of::<usize>());
    if len > bytes.len().saturating_sub(offset) / WORD {
        return None;
    }
    let entries = (0..len)
        .map(|i| read_word(bytes, offset + i * WORD))
        .collect::<Option<Vec<_>>>()?;
    Some((entries, offset + len * WORD))
}
