//! Per-CPU callstack buffers, one per interrupt nesting level.
//!
//! Everything is reserved up front for every possible CPU:
//!
//!   size = cpus * NESTING_LEVELS * max_depth * size_of::<usize>()
//!
//! which is 4096 bytes per CPU on a 64-bit host with the default depth of
//! 128. Capturing then needs neither allocation nor locking: an occurrence
//! only touches the slot of its own (CPU, nesting level).
//!
//! Nesting deeper than `NESTING_LEVELS` shares the last slot, so a too-deep
//! inner occurrence can overwrite the stack of the occurrence it interrupted.
//! The ring buffer refuses that much nesting anyway.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::trace;

use crate::config::CallstackConfig;
use crate::error::{Error, Result};
use crate::record::RecordContext;

/// Interrupt nesting levels with a buffer of their own, as many as the ring
/// buffer supports.
pub const NESTING_LEVELS: usize = 4;

/// A reusable callstack buffer.
///
/// The busy flag is taken with a single compare-exchange and never waited
/// on. Losing the race means another capture owns the slot; the loser sees
/// an empty stack.
pub struct NestingSlot {
    busy: AtomicBool,
    inner: UnsafeCell<SlotInner>,
}

struct SlotInner {
    /// Occurrence whose stack is held, 0 for none.
    occurrence: u64,
    nr_entries: usize,
    entries: Box<[usize]>,
}

// SAFETY: `inner` is only reached through `SlotGuard`, which holds `busy`.
unsafe impl Sync for NestingSlot {}

struct SlotGuard<'a> {
    slot: &'a NestingSlot,
}

impl SlotGuard<'_> {
    fn inner(&mut self) -> &mut SlotInner {
        // SAFETY: the guard owns the busy flag, so no other reference exists.
        unsafe { &mut *self.slot.inner.get() }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

impl NestingSlot {
    fn new(max_depth: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(max_depth)
            .map_err(|_| Error::ResourceExhausted("callstack buffers"))?;
        entries.resize(max_depth, 0);
        Ok(NestingSlot {
            busy: AtomicBool::new(false),
            inner: UnsafeCell::new(SlotInner {
                occurrence: 0,
                nr_entries: 0,
                entries: entries.into_boxed_slice(),
            }),
        })
    }

    fn try_lock(&self) -> Option<SlotGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        Some(SlotGuard { slot: self })
    }

    /// Fills the slot for `occurrence` unless it already holds that
    /// occurrence's stack, and returns the number of entries held.
    ///
    /// `fill` receives the whole buffer and returns how many entries it wrote.
    pub fn capture_once(&self, occurrence: u64, fill: impl FnOnce(&mut [usize]) -> usize) -> usize {
        let Some(mut guard) = self.try_lock() else {
            return 0;
        };
        let inner = guard.inner();
        if inner.occurrence != occurrence {
            // reset, no need to clear memory
            inner.nr_entries = 0;
            inner.occurrence = occurrence;
            let written = fill(&mut inner.entries);
            inner.nr_entries = written.min(inner.entries.len());
        }
        inner.nr_entries
    }

    /// Calls `f` with the stack captured for `occurrence`, or with an empty
    /// slice if the slot holds another occurrence.
    pub fn with_entries<R>(&self, occurrence: u64, f: impl FnOnce(&[usize]) -> R) -> R {
        let Some(mut guard) = self.try_lock() else {
            return f(&[]);
        };
        let inner = guard.inner();
        if inner.occurrence == occurrence {
            f(&inner.entries[..inner.nr_entries])
        } else {
            f(&[])
        }
    }

    /// Number of entries captured for `occurrence`.
    pub fn nr_entries(&self, occurrence: u64) -> usize {
        self.with_entries(occurrence, <[usize]>::len)
    }
}

/// The buffers of one CPU.
pub struct CpuStacks {
    slots: Box<[NestingSlot]>,
    /// Userspace captures in flight on this CPU.
    user_nesting: AtomicUsize,
}

impl CpuStacks {
    fn new(max_depth: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(NESTING_LEVELS)
            .map_err(|_| Error::ResourceExhausted("callstack buffers"))?;
        for _ in 0..NESTING_LEVELS {
            slots.push(NestingSlot::new(max_depth)?);
        }
        Ok(CpuStacks {
            slots: slots.into_boxed_slice(),
            user_nesting: AtomicUsize::new(0),
        })
    }

    /// Marks a userspace capture as in flight on this CPU.
    ///
    /// Returns `None` if one already is: reading a user stack can itself
    /// fire events, whose user callstack must not be gathered again.
    pub fn enter_user_capture(&self) -> Option<UserCaptureGuard<'_>> {
        if self.user_nesting.fetch_add(1, Ordering::Acquire) >= 1 {
            self.user_nesting.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(UserCaptureGuard {
            counter: &self.user_nesting,
        })
    }
}

pub struct UserCaptureGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for UserCaptureGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

pub struct NestedBufferPool {
    cpus: Box<[CpuStacks]>,
    max_depth: usize,
}

impl NestedBufferPool {
    /// Reserves the buffers of every CPU in `config`.
    pub fn new(config: &CallstackConfig) -> Result<Self> {
        let mut cpus = Vec::new();
        cpus.try_reserve_exact(config.nr_cpus)
            .map_err(|_| Error::ResourceExhausted("per-cpu callstack state"))?;
        for _ in 0..config.nr_cpus {
            cpus.push(CpuStacks::new(config.max_depth)?);
        }
        trace!(
            "reserved {} callstack buffers of {} entries",
            config.nr_cpus * NESTING_LEVELS,
            config.max_depth
        );
        Ok(NestedBufferPool {
            cpus: cpus.into_boxed_slice(),
            max_depth: config.max_depth,
        })
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, cpu: usize) -> Option<&CpuStacks> {
        self.cpus.get(cpu)
    }

    /// The slot of the occurrence's CPU and nesting level, with the level
    /// actually used. Nesting beyond `NESTING_LEVELS` is clamped onto the
    /// last level. `None` only for a CPU the pool was not sized for.
    pub fn acquire_slot(&self, ctx: &RecordContext<'_>) -> Option<(&NestingSlot, usize)> {
        let cpu = self.cpus.get(ctx.cpu())?;
        let level = ctx.nesting().min(NESTING_LEVELS - 1);
        Some((&cpu.slots[level], level))
    }
}
