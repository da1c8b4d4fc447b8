//! Stack capture backends.
//!
//! Both backends honour the same contract: they never allocate or block,
//! write at most `entries.len()` addresses innermost frame first, and return
//! how many they wrote. Missing or broken frame information ends the walk
//! early, possibly with nothing written; that is not an error.

use nix::unistd::Pid;

use crate::mode::CaptureMode;

mod frame;
mod legacy;
#[cfg(feature = "stackwalk")]
mod stackwalk;

pub use frame::{LocalMemory, MemoryReader, PtraceMemory, walk_frame_pointers};
pub use legacy::LegacyUnwind;
#[cfg(feature = "stackwalk")]
pub use stackwalk::StackWalk;

/// The backend selected for this build.
#[cfg(feature = "stackwalk")]
pub type DefaultCapture = StackWalk;
#[cfg(not(feature = "stackwalk"))]
pub type DefaultCapture = LegacyUnwind;

/// Whether userspace callstacks can be recovered on this architecture.
pub const USER_STACK_SUPPORTED: bool = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));

pub trait StackCapture: Send + Sync + 'static {
    /// Fills `entries` with the callstack selected by `mode` and returns the
    /// number of addresses written.
    ///
    /// `task` is the task whose userspace stack `UserStack` walks; without
    /// one nothing is captured.
    fn capture(&self, mode: CaptureMode, task: Option<&UserTask>, entries: &mut [usize]) -> usize;

    fn supports(&self, mode: CaptureMode) -> bool {
        match mode {
            CaptureMode::KernelStack => true,
            CaptureMode::UserStack => USER_STACK_SUPPORTED,
        }
    }
}

/// Saved userspace execution state of a stopped task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTask {
    pub pid: Pid,
    /// Instruction pointer (RIP on x86_64, PC on aarch64)
    pub ip: usize,
    /// Frame pointer (RBP on x86_64, X29 on aarch64)
    pub fp: usize,
}

impl UserTask {
    pub fn new(pid: Pid, ip: usize, fp: usize) -> Self {
        UserTask { pid, ip, fp }
    }

    #[cfg(target_arch = "x86_64")]
    pub fn from_regs(pid: Pid, regs: &nix::libc::user_regs_struct) -> Self {
        UserTask::new(pid, regs.rip as usize, regs.rbp as usize)
    }

    #[cfg(target_arch = "aarch64")]
    pub fn from_regs(pid: Pid, regs: &nix::libc::user_regs_struct) -> Self {
        UserTask::new(pid, regs.pc as usize, regs.regs[29] as usize)
    }

    /// Reads the registers of `pid`, which must be ptrace-stopped by the
    /// calling thread.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub fn stopped(pid: Pid) -> nix::Result<Self> {
        let regs = nix::sys::ptrace::getregs(pid)?;
        Ok(UserTask::from_regs(pid, &regs))
    }
}

/// Walks the userspace frame chain of `task`, starting with its current
/// instruction pointer.
pub(crate) fn save_user_stack(task: &UserTask, entries: &mut [usize]) -> usize {
    let Some((first, rest)) = entries.split_first_mut() else {
        return 0;
    };
    if task.ip == 0 {
        return 0;
    }
    *first = task.ip;
    1 + walk_frame_pointers(&PtraceMemory::new(task.pid), task.fp, rest, 0)
}
