use super::frame::stack_marker;
use super::{StackCapture, UserTask, save_user_stack};
use crate::mode::CaptureMode;

/// Captures with the platform unwinder. Userspace stacks of other tasks have
/// no platform walker and fall back to frame-pointer chasing.
#[derive(Debug, Default, Clone, Copy)]
pub struct StackWalk;

impl StackWalk {
    #[inline(never)]
    fn save_stack(&self, entries: &mut [usize], skip_below: usize) -> usize {
        let mut nr = 0;
        if entries.is_empty() {
            return 0;
        }
        // SAFETY: the unwinder backing `backtrace` on linux is reentrant and
        // does not rely on the crate-level lock.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if ip == 0 {
                    return false;
                }
                // Frames of the capture routine itself
                let sp = frame.sp() as usize;
                if sp != 0 && sp < skip_below {
                    return true;
                }
                entries[nr] = ip;
                nr += 1;
                nr < entries.len()
            });
        }
        nr
    }
}

impl StackCapture for StackWalk {
    #[inline(never)]
    fn capture(&self, mode: CaptureMode, task: Option<&UserTask>, entries: &mut [usize]) -> usize {
        match mode {
            CaptureMode::KernelStack => self.save_stack(entries, stack_marker()),
            CaptureMode::UserStack => task.map_or(0, |task| save_user_stack(task, entries)),
        }
    }
}
