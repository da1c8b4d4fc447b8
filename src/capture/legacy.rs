use super::frame::{LocalMemory, current_frame_pointer, stack_marker};
use super::{StackCapture, UserTask, save_user_stack, walk_frame_pointers};
use crate::mode::CaptureMode;

/// End-of-stack marker the legacy save routines store when room is left.
const END_MARKER: usize = usize::MAX;

/// Manual frame-pointer unwinder for builds without a platform walker.
///
/// Only as reliable as the frame pointers it chases: code built without
/// them produces short or empty stacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyUnwind;

#[inline(never)]
fn save_stack_trace(entries: &mut [usize], skip_below: usize) -> usize {
    let fp = current_frame_pointer();
    let nr = walk_frame_pointers(&LocalMemory::new(), fp, entries, skip_below);
    terminate(entries, nr)
}

fn save_stack_trace_user(task: &UserTask, entries: &mut [usize]) -> usize {
    let nr = save_user_stack(task, entries);
    terminate(entries, nr)
}

fn terminate(entries: &mut [usize], nr: usize) -> usize {
    if nr < entries.len() {
        entries[nr] = END_MARKER;
        nr + 1
    } else {
        nr
    }
}

/// Drops the end marker so only real addresses are recorded.
fn strip_end_marker(entries: &[usize]) -> usize {
    match entries.last() {
        Some(&END_MARKER) => entries.len() - 1,
        _ => entries.len(),
    }
}

impl StackCapture for LegacyUnwind {
    #[inline(never)]
    fn capture(&self, mode: CaptureMode, task: Option<&UserTask>, entries: &mut [usize]) -> usize {
        let nr = match mode {
            CaptureMode::KernelStack => save_stack_trace(entries, stack_marker()),
            CaptureMode::UserStack => task.map_or(0, |task| save_stack_trace_user(task, entries)),
        };
        strip_end_marker(&entries[..nr])
    }
}
