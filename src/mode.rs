use std::fmt;

use crate::error::Error;

/// Selector value requesting the kernel (current execution) callstack.
pub const CALLSTACK_KERNEL: u32 = 0;
/// Selector value requesting the userspace callstack of the current task.
pub const CALLSTACK_USER: u32 = 1;

/// Which stack a callstack context records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    KernelStack,
    UserStack,
}

impl CaptureMode {
    /// Name of the sequence field.
    pub fn field_name(self) -> &'static str {
        match self {
            CaptureMode::KernelStack => "callstack_kernel",
            CaptureMode::UserStack => "callstack_user",
        }
    }

    /// Name of the length field the sequence refers to.
    pub fn length_name(self) -> &'static str {
        match self {
            CaptureMode::KernelStack => "callstack_kernel_length",
            CaptureMode::UserStack => "callstack_user_length",
        }
    }
}

impl TryFrom<u32> for CaptureMode {
    type Error = Error;

    fn try_from(selector: u32) -> Result<Self, Self::Error> {
        match selector {
            CALLSTACK_KERNEL => Ok(CaptureMode::KernelStack),
            CALLSTACK_USER => Ok(CaptureMode::UserStack),
            other => Err(Error::InvalidArgument(other)),
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMode::KernelStack => f.write_str("kernel callstack"),
            CaptureMode::UserStack => f.write_str("user callstack"),
        }
    }
}
