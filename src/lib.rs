//! Callstack event context for tracers.
//!
//! Records the current callstack, or the userspace callstack of the current
//! task, into trace records as a length field followed by a sequence of raw
//! addresses. Capture works at any interrupt nesting level on any CPU using
//! buffers reserved at registration, so tracing never allocates:
//!
//!   size = cpus * nesting levels * depth * size_of::<usize>()
//!
//! Stacks are recovered by following frame pointers, either through the
//! platform unwinder (feature `stackwalk`, on by default) or a manual walker.
//! Code built without frame pointers yields short or empty stacks; this is
//! recorded as is, never reported as an error.

#[cfg(not(target_os = "linux"))]
compile_error!("callstack-ctx currently supports only linux");

pub mod callstack;
pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod mode;
pub mod pool;
pub mod record;

pub use callstack::{CallstackFields, add_callstack, add_callstack_to_ctx, remove_callstack};
pub use config::{CallstackConfig, MAX_ENTRIES};
pub use context::{Context, ContextRegistry};
pub use error::{Error, Result};
pub use mode::{CALLSTACK_KERNEL, CALLSTACK_USER, CaptureMode};
pub use pool::{NESTING_LEVELS, NestedBufferPool};
pub use record::{NestingTracker, RecordBuffer, RecordContext, TraceSink};
