//! The callstack event context.
//!
//! The callstack context can be added to any event. It records either the
//! current (kernel) callstack or the userspace callstack of the current task,
//! up to a max depth. It is a pair of fields: an unsigned length followed by
//! a sequence of that many raw addresses, so a record only takes the space
//! the captured entries need.
//!
//! The stack is captured when the record size is computed, into the buffer
//! of the current CPU and nesting level, and the record callbacks write that
//! same capture. Addresses are not resolved; symbols are left to the reader.

use std::any::Any;
use std::mem;
use std::sync::{Arc, Weak};

use log::{debug, warn};

use crate::capture::{DefaultCapture, StackCapture};
use crate::config::CallstackConfig;
use crate::context::{ContextRegistry, EventField, FieldOps, FieldType, IntegerType};
use crate::error::{Error, Result};
use crate::mode::CaptureMode;
use crate::pool::NestedBufferPool;
use crate::record::{RecordContext, TraceSink, align_padding};

const WORD: usize = mem::size_of::<usize>();
const WORD_ALIGN: usize = mem::align_of::<usize>();

const LENGTH_TYPE: IntegerType = IntegerType::native_word(10);
const SEQUENCE_ELEM_TYPE: IntegerType = IntegerType::native_word(16);

/// State shared by the two fields of one callstack context.
struct FieldData<C> {
    mode: CaptureMode,
    pool: NestedBufferPool,
    capture: C,
}

impl<C: StackCapture> FieldData<C> {
    /// Captures the stack of this occurrence unless already done, and
    /// returns the number of entries.
    fn ensure_captured(&self, ctx: &RecordContext<'_>) -> usize {
        let Some((slot, _)) = self.pool.acquire_slot(ctx) else {
            return 0;
        };
        let occurrence = ctx.occurrence();
        match self.mode {
            CaptureMode::KernelStack => slot.capture_once(occurrence, |entries| {
                self.capture.capture(CaptureMode::KernelStack, None, entries)
            }),
            CaptureMode::UserStack => {
                // Do not gather the userspace callstack of events fired by
                // the userspace callstack saving itself.
                let Some(_nesting) = self.pool.cpu(ctx.cpu()).and_then(|cpu| cpu.enter_user_capture()) else {
                    return slot.nr_entries(occurrence);
                };
                slot.capture_once(occurrence, |entries| {
                    self.capture.capture(CaptureMode::UserStack, ctx.task(), entries)
                })
            }
        }
    }

    fn nr_entries(&self, ctx: &RecordContext<'_>) -> usize {
        self.pool
            .acquire_slot(ctx)
            .map_or(0, |(slot, _)| slot.nr_entries(ctx.occurrence()))
    }
}

/// Length field. Does not own the shared data.
struct LengthField<C> {
    data: Weak<FieldData<C>>,
}

impl<C: StackCapture> FieldOps for LengthField<C> {
    fn get_size(&self, offset: usize, ctx: &RecordContext<'_>) -> usize {
        if let Some(data) = self.data.upgrade() {
            data.ensure_captured(ctx);
        }
        align_padding(offset, WORD_ALIGN) + WORD
    }

    fn record(&self, ctx: &RecordContext<'_>, sink: &mut dyn TraceSink) {
        let nr_entries = self.data.upgrade().map_or(0, |data| data.nr_entries(ctx));
        sink.align(WORD_ALIGN);
        sink.write(&nr_entries.to_ne_bytes());
    }
}

/// Sequence field. Owns the shared data: dropping it releases the buffers.
struct SequenceField<C> {
    data: Arc<FieldData<C>>,
}

impl<C: StackCapture> FieldOps for SequenceField<C> {
    fn get_size(&self, offset: usize, ctx: &RecordContext<'_>) -> usize {
        let nr_entries = self.data.ensure_captured(ctx);
        align_padding(offset, WORD_ALIGN) + nr_entries * WORD
    }

    fn record(&self, ctx: &RecordContext<'_>, sink: &mut dyn TraceSink) {
        sink.align(WORD_ALIGN);
        let Some((slot, _)) = self.data.pool.acquire_slot(ctx) else {
            return;
        };
        slot.with_entries(ctx.occurrence(), |entries| {
            for entry in entries {
                sink.write(&entry.to_ne_bytes());
            }
        });
    }
}

impl<C> Drop for SequenceField<C> {
    fn drop(&mut self) {
        debug!(
            "releasing {} buffers of {} cpus",
            self.data.mode,
            self.data.pool.nr_cpus()
        );
    }
}

/// Handle on a registered callstack context.
pub struct CallstackFields {
    mode: CaptureMode,
    data: Weak<dyn Any + Send + Sync>,
}

impl CallstackFields {
    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn length_name(&self) -> &'static str {
        self.mode.length_name()
    }

    pub fn sequence_name(&self) -> &'static str {
        self.mode.field_name()
    }

    /// Whether the shared buffers are still allocated.
    pub fn is_live(&self) -> bool {
        self.data.strong_count() > 0
    }
}

/// Adds the callstack context chosen by `selector` (`CALLSTACK_KERNEL` or
/// `CALLSTACK_USER`), captured with this build's backend.
pub fn add_callstack_to_ctx<R>(ctx: &mut R, selector: u32, config: &CallstackConfig) -> Result<CallstackFields>
where
    R: ContextRegistry + ?Sized,
{
    let mode = CaptureMode::try_from(selector).inspect_err(|err| warn!("{err}"))?;
    add_callstack(ctx, mode, DefaultCapture::default(), config)
}

/// Adds the length and sequence fields of a `mode` callstack context.
///
/// Either both fields are added or, on error, the context is left as it was.
pub fn add_callstack<R, C>(ctx: &mut R, mode: CaptureMode, capture: C, config: &CallstackConfig) -> Result<CallstackFields>
where
    R: ContextRegistry + ?Sized,
    C: StackCapture,
{
    let name = mode.field_name();
    let length_name = mode.length_name();

    if !capture.supports(mode) {
        warn!("{mode} capture is not supported here");
        return Err(Error::UnsupportedMode(name));
    }
    if ctx.find(name) || ctx.find(length_name) {
        return Err(Error::AlreadyExists(name));
    }

    let length_index = ctx.append_field()?;
    let sequence_index = match ctx.append_field() {
        Ok(index) => index,
        Err(err) => {
            ctx.remove_field(length_index);
            return Err(err);
        }
    };
    let pool = match NestedBufferPool::new(config) {
        Ok(pool) => pool,
        Err(err) => {
            warn!("cannot reserve {mode} buffers: {err}");
            ctx.remove_field(sequence_index);
            ctx.remove_field(length_index);
            return Err(err);
        }
    };
    let data = Arc::new(FieldData { mode, pool, capture });
    let any: Arc<dyn Any + Send + Sync> = data.clone();
    let handle = CallstackFields {
        mode,
        data: Arc::downgrade(&any),
    };
    drop(any);

    if let Some(field) = ctx.field_mut(length_index) {
        field.event_field = Some(EventField {
            name: length_name,
            ty: FieldType::Integer(LENGTH_TYPE),
        });
        field.ops = Some(Box::new(LengthField {
            data: Arc::downgrade(&data),
        }));
    }
    if let Some(field) = ctx.field_mut(sequence_index) {
        field.event_field = Some(EventField {
            name,
            ty: FieldType::Sequence {
                length_name,
                elem_type: SEQUENCE_ELEM_TYPE,
                alignment: 0,
            },
        });
        field.ops = Some(Box::new(SequenceField { data }));
    }

    debug!(
        "added {mode} context: {} cpus, depth {}",
        config.nr_cpus, config.max_depth
    );
    Ok(handle)
}

/// Removes both fields of a callstack context, releasing its buffers.
pub fn remove_callstack<R>(ctx: &mut R, fields: &CallstackFields)
where
    R: ContextRegistry + ?Sized,
{
    for name in [fields.sequence_name(), fields.length_name()] {
        if let Some(index) = ctx.position(name) {
            ctx.remove_field(index);
        }
    }
    debug!("removed {} context", fields.mode);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::capture::UserTask;
    use crate::context::Context;
    use crate::record::{RecordBuffer, read_callstack};

    #[derive(Clone, Default)]
    struct Scripted {
        frames: Arc<Mutex<Vec<usize>>>,
        calls: Arc<AtomicUsize>,
        user: bool,
    }

    impl Scripted {
        fn set(&self, frames: &[usize]) {
            *self.frames.lock().unwrap() = frames.to_vec();
        }
    }

    impl StackCapture for Scripted {
        fn capture(&self, _mode: CaptureMode, _task: Option<&UserTask>, entries: &mut [usize]) -> usize {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let frames = self.frames.lock().unwrap();
            let nr = frames.len().min(entries.len());
            entries[..nr].copy_from_slice(&frames[..nr]);
            nr
        }

        fn supports(&self, mode: CaptureMode) -> bool {
            mode == CaptureMode::KernelStack || self.user
        }
    }

    fn config(max_depth: usize) -> CallstackConfig {
        CallstackConfig { max_depth, nr_cpus: 2 }
    }

    #[test]
    fn registers_length_then_sequence() {
        let mut ctx = Context::new();
        let fields = add_callstack(&mut ctx, CaptureMode::KernelStack, Scripted::default(), &config(8)).unwrap();
        assert_eq!(ctx.position("callstack_kernel_length"), Some(0));
        assert_eq!(ctx.position("callstack_kernel"), Some(1));
        assert_eq!(fields.mode(), CaptureMode::KernelStack);
        assert!(fields.is_live());
    }

    #[test]
    fn captures_once_per_occurrence() {
        let capture = Scripted::default();
        capture.set(&[0xa0, 0xa1]);
        let mut ctx = Context::new();
        add_callstack(&mut ctx, CaptureMode::KernelStack, capture.clone(), &config(8)).unwrap();

        let rec = RecordContext::new(0, 0);
        assert_eq!(ctx.get_size(0, &rec), 3 * WORD);
        let mut buf = RecordBuffer::default();
        ctx.record(&rec, &mut buf);
        assert_eq!(capture.calls.load(Ordering::Relaxed), 1);
        assert_eq!(read_callstack(buf.as_bytes(), 0), Some((vec![0xa0, 0xa1], 3 * WORD)));
    }

    #[test]
    fn size_accounts_for_alignment() {
        let capture = Scripted::default();
        capture.set(&[0xa0]);
        let mut ctx = Context::new();
        add_callstack(&mut ctx, CaptureMode::KernelStack, capture, &config(8)).unwrap();
        let rec = RecordContext::new(1, 0);
        assert_eq!(ctx.get_size(3, &rec), (WORD - 3) + 2 * WORD);
    }

    #[test]
    fn sequence_size_first_still_captures_once() {
        let capture = Scripted::default();
        capture.set(&[0x1, 0x2, 0x3]);
        let mut ctx = Context::new();
        add_callstack(&mut ctx, CaptureMode::KernelStack, capture.clone(), &config(8)).unwrap();
        let rec = RecordContext::new(0, 0);
        let sequence = ctx.position("callstack_kernel").unwrap();
        let length = ctx.position("callstack_kernel_length").unwrap();
        let ops = |ctx: &mut Context, i| ctx.field_mut(i).unwrap().ops.take().unwrap();
        let seq_ops = ops(&mut ctx, sequence);
        let len_ops = ops(&mut ctx, length);
        assert_eq!(seq_ops.get_size(0, &rec), 3 * WORD);
        assert_eq!(len_ops.get_size(0, &rec), WORD);
        assert_eq!(capture.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn user_mode_rejected_when_unsupported() {
        let mut ctx = Context::new();
        let err = add_callstack(&mut ctx, CaptureMode::UserStack, Scripted::default(), &config(8));
        assert_eq!(err.err(), Some(Error::UnsupportedMode("callstack_user")));
        assert!(ctx.is_empty());
    }

    #[test]
    fn user_mode_passes_task() {
        #[derive(Default)]
        struct TaskIp;
        impl StackCapture for TaskIp {
            fn capture(&self, mode: CaptureMode, task: Option<&UserTask>, entries: &mut [usize]) -> usize {
                assert_eq!(mode, CaptureMode::UserStack);
                match task {
                    Some(task) => {
                        entries[0] = task.ip;
                        1
                    }
                    None => 0,
                }
            }
            fn supports(&self, _mode: CaptureMode) -> bool {
                true
            }
        }

        let mut ctx = Context::new();
        add_callstack(&mut ctx, CaptureMode::UserStack, TaskIp, &config(4)).unwrap();
        let task = UserTask::new(nix::unistd::Pid::from_raw(1), 0x4000, 0);

        let rec = RecordContext::new(0, 0).with_task(&task);
        ctx.get_size(0, &rec);
        let mut buf = RecordBuffer::default();
        ctx.record(&rec, &mut buf);
        assert_eq!(read_callstack(buf.as_bytes(), 0).unwrap().0, vec![0x4000]);

        let no_task = RecordContext::new(0, 0);
        ctx.get_size(0, &no_task);
        buf.clear();
        ctx.record(&no_task, &mut buf);
        assert_eq!(read_callstack(buf.as_bytes(), 0).unwrap().0, Vec::<usize>::new());
    }

    #[test]
    fn second_reservation_failure_rolls_back() {
        let mut ctx = Context::with_max_fields(1);
        let err = add_callstack(&mut ctx, CaptureMode::KernelStack, Scripted::default(), &config(8));
        assert!(matches!(err, Err(Error::ResourceExhausted(_))));
        assert_eq!(ctx.len(), 0);
    }

    #[test]
    fn unregister_releases_data() {
        let mut ctx = Context::new();
        let fields = add_callstack(&mut ctx, CaptureMode::KernelStack, Scripted::default(), &config(8)).unwrap();
        remove_callstack(&mut ctx, &fields);
        assert!(!fields.is_live());
        assert!(ctx.is_empty());
    }

    #[test]
    fn length_field_outliving_sequence_records_zero() {
        let capture = Scripted::default();
        capture.set(&[0x5]);
        let mut ctx = Context::new();
        let fields = add_callstack(&mut ctx, CaptureMode::KernelStack, capture, &config(8)).unwrap();
        let index = ctx.position(fields.sequence_name()).unwrap();
        ctx.remove_field(index);
        assert!(!fields.is_live());

        let rec = RecordContext::new(0, 0);
        assert_eq!(ctx.get_size(0, &rec), WORD);
        let mut buf = RecordBuffer::default();
        ctx.record(&rec, &mut buf);
        assert_eq!(buf.as_bytes(), &0usize.to_ne_bytes());
    }
}
