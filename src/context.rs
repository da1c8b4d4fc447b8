//! Event context fields: descriptors, callbacks and the field table.

use std::fmt;
use std::mem;

use crate::error::{Error, Result};
use crate::record::{RecordContext, TraceSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    None,
    Utf8,
}

/// Layout of an integer in the trace, sizes in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerType {
    pub size: u32,
    pub alignment: u32,
    pub signed: bool,
    pub reverse_byte_order: bool,
    /// Preferred display base.
    pub base: u32,
    pub encoding: Encoding,
}

impl IntegerType {
    /// A native-endian `usize` shown in `base`.
    pub const fn native_word(base: u32) -> Self {
        IntegerType {
            size: usize::BITS,
            alignment: (mem::align_of::<usize>() * 8) as u32,
            signed: false,
            reverse_byte_order: false,
            base,
            encoding: Encoding::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer(IntegerType),
    /// Variable number of elements, counted by the field `length_name`.
    Sequence {
        length_name: &'static str,
        elem_type: IntegerType,
        alignment: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventField {
    pub name: &'static str,
    pub ty: FieldType,
}

impl fmt::Display for IntegerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "integer {{ size = {}; align = {}; signed = {}; encoding = {}; base = {};{} }}",
            self.size,
            self.alignment,
            self.signed,
            match self.encoding {
                Encoding::None => "none",
                Encoding::Utf8 => "UTF8",
            },
            self.base,
            if self.reverse_byte_order {
                if cfg!(target_endian = "little") { " byte_order = be;" } else { " byte_order = le;" }
            } else {
                ""
            },
        )
    }
}

/// CTF declaration of the field, as it appears in trace metadata.
impl fmt::Display for EventField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ty {
            FieldType::Integer(integer) => write!(f, "{integer} _{};", self.name),
            FieldType::Sequence {
                length_name,
                elem_type,
                ..
            } => write!(f, "{elem_type} _{}[ _{length_name} ];", self.name),
        }
    }
}

/// Per-occurrence callbacks of a context field.
///
/// Called with preemption-like constraints: implementations must not block
/// and should not allocate.
pub trait FieldOps: Send + Sync {
    /// Bytes the field occupies when recorded at `offset`, alignment
    /// padding included.
    fn get_size(&self, offset: usize, ctx: &RecordContext<'_>) -> usize;

    fn record(&self, ctx: &RecordContext<'_>, sink: &mut dyn TraceSink);
}

/// A slot of the field table. Reserved slots start out empty; dropping a
/// slot drops its callbacks, which is how fields release private data.
#[derive(Default)]
pub struct ContextField {
    pub event_field: Option<EventField>,
    pub ops: Option<Box<dyn FieldOps>>,
}

impl ContextField {
    pub fn name(&self) -> Option<&'static str> {
        self.event_field.map(|field| field.name)
    }
}

impl fmt::Debug for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextField")
            .field("event_field", &self.event_field)
            .field("ops", &self.ops.is_some())
            .finish()
    }
}

/// The table of context fields attached to an event or channel.
pub trait ContextRegistry {
    fn position(&self, name: &str) -> Option<usize>;

    fn find(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Reserves an empty field at the end of the table and returns its index.
    fn append_field(&mut self) -> Result<usize>;

    fn field_mut(&mut self, index: usize) -> Option<&mut ContextField>;

    /// Removes and drops the field at `index`.
    fn remove_field(&mut self, index: usize);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory field table.
#[derive(Debug, Default)]
pub struct Context {
    fields: Vec<ContextField>,
    max_fields: Option<usize>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that refuses to grow beyond `max_fields`.
    pub fn with_max_fields(max_fields: usize) -> Self {
        Context {
            fields: Vec::new(),
            max_fields: Some(max_fields),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &ContextField> {
        self.fields.iter()
    }

    /// Size of all fields recorded from `offset`. Runs every size callback,
    /// so it must precede `record` for the same occurrence.
    pub fn get_size(&self, offset: usize, ctx: &RecordContext<'_>) -> usize {
        self.fields
            .iter()
            .filter_map(|field| field.ops.as_deref())
            .fold(0, |size, ops| size + ops.get_size(offset + size, ctx))
    }

    pub fn record(&self, ctx: &RecordContext<'_>, sink: &mut dyn TraceSink) {
        for ops in self.fields.iter().filter_map(|field| field.ops.as_deref()) {
            ops.record(ctx, sink);
        }
    }
}

/// Metadata declarations of the populated fields, one per line.
impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in self.fields.iter().filter_map(|field| field.event_field.as_ref()) {
            writeln!(f, "{field}")?;
        }
        Ok(())
    }
}

impl ContextRegistry for Context {
    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name() == Some(name))
    }

    fn append_field(&mut self) -> Result<usize> {
        if self.max_fields.is_some_and(|max| self.fields.len() >= max) {
            return Err(Error::ResourceExhausted("context fields"));
        }
        self.fields
            .try_reserve(1)
            .map_err(|_| Error::ResourceExhausted("context fields"))?;
        self.fields.push(ContextField::default());
        Ok(self.fields.len() - 1)
    }

    fn field_mut(&mut self, index: usize) -> Option<&mut ContextField> {
        self.fields.get_mut(index)
    }

    fn remove_field(&mut self, index: usize) {
        if index < self.fields.len() {
            self.fields.remove(index);
        }
    }

    fn len(&self) -> usize {
        self.fields.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuffer;

    struct Constant(u8);

    impl FieldOps for Constant {
        fn get_size(&self, _offset: usize, _ctx: &RecordContext<'_>) -> usize {
            1
        }

        fn record(&self, _ctx: &RecordContext<'_>, sink: &mut dyn TraceSink) {
            sink.write(&[self.0]);
        }
    }

    fn add(ctx: &mut Context, name: &'static str, value: u8) {
        let index = ctx.append_field().unwrap();
        let field = ctx.field_mut(index).unwrap();
        field.event_field = Some(EventField {
            name,
            ty: FieldType::Integer(IntegerType {
                size: 8,
                alignment: 8,
                ..IntegerType::native_word(10)
            }),
        });
        field.ops = Some(Box::new(Constant(value)));
    }

    #[test]
    fn append_find_remove() {
        let mut ctx = Context::new();
        add(&mut ctx, "cpu_id", 1);
        add(&mut ctx, "prio", 2);
        assert!(ctx.find("prio"));
        assert_eq!(ctx.position("prio"), Some(1));
        ctx.remove_field(0);
        assert!(!ctx.find("cpu_id"));
        assert_eq!(ctx.len(), 1);
        ctx.remove_field(5);
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn reserved_fields_are_not_found_or_recorded() {
        let mut ctx = Context::new();
        ctx.append_field().unwrap();
        assert!(!ctx.find(""));
        let rec = RecordContext::new(0, 0);
        assert_eq!(ctx.get_size(0, &rec), 0);
    }

    #[test]
    fn table_limit() {
        let mut ctx = Context::with_max_fields(1);
        assert_eq!(ctx.append_field(), Ok(0));
        assert_eq!(ctx.append_field(), Err(Error::ResourceExhausted("context fields")));
    }

    #[test]
    fn size_matches_record() {
        let mut ctx = Context::new();
        add(&mut ctx, "a", 7);
        add(&mut ctx, "b", 9);
        let rec = RecordContext::new(0, 0);
        let mut buf = RecordBuffer::default();
        assert_eq!(ctx.get_size(0, &rec), 2);
        ctx.record(&rec, &mut buf);
        assert_eq!(buf.as_bytes(), &[7, 9]);
    }

    #[test]
    fn metadata_declarations() {
        let length = EventField {
            name: "callstack_user_length",
            ty: FieldType::Integer(IntegerType::native_word(10)),
        };
        let sequence = EventField {
            name: "callstack_user",
            ty: FieldType::Sequence {
                length_name: "callstack_user_length",
                elem_type: IntegerType::native_word(16),
                alignment: 0,
            },
        };
        let bits = usize::BITS;
        assert_eq!(
            length.to_string(),
            format!(
                "integer {{ size = {bits}; align = {bits}; signed = false; encoding = none; base = 10; }} _callstack_user_length;"
            )
        );
        assert_eq!(
            sequence.to_string(),
            format!(
                "integer {{ size = {bits}; align = {bits}; signed = false; encoding = none; base = 16; }} _callstack_user[ _callstack_user_length ];"
            )
        );
    }
}
