/// A result type that wraps [Error].
pub type Result<T> = std::result::Result<T, Error>;

/// Registration errors. Capture itself never fails: a short or empty stack
/// is recorded as such.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid callstack context selector {0}")]
    InvalidArgument(u32),

    #[error("context field `{0}` already exists")]
    AlreadyExists(&'static str),

    #[error("{0} capture is not supported on this platform")]
    UnsupportedMode(&'static str),

    #[error("out of memory reserving {0}")]
    ResourceExhausted(&'static str),
}
