use std::{ffi::CStr, io};

use thiserror::Error;

use crate::resolve::DlError;

/// Everything that can go wrong inside the tracer.
///
/// None of these ever reach the traced program: the interposed entry points
/// report them through [`diag!`](crate::diag!) and fall back to a null result
/// or a no-op.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("dlsym: {symbol}: {source}")]
    Resolve {
        symbol: &'static str,
        source: DlError,
    },

    #[error("fopen: {}: {source}", .path.to_string_lossy())]
    SinkOpen {
        path: &'static CStr,
        source: io::Error,
    },

    #[error("trace sink can only be opened once")]
    SinkReused,

    #[error("bootstrap arena exhausted ({requested} bytes requested, {remaining} available)")]
    ArenaExhausted { requested: usize, remaining: usize },

    #[error("realloc({addr:#x}, {size:#x}) called before the real allocator was resolved")]
    BootstrapRealloc { addr: usize, size: usize },

    #[error("malformed trace record: {0}")]
    Malformed(String),

    #[error("line {line}: malformed trace record: {text}")]
    Parse { line: usize, text: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}
