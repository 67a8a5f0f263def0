//! `malloc_trace` records every `malloc`, `calloc`, `realloc` and `free` call a
//! program makes, together with its result and a timestamp, in a plain text
//! log.  It is not a heap profiler: it does no accounting while the program
//! runs and never changes what the allocator returns.
//!
//! ## Tracing a program
//!
//! Build the companion [`lib_malloc_trace`] crate, which produces a dynamic
//! library that replaces the allocator entry points when loaded with
//! `LD_PRELOAD`:
//!
//! ```bash
//! MALLOC_TRACE=/tmp/app.log LD_PRELOAD=libmalloc_trace.so ./my_program
//! ```
//!
//! The log goes to the file named by `MALLOC_TRACE`, or to `mtrace.log` in the
//! current directory when the variable is not set.  Each line describes one
//! call (see [`record`]):
//!
//! ```text
//! 1700000000.000042 malloc(10) = 55d0c4a2b2a0
//! 1700000000.000071 free(55d0c4a2b2a0)
//! ```
//!
//! ## How it works
//!
//! When the library is loaded, an initializer looks up the next definitions
//! of the allocator functions with `dlsym(RTLD_NEXT, ..)` and opens the log.
//! `dlsym` may itself allocate before the real `malloc` is known; such early
//! requests are served from a small static arena ([`bootstrap`]).  After that
//! every call is forwarded to the real allocator and then logged.  The log is
//! flushed and closed when the library is unloaded.
//!
//! ## Reading traces
//!
//! The `mt_print` tool from this crate summarizes one or more logs:
//!
//! ```bash
//! mt_print --log '/tmp/app*.log'
//! ```

#![allow(clippy::missing_safety_doc)]

pub mod bootstrap;
pub mod context;
pub mod diag;
pub mod error;
pub mod record;
pub mod resolve;
pub mod sink;
pub mod summary;

pub use context::TraceContext;
pub use error::TraceError;
pub use record::{Record, TimedRecord, Timestamp};
pub use resolve::NextSymbols;
pub use summary::TraceSummary;
