//! The trace log.
//!
//! The log is a stdio stream with a fully-buffered, statically allocated
//! buffer, so writing a record never calls back into the allocator being
//! traced.  stdio locks the stream around each `fwrite`, which keeps lines
//! from different threads intact.

use std::{
    cell::UnsafeCell,
    ffi::CStr,
    fmt::Write,
    io, ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use libc::{FILE, _IOFBF};

use crate::{diag::StackWriter, error::TraceError, record::TimedRecord};

/// Size of the stdio buffer of the trace log.
pub const SINK_BUFFER_SIZE: usize = 4096;

// Longest possible line is a `calloc` with three 64-bit values.
const MAX_LINE: usize = 128;

pub struct TraceSink {
    file: AtomicPtr<FILE>,
    // Set by the first `open`, successful or not.  A sink is never reopened.
    used: AtomicBool,
    buf: UnsafeCell<[u8; SINK_BUFFER_SIZE]>,
}

// `buf` is handed to stdio once, in `open`, and only stdio touches it afterwards.
unsafe impl Sync for TraceSink {}

impl TraceSink {
    pub const fn new() -> Self {
        TraceSink {
            file: AtomicPtr::new(ptr::null_mut()),
            used: AtomicBool::new(false),
            buf: UnsafeCell::new([0; SINK_BUFFER_SIZE]),
        }
    }

    /// Create (or truncate) `path` and start logging into it.
    ///
    /// The sink must be `'static` because stdio keeps using its buffer until
    /// the stream is closed.
    pub fn open(&'static self, path: &'static CStr) -> Result<(), TraceError> {
        if self.used.swap(true, Ordering::AcqRel) {
            return Err(TraceError::SinkReused);
        }

        let file = unsafe { libc::fopen(path.as_ptr(), c"w+e".as_ptr()) };
        if file.is_null() {
            return Err(TraceError::SinkOpen {
                path,
                source: io::Error::last_os_error(),
            });
        }
        unsafe {
            libc::setvbuf(file, self.buf.get().cast(), _IOFBF, SINK_BUFFER_SIZE);
        }
        self.file.store(file, Ordering::Release);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.file.load(Ordering::Acquire).is_null()
    }

    /// Append one line.  A no-op when the sink is not open.
    pub fn append(&self, record: &TimedRecord) {
        let file = self.file.load(Ordering::Acquire);
        if file.is_null() {
            return;
        }
        let mut line = StackWriter::<MAX_LINE>::new();
        if writeln!(line, "{}", record).is_err() {
            return;
        }
        let bytes = line.as_bytes();
        unsafe {
            libc::fwrite(bytes.as_ptr().cast(), 1, bytes.len(), file);
        }
    }

    /// Flush and close the log.  Closing twice, or closing a sink that was
    /// never opened, does nothing.
    pub fn close(&self) {
        // Writers load the stream without a lock.  One that loaded it just
        // before this swap can still reach `fwrite` after `fclose`; only
        // writes racing with process exit are exposed to this.
        let file = self.file.swap(ptr::null_mut(), Ordering::AcqRel);
        if !file.is_null() {
            unsafe {
                libc::fclose(file);
            }
        }
    }
}

impl Default for TraceSink {
    fn default() -> Self {
        Self::new()
    }
}
