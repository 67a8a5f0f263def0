//! Diagnostics for code running inside the allocator.
//!
//! `eprintln!` goes through the `Stderr` lock and may allocate, which is not an
//! option while we are the allocator.  Messages are formatted straight into
//! `write(2)` calls instead.

use core::fmt::{self, Write};

const STDERR: libc::c_int = 2;

/// Unbuffered writer for file descriptor 2.
pub struct StderrWriter;

impl Write for StderrWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            let n = unsafe { libc::write(STDERR, bytes.as_ptr().cast(), bytes.len()) };
            if n <= 0 {
                return Err(fmt::Error);
            }
            bytes = &bytes[n as usize..];
        }
        Ok(())
    }
}

/// Report a tracer diagnostic on stderr.  Never allocates.
#[macro_export]
macro_rules! diag {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!(
            $crate::diag::StderrWriter,
            "malloc_trace: {}",
            format_args!($($arg)*)
        );
    }};
}

/// Fixed-capacity `fmt::Write` target living on the stack.
///
/// Formatting past the end fails instead of truncating silently.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackWriter<N> {
    pub const fn new() -> Self {
        StackWriter { buf: [0; N], len: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > N {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}
