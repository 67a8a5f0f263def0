//! Process-wide tracer state and the traced allocator operations.

use std::{
    ffi::CStr,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use libc::{c_void, size_t};
use once_cell::sync::OnceCell;

use crate::{
    bootstrap::{BootstrapArena, BOOTSTRAP_ARENA_SIZE},
    diag,
    error::TraceError,
    record::{Record, TimedRecord, Timestamp},
    resolve::{resolve, GetenvFunc, NextSymbols, RealAllocator, SymbolSource},
    sink::TraceSink,
};

/// Environment variable naming the trace log.
pub const TRACE_ENV: &CStr = c"MALLOC_TRACE";

/// Trace log used when `MALLOC_TRACE` is not set.
pub const DEFAULT_TRACE_FILE: &CStr = c"mtrace.log";

// libc's definitions have the C signatures `resolve` expects.
static CONTEXT: TraceContext = unsafe { TraceContext::with_symbols(&NextSymbols) };

/// Tracer state: the bootstrap arena, the real allocator and the trace log.
///
/// Until [`initialize`](Self::initialize) publishes the real allocator, every
/// allocation is served from the bootstrap arena.  After that the allocator
/// table is never modified again, so the hot path only performs an atomic
/// load to find it.
///
/// Shared libraries loaded along with the tracer may allocate from their own
/// initializers before ours has run.  A context created with
/// [`with_symbols`](Self::with_symbols) therefore initializes itself on the
/// first allocation it sees.
pub struct TraceContext {
    arena: BootstrapArena<BOOTSTRAP_ARENA_SIZE>,
    real: OnceCell<RealAllocator>,
    sink: TraceSink,
    initialized: AtomicBool,
    symbols: Option<&'static (dyn SymbolSource + Sync)>,
}

impl TraceContext {
    /// A context that stays in the bootstrap window until `initialize` is called.
    pub const fn new() -> Self {
        TraceContext {
            arena: BootstrapArena::new(),
            real: OnceCell::new(),
            sink: TraceSink::new(),
            initialized: AtomicBool::new(false),
            symbols: None,
        }
    }

    /// A context that initializes itself from `symbols` on first use.
    ///
    /// # Safety
    ///
    /// Same contract as [`initialize`](Self::initialize).
    pub const unsafe fn with_symbols(symbols: &'static (dyn SymbolSource + Sync)) -> Self {
        TraceContext {
            arena: BootstrapArena::new(),
            real: OnceCell::new(),
            sink: TraceSink::new(),
            initialized: AtomicBool::new(false),
            symbols: Some(symbols),
        }
    }

    /// The context shared by the whole process.
    pub fn global() -> &'static TraceContext {
        &CONTEXT
    }

    /// Resolve the real allocator and open the trace log.  Only the first
    /// call does anything.
    ///
    /// Problems are reported on stderr and never stop the process: without a
    /// real allocator the arena keeps serving requests, without a log nothing
    /// is traced.
    ///
    /// # Safety
    ///
    /// `symbols` must return addresses of functions with the C signatures of
    /// the symbols asked for.
    pub unsafe fn initialize<S: SymbolSource + ?Sized>(&'static self, symbols: &S) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }

        // `dlsym` may call back into malloc; those calls see an empty table
        // and use the arena.
        let resolved = resolve(symbols);
        let _ = self.real.set(resolved.allocator);

        let path = trace_path(resolved.getenv);
        if let Err(e) = self.sink.open(path) {
            diag!("{}", e);
        }
    }

    /// Flush and close the trace log.  Safe to call any number of times.
    pub fn finalize(&self) {
        self.sink.close();
    }

    pub fn real_allocator(&self) -> Option<&RealAllocator> {
        self.real.get()
    }

    pub fn is_tracing(&self) -> bool {
        self.sink.is_open()
    }

    // The allocator table, running the initialization now if nothing has
    // started it yet.  Allocations made while resolving still see `None`.
    fn real(&'static self) -> Option<&'static RealAllocator> {
        if let Some(real) = self.real.get() {
            return Some(real);
        }
        if let Some(symbols) = self.symbols {
            if !self.initialized.load(Ordering::Acquire) {
                unsafe { self.initialize(symbols) };
            }
        }
        self.real.get()
    }

    fn trace(&self, timestamp: Timestamp, record: Record) {
        self.sink.append(&TimedRecord { timestamp, record });
    }

    fn arena_alloc(&self, size: usize) -> *mut c_void {
        match self.arena.alloc(size) {
            Ok(p) => p.as_ptr().cast(),
            Err(e) => {
                diag!("{}", e);
                ptr::null_mut()
            }
        }
    }

    /// Traced `malloc`.
    pub unsafe fn malloc(&'static self, size: size_t) -> *mut c_void {
        let now = Timestamp::now();
        let ret = match self.real().and_then(|real| real.malloc) {
            Some(malloc) => malloc(size),
            None => self.arena_alloc(size),
        };
        self.trace(now, Record::Malloc { size, ret: ret as usize });
        ret
    }

    /// Traced `free`.  Arena blocks are never released.
    pub unsafe fn free(&'static self, ptr: *mut c_void) {
        let now = Timestamp::now();
        if !self.arena.contains(ptr) {
            if let Some(free) = self.real().and_then(|real| real.free) {
                free(ptr);
            }
        }
        self.trace(now, Record::Free { addr: ptr as usize });
    }

    /// Traced `calloc`.
    pub unsafe fn calloc(&'static self, count: size_t, size: size_t) -> *mut c_void {
        let now = Timestamp::now();
        let ret = match self.real().and_then(|real| real.calloc) {
            Some(calloc) => calloc(count, size),
            // Arena memory starts out zeroed and is never reused.
            None => match count.checked_mul(size) {
                Some(total) => self.arena_alloc(total),
                None => ptr::null_mut(),
            },
        };
        self.trace(
            now,
            Record::Calloc {
                count,
                size,
                ret: ret as usize,
            },
        );
        ret
    }

    /// Traced `realloc`.
    ///
    /// An arena block is moved to the real allocator once one is available.
    /// Before that, only `realloc(NULL, size)` can be served; resizing an
    /// existing block fails.
    pub unsafe fn realloc(&'static self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        let now = Timestamp::now();
        let real = self.real().copied().unwrap_or_default();
        let ret = if ptr.is_null() && real.realloc.is_none() {
            match real.malloc {
                Some(malloc) => malloc(size),
                None => self.arena_alloc(size),
            }
        } else if self.arena.contains(ptr) {
            self.migrate(ptr, size, &real)
        } else {
            match real.realloc {
                Some(realloc) => realloc(ptr, size),
                None => {
                    diag!(
                        "{}",
                        TraceError::BootstrapRealloc {
                            addr: ptr as usize,
                            size
                        }
                    );
                    ptr::null_mut()
                }
            }
        };
        self.trace(
            now,
            Record::Realloc {
                addr: ptr as usize,
                size,
                ret: ret as usize,
            },
        );
        ret
    }

    // Copy an arena block into a fresh block from the real allocator.
    unsafe fn migrate(&self, ptr: *mut c_void, size: usize, real: &RealAllocator) -> *mut c_void {
        let malloc = match real.malloc {
            Some(malloc) => malloc,
            None => {
                diag!(
                    "{}",
                    TraceError::BootstrapRealloc {
                        addr: ptr as usize,
                        size
                    }
                );
                return ptr::null_mut();
            }
        };
        let new = malloc(size);
        if !new.is_null() {
            let len = self.arena.block_size(ptr).min(size);
            ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.cast::<u8>(), len);
        }
        new
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Log file named by `MALLOC_TRACE`, or `mtrace.log`.
///
/// `getenv` is the resolved libc function; without it the default is used.
pub fn trace_path(getenv: Option<GetenvFunc>) -> &'static CStr {
    let value = match getenv {
        Some(getenv) => unsafe { getenv(TRACE_ENV.as_ptr()) },
        None => ptr::null_mut(),
    };
    if value.is_null() {
        DEFAULT_TRACE_FILE
    } else {
        // The environment block outlives every caller of the tracer.
        unsafe { CStr::from_ptr(value) }
    }
}
