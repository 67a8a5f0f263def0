//! Lookup of the allocator functions we shadow.
//!
//! Once our library exports `malloc`, calling `libc::malloc` from inside it
//! would land right back in our own definition.  The real implementations are
//! found with `dlsym(RTLD_NEXT, ..)`, which searches the objects loaded after
//! this one.

use std::{
    ffi::CStr,
    fmt::{self, Debug, Display, Formatter},
    mem,
};

use libc::{c_char, c_void, dlerror, dlsym, size_t, RTLD_NEXT};

use crate::{diag, error::TraceError};

pub type GetenvFunc = unsafe extern "C" fn(name: *const c_char) -> *mut c_char;
pub type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);
pub type MallocFunc = unsafe extern "C" fn(size: size_t) -> *mut c_void;
pub type CallocFunc = unsafe extern "C" fn(count: size_t, size: size_t) -> *mut c_void;
pub type ReallocFunc = unsafe extern "C" fn(ptr: *mut c_void, size: size_t) -> *mut c_void;

const DLERROR_CAPACITY: usize = 128;

/// Loader error message, copied out of `dlerror()`'s buffer without allocating.
#[derive(Clone, Copy)]
pub struct DlError {
    msg: [u8; DLERROR_CAPACITY],
    len: usize,
}

impl DlError {
    pub fn new(msg: &[u8]) -> Self {
        let len = msg.len().min(DLERROR_CAPACITY);
        let mut err = DlError {
            msg: [0; DLERROR_CAPACITY],
            len,
        };
        err.msg[..len].copy_from_slice(&msg[..len]);
        err
    }

    /// Take the pending `dlerror()` message, if any.
    fn take() -> Self {
        let msg = unsafe { dlerror() };
        if msg.is_null() {
            Self::new(b"symbol not found")
        } else {
            Self::new(unsafe { CStr::from_ptr(msg) }.to_bytes())
        }
    }

    pub fn message(&self) -> &str {
        // The copy may have cut a multi-byte character in half.
        match std::str::from_utf8(&self.msg[..self.len]) {
            Ok(s) => s,
            Err(e) => std::str::from_utf8(&self.msg[..e.valid_up_to()]).unwrap_or_default(),
        }
    }
}

impl Display for DlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(self.message())
    }
}

impl Debug for DlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("DlError").field(&self.message()).finish()
    }
}

impl std::error::Error for DlError {}

/// Where symbol addresses come from.
pub trait SymbolSource {
    fn lookup(&self, name: &CStr) -> Result<*mut c_void, DlError>;
}

/// The definitions that would be visible if this library were not loaded.
pub struct NextSymbols;

impl SymbolSource for NextSymbols {
    fn lookup(&self, name: &CStr) -> Result<*mut c_void, DlError> {
        // Clear any stale error so that the message we report belongs to this lookup.
        unsafe { dlerror() };
        let sym = unsafe { dlsym(RTLD_NEXT, name.as_ptr()) };
        if sym.is_null() {
            Err(DlError::take())
        } else {
            Ok(sym)
        }
    }
}

/// The real allocator.  An entry is `None` when its symbol could not be found.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealAllocator {
    pub free: Option<FreeFunc>,
    pub malloc: Option<MallocFunc>,
    pub calloc: Option<CallocFunc>,
    pub realloc: Option<ReallocFunc>,
}

impl RealAllocator {
    pub fn is_complete(&self) -> bool {
        self.free.is_some() && self.malloc.is_some() && self.calloc.is_some() && self.realloc.is_some()
    }
}

/// Result of symbol resolution.
#[derive(Clone, Copy, Debug, Default)]
pub struct Resolved {
    pub getenv: Option<GetenvFunc>,
    pub allocator: RealAllocator,
}

// Look up one symbol and reinterpret its address as the function type `F`.
// Failures are reported on stderr and leave the entry unset.
unsafe fn lookup<S: SymbolSource + ?Sized, F: Copy>(
    source: &S,
    name: &'static CStr,
    symbol: &'static str,
) -> Option<F> {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*mut c_void>());
    match source.lookup(name) {
        Ok(sym) => Some(mem::transmute_copy::<*mut c_void, F>(&sym)),
        Err(err) => {
            diag!("{}", TraceError::Resolve { symbol, source: err });
            None
        }
    }
}

/// Resolve `getenv` and the four allocator entry points.
///
/// A missing symbol only disables the capability that depends on it.
///
/// # Safety
///
/// `source` must return addresses of functions with the C signatures of the
/// symbols asked for.
pub unsafe fn resolve<S: SymbolSource + ?Sized>(source: &S) -> Resolved {
    let getenv = lookup::<S, GetenvFunc>(source, c"getenv", "getenv");
    let free = lookup::<S, FreeFunc>(source, c"free", "free");
    let malloc = lookup::<S, MallocFunc>(source, c"malloc", "malloc");
    let calloc = lookup::<S, CallocFunc>(source, c"calloc", "calloc");
    let realloc = lookup::<S, ReallocFunc>(source, c"realloc", "realloc");

    Resolved {
        getenv,
        allocator: RealAllocator {
            free,
            malloc,
            calloc,
            realloc,
        },
    }
}
