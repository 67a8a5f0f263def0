//! Companion crate to [`malloc_trace`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the allocator calls issued by the program and log them
//! to the file named by `MALLOC_TRACE` (default: `mtrace.log`).

use libc::{c_void, size_t};
use malloc_trace::{NextSymbols, TraceContext};

/// Runs when the library is loaded, before the program's `main`.
extern "C" fn initialize() {
    // SAFETY: `NextSymbols` looks the symbols up in libc, whose definitions
    // have the C signatures `resolve` expects.
    unsafe { TraceContext::global().initialize(&NextSymbols) }
}

/// Runs when the library is unloaded, after `exit` has run the program's handlers.
extern "C" fn finalize() {
    TraceContext::global().finalize()
}

#[used]
#[link_section = ".init_array"]
static INITIALIZE: extern "C" fn() = initialize;

#[used]
#[link_section = ".fini_array"]
static FINALIZE: extern "C" fn() = finalize;

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation
/// catches `malloc` calls performed by the program, forwards them to the
/// original `libc` malloc and logs the call.
///
/// # Safety
///
/// Same contract as `malloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    TraceContext::global().malloc(size)
}

/// Traced `free`.
///
/// # Safety
///
/// Same contract as `free(3)`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    TraceContext::global().free(ptr)
}

/// Traced `calloc`.
///
/// # Safety
///
/// Same contract as `calloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    TraceContext::global().calloc(count, size)
}

/// Traced `realloc`.
///
/// # Safety
///
/// Same contract as `realloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    TraceContext::global().realloc(ptr, size)
}
