//! Allocate-only arena that serves `malloc` before the real allocator is known.
//!
//! `dlsym` and `dlerror` may allocate while we are still resolving `malloc`
//! itself.  Those requests are carved out of a static buffer with a bump
//! pointer.  Nothing is ever returned to the arena.

use std::{
    cell::UnsafeCell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::TraceError;

/// Capacity of the arena used by the `LD_PRELOAD` library.
pub const BOOTSTRAP_ARENA_SIZE: usize = 16 * 1024;

// Every block starts with a header holding the requested size, so that a
// block can be migrated to the real allocator by `realloc` later.
const HEADER: usize = 16;
const ALIGN: usize = 16;

#[repr(C, align(16))]
struct Aligned<const N: usize>([u8; N]);

pub struct BootstrapArena<const N: usize> {
    buf: UnsafeCell<Aligned<N>>,
    offset: AtomicUsize,
}

// The offset is only advanced atomically, and every successful advance hands
// out a disjoint slice of `buf`.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        BootstrapArena {
            buf: UnsafeCell::new(Aligned([0; N])),
            offset: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.buf.get().cast()
    }

    /// Reserve `size` bytes.  The returned memory is zeroed.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, TraceError> {
        let exhausted = |offset: usize| TraceError::ArenaExhausted {
            requested: size,
            remaining: N.saturating_sub(offset + HEADER),
        };
        let needed = size
            .checked_add(HEADER + ALIGN - 1)
            .map(|n| n & !(ALIGN - 1))
            .ok_or_else(|| exhausted(self.used()))?;

        // Failed requests must not move the offset, hence CAS instead of fetch_add.
        let mut offset = self.offset.load(Ordering::Relaxed);
        loop {
            let end = match offset.checked_add(needed) {
                Some(end) if end <= N => end,
                _ => return Err(exhausted(offset)),
            };
            match self.offset.compare_exchange_weak(
                offset,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => offset = current,
            }
        }

        unsafe {
            let block = self.base().add(offset);
            block.cast::<usize>().write(size);
            Ok(NonNull::new_unchecked(block.add(HEADER)))
        }
    }

    /// Does `ptr` point into the arena?
    pub fn contains<T>(&self, ptr: *const T) -> bool {
        let base = self.base() as usize;
        let p = ptr as usize;
        p >= base && p < base + N
    }

    /// Size originally requested for a block returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc` on this arena.
    pub unsafe fn block_size<T>(&self, ptr: *const T) -> usize {
        ptr::read(ptr.cast::<u8>().sub(HEADER).cast::<usize>())
    }

    /// Bytes consumed so far, headers and padding included.
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::BootstrapArena;
    use crate::error::TraceError;
    use std::{sync::Arc, thread::spawn};

    #[test]
    fn blocks_stay_in_bounds() {
        let arena = BootstrapArena::<256>::new();
        let a = arena.alloc(10).unwrap();
        let b = arena.alloc(1).unwrap();
        assert!(arena.contains(a.as_ptr()));
        assert!(arena.contains(b.as_ptr()));
        assert_eq!(a.as_ptr() as usize % 16, 0);
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 10);
        assert_eq!(unsafe { arena.block_size(a.as_ptr()) }, 10);
        assert_eq!(unsafe { arena.block_size(b.as_ptr()) }, 1);
        let outside = 0u8;
        assert!(!arena.contains(&outside as *const u8));
    }

    #[test]
    fn exhaustion_keeps_offset() {
        let arena = BootstrapArena::<128>::new();
        arena.alloc(40).unwrap();
        let used = arena.used();

        match arena.alloc(100) {
            Err(TraceError::ArenaExhausted { requested, .. }) => assert_eq!(requested, 100),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert!(arena.alloc(usize::MAX).is_err());
        assert_eq!(arena.used(), used);

        // Smaller requests still fit after a failed one.
        let c = arena.alloc(16).unwrap();
        assert!(arena.contains(c.as_ptr()));
        assert!(arena.used() <= arena.capacity());
    }

    #[test]
    fn memory_is_zeroed() {
        let arena = BootstrapArena::<128>::new();
        let p = arena.alloc(32).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 32) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn concurrent_bumps_are_disjoint() {
        let arena = Arc::new(BootstrapArena::<{ 64 * 1024 }>::new());
        let mut thread_handles = vec![];
        for _ in 0..8 {
            let arena = arena.clone();
            thread_handles.push(spawn(move || {
                (0..64)
                    .map(|_| arena.alloc(24).unwrap().as_ptr() as usize)
                    .collect::<Vec<_>>()
            }));
        }
        let mut blocks: Vec<usize> = thread_handles
            .drain(..)
            .flat_map(|t| t.join().unwrap())
            .collect();
        blocks.sort_unstable();
        for pair in blocks.windows(2) {
            assert!(pair[1] - pair[0] >= 24 + 16);
        }
        assert_eq!(arena.used(), 8 * 64 * 48);
    }
}
