//! Global allocator wrapper that keeps live and cumulative counters.
//!
//! ```ignore
//! use leakwatch_core::runtime::CountingAlloc;
//! use tikv_jemallocator::Jemalloc;
//!
//! #[global_allocator]
//! static GLOBAL: CountingAlloc<Jemalloc> = CountingAlloc::new(Jemalloc);
//! ```

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of allocator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocCounters {
    /// Bytes currently allocated.
    pub live_bytes: u64,
    /// Allocations not yet freed.
    pub live_objects: u64,
    /// Bytes ever allocated.
    pub total_bytes: u64,
    /// Allocation calls ever made (reallocations included).
    pub allocations: u64,
}

/// Source of allocator counters.
pub trait AllocatorStats: Send + Sync {
    fn counters(&self) -> AllocCounters;
}

/// Wraps an allocator and counts every allocation passing through it.
pub struct CountingAlloc<A> {
    inner: A,
    live_bytes: AtomicU64,
    live_objects: AtomicU64,
    total_bytes: AtomicU64,
    allocations: AtomicU64,
}

impl<A> CountingAlloc<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            live_bytes: AtomicU64::new(0),
            live_objects: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    fn record_alloc(&self, size: usize) {
        let size = size as u64;
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        self.live_objects.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dealloc(&self, size: usize) {
        self.live_bytes.fetch_sub(size as u64, Ordering::Relaxed);
        self.live_objects.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<A: Send + Sync> AllocatorStats for CountingAlloc<A> {
    fn counters(&self) -> AllocCounters {
        AllocCounters {
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            live_objects: self.live_objects.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }
}

// SAFETY: every call is forwarded unchanged to the wrapped allocator; only
// atomic counters are touched around it, which never allocate.
unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAlloc<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            self.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            self.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) };
        self.record_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            // Counted as a fresh allocation of `new_size` replacing the old block.
            let old = layout.size() as u64;
            let new = new_size as u64;
            if new >= old {
                self.live_bytes.fetch_add(new - old, Ordering::Relaxed);
            } else {
                self.live_bytes.fetch_sub(old - new, Ordering::Relaxed);
            }
            self.total_bytes.fetch_add(new, Ordering::Relaxed);
            self.allocations.fetch_add(1, Ordering::Relaxed);
        }
        new_ptr
    }
}
