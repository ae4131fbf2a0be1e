//! # GlobalAlloc shim
//!
//! Routes Rust's allocation machinery into the free-list heap. Null is
//! returned on exhaustion per the `GlobalAlloc` contract; callers see the
//! usual `alloc_error_handler` path.

use crate::allocator::static_heap::HEAP;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};

/// The kernel's global allocator.
pub struct KernelAllocator;

/// The installed global allocator instance (bare-metal builds only; host
/// tests keep the host allocator).
#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    /// Allocate at least `layout.size()` bytes at `layout.align()`.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies; a null return signals OOM.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        HEAP.with_lock(|heap| heap.allocate_aligned(layout.size().max(1), layout.align()))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    /// Return a block previously handed out by `alloc`/`alloc_zeroed`.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies; `ptr` must come from this
    /// allocator.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        HEAP.with_lock(|heap| unsafe { heap.free(ptr) });
    }

    /// Allocate and zero a block.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}
