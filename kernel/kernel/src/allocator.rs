//! # Kernel Global Allocator
//!
//! Dynamic-allocation redirection: every generic allocation call site in
//! the kernel goes through the free-list heap in `kernel-alloc`, serialized
//! by one spin lock. The heap's backing storage is carved out of the
//! physical frame allocator during [`crate::memory::init`].

mod kernel_allocator;
mod static_heap;

pub use kernel_allocator::KernelAllocator;
pub use static_heap::{HEAP, free_heap_memory, init_heap};
