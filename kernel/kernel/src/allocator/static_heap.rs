//! # Static Heap
//!
//! The kernel heap singleton: a [`FreeChunkList`] behind a spin lock,
//! formatted once during boot over a block obtained from the frame
//! allocator.

use core::sync::atomic::{AtomicBool, Ordering};
use kernel_alloc::frame_alloc::{FrameBitmap, OutOfPhysicalMemory};
use kernel_alloc::free_list::{CHUNK_HEADER_SIZE, FreeChunkList};
use kernel_config::memory::HEAP_SIZE;
use kernel_sync::SpinMutex;

/// Global heap state protected by a spinlock.
pub static HEAP: SpinMutex<FreeChunkList> = SpinMutex::new(FreeChunkList::new());

/// One-time heap initialization flag.
static DID_INIT: AtomicBool = AtomicBool::new(false);

/// Obtain the heap's backing from the frame allocator and format it as a
/// single free chunk of exactly [`HEAP_SIZE`] payload bytes.
///
/// Must be called exactly once during boot, before the first dynamic
/// allocation; a second call is reported and ignored. Allocating before
/// this ran is a reported failure, not a silent one (see
/// [`FreeChunkList::allocate`]).
///
/// # Errors
/// [`OutOfPhysicalMemory`] when the backing block cannot be allocated.
pub fn init_heap(frames: &SpinMutex<FrameBitmap>) -> Result<(), OutOfPhysicalMemory> {
    if DID_INIT.swap(true, Ordering::AcqRel) {
        log::warn!("heap: init_heap called more than once");
        return Ok(());
    }
    let block = frames.lock().allocate((HEAP_SIZE + CHUNK_HEADER_SIZE) as u64)?;
    HEAP.with_lock(|heap| {
        // Safety: the block was just allocated for the heap's exclusive
        // use, and translation is not active yet during boot, so the
        // physical address is directly writable.
        unsafe {
            heap.init(block.start.as_u64() as *mut u8, HEAP_SIZE);
        }
    });
    log::info!("heap: {HEAP_SIZE} bytes at {}", block.start);
    Ok(())
}

/// Total free heap bytes, defragmenting first.
///
/// An approximate health metric: the sum says nothing about contiguity.
pub fn free_heap_memory() -> usize {
    HEAP.with_lock(FreeChunkList::free_memory)
}
