//! # Physical Memory Layout

/// Translation granule: 4 KiB pages (Sv39 leaf size).
pub const PAGE_SIZE: u64 = 4096;

/// Where the kernel image is loaded in physical memory.
///
/// # Kernel Build
/// Must match the linker script; the boot path identity-maps from here.
pub const KERNEL_START: u64 = 0x8002_0000;

/// End of the kernel image region (exclusive).
pub const KERNEL_END: u64 = 0x8003_0000;

/// First byte of physical memory owned by the frame allocator.
pub const FREE_MEMORY_START: u64 = 0x8003_0000;

/// End of the frame allocator's window (exclusive).
pub const FREE_MEMORY_END: u64 = 0x8800_0000;

/// Number of page frames inside the free-memory window.
pub const FRAME_WINDOW_PAGES: usize = ((FREE_MEMORY_END - FREE_MEMORY_START) / PAGE_SIZE) as usize;

/// Words of allocation bitmap needed to track the window (one bit per frame).
pub const FRAME_BITMAP_WORDS: usize = FRAME_WINDOW_PAGES.div_ceil(64);

/// Initial kernel heap size (1 MiB), carved out of the free-memory window.
pub const HEAP_SIZE: usize = 1 << 20;

const _: () = {
    assert!(KERNEL_START % PAGE_SIZE == 0);
    assert!(FREE_MEMORY_START % PAGE_SIZE == 0);
    assert!(FREE_MEMORY_END % PAGE_SIZE == 0);
    assert!(KERNEL_END == FREE_MEMORY_START);
    assert!(FREE_MEMORY_START < FREE_MEMORY_END);
    // The heap (plus its bookkeeping) must fit the window with room to spare.
    assert!((HEAP_SIZE as u64) < FREE_MEMORY_END - FREE_MEMORY_START);
};
