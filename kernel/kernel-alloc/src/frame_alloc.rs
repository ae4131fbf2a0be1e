//! # Bitmap Physical Frame Allocator
//!
//! Tracks the free-memory window with one bit per 4 KiB frame and serves
//! contiguous runs first-fit. A `lowest_free` hint remembers where the last
//! scan found room so repeated allocations do not re-walk the used prefix;
//! the hint is a pure optimization and is only ever lowered on free (never
//! advanced), so it can be stale but never unsafe.
//!
//! The allocator is plain data: the owner wraps it in a `SpinMutex`, and
//! that lock is the innermost one in the kernel (it is taken while the
//! page-table lock is held, never the other way around).

use kernel_addresses::{PhysicalAddress, PhysicalBlock, PhysicalPage, Size4K};
use kernel_config::memory::{FRAME_BITMAP_WORDS, PAGE_SIZE};
use kernel_sync::SpinMutex;
use kernel_vmem::FrameAlloc;

/// No run of free frames was long enough for the request.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("out of physical memory")]
pub struct OutOfPhysicalMemory;

/// Free/used state of every frame in the configured physical window.
pub struct FrameBitmap {
    /// One bit per frame; set means used.
    bits: [u64; FRAME_BITMAP_WORDS],
    /// First byte of the managed window.
    window_start: PhysicalAddress,
    /// Frames in the managed window (`<= FRAME_BITMAP_WORDS * 64`).
    window_pages: usize,
    /// No frame below this index is known to be free.
    lowest_free: usize,
}

impl FrameBitmap {
    /// An allocator over `window_pages` frames starting at `window_start`.
    ///
    /// # Panics
    /// When the window exceeds the configured bitmap capacity or is not
    /// page-aligned.
    #[must_use]
    pub const fn new(window_start: PhysicalAddress, window_pages: usize) -> Self {
        assert!(window_pages <= FRAME_BITMAP_WORDS * 64);
        assert!(window_start.as_u64() % PAGE_SIZE == 0);
        Self {
            bits: [0; FRAME_BITMAP_WORDS],
            window_start,
            window_pages,
            lowest_free: 0,
        }
    }

    /// Allocate a contiguous run of frames covering `target_size` bytes
    /// (rounded up to whole pages).
    ///
    /// First-fit: the scan starts at the hint and never wraps; if no
    /// sufficiently long run exists before the end of the window the
    /// request fails and the bitmap is left untouched. A zero-size request
    /// is defined to succeed with [`PhysicalBlock::EMPTY`].
    ///
    /// # Errors
    /// [`OutOfPhysicalMemory`] when no run is long enough.
    pub fn allocate(&mut self, target_size: u64) -> Result<PhysicalBlock, OutOfPhysicalMemory> {
        if target_size == 0 {
            return Ok(PhysicalBlock::EMPTY);
        }
        let pages = target_size.div_ceil(PAGE_SIZE) as usize;

        let mut run_start = self.lowest_free;
        let mut run_len = 0_usize;
        let mut index = self.lowest_free;
        while index < self.window_pages {
            if self.is_used(index) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == pages {
                    break;
                }
            }
            index += 1;
        }
        if run_len < pages {
            return Err(OutOfPhysicalMemory);
        }

        for i in run_start..run_start + pages {
            self.mark_used(i);
        }
        // Only a run starting exactly at the hint proves the hint stale.
        if run_start == self.lowest_free {
            self.lowest_free = run_start + pages;
        }

        Ok(PhysicalBlock::new(
            self.window_start + (run_start as u64) * PAGE_SIZE,
            (pages as u64) * PAGE_SIZE,
        ))
    }

    /// Return `block`'s frames to the pool.
    ///
    /// Partial ranges of an earlier allocation are fine as long as they are
    /// page-aligned; the bitmap is the only owner of record.
    pub fn free(&mut self, block: PhysicalBlock) {
        if block.is_empty() {
            return;
        }
        debug_assert!(block.start.is_aligned_to(PAGE_SIZE));
        debug_assert!(block.size % PAGE_SIZE == 0);

        let first = ((block.start - self.window_start) / PAGE_SIZE) as usize;
        let pages = (block.size / PAGE_SIZE) as usize;
        debug_assert!(first + pages <= self.window_pages);

        for i in first..first + pages {
            debug_assert!(self.is_used(i), "double free of frame {i}");
            self.mark_free(i);
        }
        if first < self.lowest_free {
            self.lowest_free = first;
        }
    }

    /// Number of frames currently allocated.
    #[must_use]
    pub fn used_pages(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of frames currently free.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.window_pages - self.used_pages()
    }

    #[inline]
    fn is_used(&self, index: usize) -> bool {
        self.bits[index / 64] >> (index % 64) & 1 == 1
    }

    #[inline]
    fn mark_used(&mut self, index: usize) {
        self.bits[index / 64] |= 1 << (index % 64);
    }

    #[inline]
    fn mark_free(&mut self, index: usize) {
        self.bits[index / 64] &= !(1 << (index % 64));
    }
}

/// [`FrameAlloc`] adapter over the locked bitmap.
///
/// Each 4 KiB allocation takes the frame lock for exactly one bitmap scan,
/// keeping the innermost critical section bounded even when the caller
/// (the fault path) holds the page-table lock for the whole walk.
pub struct LockedFrames<'a>(&'a SpinMutex<FrameBitmap>);

impl<'a> LockedFrames<'a> {
    #[must_use]
    pub const fn new(frames: &'a SpinMutex<FrameBitmap>) -> Self {
        Self(frames)
    }
}

impl FrameAlloc for LockedFrames<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let block = self.0.lock().allocate(PAGE_SIZE).ok()?;
        Some(PhysicalPage::from_addr(block.start))
    }
}
