//! # Kernel Heap: First-Fit Free List with Deferred Coalescing
//!
//! Every free region of the heap starts with a [`FreeChunk`] header linking
//! it into a doubly linked list kept in **ascending address order**:
//!
//! ```text
//! +----------------------+-------------------------+
//! | FreeChunk (header)   |      payload (size)     |
//! +----------------------+-------------------------+
//! ^ chunk_addr           ^ chunk_addr + CHUNK_HEADER_SIZE
//! ```
//!
//! Allocated chunks are **not** in the list; the returned pointer sits at a
//! fixed offset past the header, and [`free`](FreeChunkList::free) recovers
//! the header arithmetically. Freeing re-inserts at the ordered position
//! but does **not** merge neighbors; adjacency is collapsed only by
//! [`defragment`](FreeChunkList::defragment), which allocation retries once
//! after a failed first-fit scan.
//!
//! Chunks live at byte-granular addresses (allocation sizes are served
//! exactly, never rounded), so the header is packed and every header access
//! goes through raw pointers with unaligned loads and stores.
//!
//! The list is plain data: the owner wraps it in a `SpinMutex`, and no
//! operation here ever calls back into the allocator (no reentrancy).

use core::ptr::{self, NonNull, null_mut};

/// No free chunk could satisfy the request, even after defragmentation.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("out of heap memory")]
pub struct OutOfHeapMemory;

/// Header of one free region. Packed: chunks start wherever a previous
/// allocation ended.
#[repr(C, packed)]
struct FreeChunk {
    /// Next free chunk in address order (or null).
    next: *mut FreeChunk,
    /// Previous free chunk in address order (or null for the list head).
    prev: *mut FreeChunk,
    /// Payload bytes following this header.
    size: usize,
}

/// Bytes of bookkeeping in front of every chunk's payload.
pub const CHUNK_HEADER_SIZE: usize = size_of::<FreeChunk>();

/// Align `addr` upwards to `align` (a power of two).
#[inline]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + (align - 1)) & !(align - 1)
}

/// The kernel heap's free list.
///
/// # Invariants
/// - Free chunks are non-overlapping, sorted by address, and lie within the
///   region handed to [`init`](Self::init).
/// - `head` points at the lowest-addressed free chunk (or null when the
///   heap is exhausted).
pub struct FreeChunkList {
    head: *mut FreeChunk,
    initialized: bool,
}

// Safety: the list is always used under the owner's SpinMutex; raw pointers
// are only dereferenced while that lock is held.
unsafe impl Send for FreeChunkList {}

impl Default for FreeChunkList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeChunkList {
    /// An empty list; unusable until [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: null_mut(),
            initialized: false,
        }
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Format `[start, start + CHUNK_HEADER_SIZE + size)` as a single free
    /// chunk with payload exactly `size` and zero the payload.
    ///
    /// # Safety
    /// - The range must be valid, writable and exclusive to this list.
    /// - Must be called exactly once, before any allocation.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        debug_assert!(!self.initialized);
        let chunk = start.cast::<FreeChunk>();
        unsafe {
            ptr::write_unaligned(
                chunk,
                FreeChunk {
                    next: null_mut(),
                    prev: null_mut(),
                    size,
                },
            );
            ptr::write_bytes(start.add(CHUNK_HEADER_SIZE), 0, size);
        }
        self.head = chunk;
        self.initialized = true;
    }

    /// Allocate exactly `size` bytes.
    ///
    /// First-fit over the free list; when the scan fails, the list is
    /// defragmented once and the scan retried.
    ///
    /// # Errors
    /// [`OutOfHeapMemory`] when no chunk fits even after defragmentation.
    /// Calling before [`init`](Self::init) is reported and fails the same
    /// way.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfHeapMemory> {
        self.allocate_aligned(size, 1)
    }

    /// Allocate `size` bytes whose address is a multiple of `align`
    /// (a power of two).
    ///
    /// For payloads that already satisfy `align` this is exactly
    /// [`allocate`](Self::allocate); otherwise the start is aligned up
    /// inside the chunk and the skipped head stays in the list as a
    /// shrunken free chunk.
    ///
    /// # Errors
    /// [`OutOfHeapMemory`]; see [`allocate`](Self::allocate).
    pub fn allocate_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, OutOfHeapMemory> {
        if !self.initialized {
            log::error!("heap: allocation of {size} bytes before initialization");
            return Err(OutOfHeapMemory);
        }
        if let Some(p) = unsafe { self.take_fit(size, align) } {
            return Ok(p);
        }
        self.defragment();
        unsafe { self.take_fit(size, align) }.ok_or(OutOfHeapMemory)
    }

    /// Return an allocation to the list at its address-ordered position.
    ///
    /// No coalescing happens here; adjacency is collapsed by
    /// [`defragment`](Self::defragment).
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) /
    /// [`allocate_aligned`](Self::allocate_aligned) on this list and must
    /// not be freed twice.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let chunk = (ptr.as_ptr() as usize - CHUNK_HEADER_SIZE) as *mut FreeChunk;
        unsafe {
            if self.head.is_null() {
                (*chunk).next = null_mut();
                (*chunk).prev = null_mut();
                self.head = chunk;
                return;
            }

            if chunk < self.head {
                (*chunk).next = self.head;
                (*chunk).prev = null_mut();
                (*self.head).prev = chunk;
                self.head = chunk;
                return;
            }

            let mut curr = self.head;
            while !(*curr).next.is_null() && (*curr).next < chunk {
                curr = (*curr).next;
            }
            (*chunk).next = (*curr).next;
            (*chunk).prev = curr;
            (*curr).next = chunk;
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = chunk;
            }
        }
    }

    /// Merge every run of exactly-adjacent free chunks into one chunk.
    ///
    /// A chunk is adjacent to its successor when its end (header plus
    /// payload) is the successor's address; each merge reclaims the
    /// successor's header into the payload. This is the only place
    /// adjacency is collapsed.
    pub fn defragment(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            unsafe {
                loop {
                    let next = (*curr).next;
                    if next.is_null() {
                        break;
                    }
                    let end = curr as usize + CHUNK_HEADER_SIZE + (*curr).size;
                    if end != next as usize {
                        break;
                    }
                    (*curr).size += CHUNK_HEADER_SIZE + (*next).size;
                    let after = (*next).next;
                    (*curr).next = after;
                    if !after.is_null() {
                        (*after).prev = curr;
                    }
                }
                curr = (*curr).next;
            }
        }
    }

    /// Total free payload bytes.
    ///
    /// Defragments first (the sum is otherwise sensitive to fragmentation)
    /// and is still an approximate health metric: free memory is not
    /// guaranteed to be contiguous.
    pub fn free_memory(&mut self) -> usize {
        self.defragment();
        let mut total = 0;
        let mut curr = self.head;
        while !curr.is_null() {
            unsafe {
                total += (*curr).size;
                curr = (*curr).next;
            }
        }
        total
    }

    /// First-fit scan. Returns the payload pointer, or `None` if nothing
    /// fits.
    ///
    /// # Safety
    /// The list invariants must hold (they do unless `free` was misused).
    unsafe fn take_fit(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut curr = self.head;
        while !curr.is_null() {
            unsafe {
                let payload = curr as usize + CHUNK_HEADER_SIZE;
                let chunk_end = payload + (*curr).size;

                // Skew the aligned start so a skipped head always has room
                // for its own header.
                let mut alloc_start = align_up(payload, align);
                if alloc_start != payload && alloc_start - payload < CHUNK_HEADER_SIZE {
                    alloc_start = align_up(payload + CHUNK_HEADER_SIZE, align);
                }

                if alloc_start + size <= chunk_end {
                    return Some(self.carve(curr, alloc_start, size, chunk_end));
                }
                curr = (*curr).next;
            }
        }
        None
    }

    /// Take `[alloc_start, alloc_start + size)` out of the free chunk at
    /// `curr`, splitting off head and tail remainders as needed.
    ///
    /// # Safety
    /// `curr` is a live list chunk and the allocation range fits inside it
    /// (established by [`take_fit`](Self::take_fit)).
    unsafe fn carve(
        &mut self,
        curr: *mut FreeChunk,
        alloc_start: usize,
        size: usize,
        chunk_end: usize,
    ) -> NonNull<u8> {
        let payload = curr as usize + CHUNK_HEADER_SIZE;
        let head_keep = alloc_start - payload;
        let alloc_end = alloc_start + size;
        let tail_excess = chunk_end - alloc_end;

        unsafe {
            if head_keep == 0 {
                if tail_excess > CHUNK_HEADER_SIZE {
                    // Split: the remainder becomes a new free chunk taking
                    // this chunk's place in the list.
                    let tail = alloc_end as *mut FreeChunk;
                    ptr::write_unaligned(
                        tail,
                        FreeChunk {
                            next: (*curr).next,
                            prev: (*curr).prev,
                            size: tail_excess - CHUNK_HEADER_SIZE,
                        },
                    );
                    if (*tail).prev.is_null() {
                        self.head = tail;
                    } else {
                        (*(*tail).prev).next = tail;
                    }
                    if !(*tail).next.is_null() {
                        (*(*tail).next).prev = tail;
                    }
                    (*curr).size = size;
                } else {
                    // Excess of at most one header is not worth a chunk;
                    // the allocation absorbs it. Unlink.
                    let (prev, next) = ((*curr).prev, (*curr).next);
                    if prev.is_null() {
                        self.head = next;
                    } else {
                        (*prev).next = next;
                    }
                    if !next.is_null() {
                        (*next).prev = prev;
                    }
                }
            } else {
                // Alignment skipped `head_keep` bytes; the chunk stays in
                // the list shrunk to exactly that head.
                (*curr).size = head_keep - CHUNK_HEADER_SIZE;

                let alloc_hdr = (alloc_start - CHUNK_HEADER_SIZE) as *mut FreeChunk;
                if tail_excess > CHUNK_HEADER_SIZE {
                    let tail = alloc_end as *mut FreeChunk;
                    ptr::write_unaligned(
                        tail,
                        FreeChunk {
                            next: (*curr).next,
                            prev: curr,
                            size: tail_excess - CHUNK_HEADER_SIZE,
                        },
                    );
                    if !(*tail).next.is_null() {
                        (*(*tail).next).prev = tail;
                    }
                    (*curr).next = tail;
                    (*alloc_hdr).size = size;
                } else {
                    (*alloc_hdr).size = size + tail_excess;
                }
            }

            NonNull::new_unchecked(alloc_start as *mut u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A heap over an owned buffer; the buffer is poisoned so tests notice
    /// if init's zeroing or an allocation strays.
    struct TestHeap {
        _buf: Box<[u8]>,
        list: FreeChunkList,
    }

    impl TestHeap {
        fn with_payload(size: usize) -> Self {
            let mut buf = vec![0xAA_u8; size + CHUNK_HEADER_SIZE].into_boxed_slice();
            let mut list = FreeChunkList::new();
            unsafe {
                list.init(buf.as_mut_ptr(), size);
            }
            Self { _buf: buf, list }
        }
    }

    fn chunk_sizes(list: &FreeChunkList) -> Vec<usize> {
        let mut out = Vec::new();
        let mut curr = list.head;
        while !curr.is_null() {
            unsafe {
                out.push((*curr).size);
                curr = (*curr).next;
            }
        }
        out
    }

    #[test]
    fn allocation_before_init_is_reported_not_silent() {
        let mut list = FreeChunkList::new();
        assert_eq!(list.allocate(16), Err(OutOfHeapMemory));
        assert!(!list.is_initialized());
    }

    #[test]
    fn exact_accounting_for_the_one_mebibyte_scenario() {
        const MIB: usize = 1 << 20;
        let mut heap = TestHeap::with_payload(MIB);
        assert_eq!(heap.list.free_memory(), MIB);

        let a = heap.list.allocate(300).unwrap();
        let b = heap.list.allocate(300).unwrap();
        let _c = heap.list.allocate(300).unwrap();
        // Each split consumed one header for the new free chunk.
        assert_eq!(
            heap.list.free_memory(),
            MIB - 3 * CHUNK_HEADER_SIZE - 900
        );

        unsafe {
            heap.list.free(a);
            heap.list.free(b);
        }
        // The first two allocations were address-adjacent, so after the
        // defragmentation inside free_memory they merge, reclaiming one
        // header; 2 * (300 + header) comes back in total.
        assert_eq!(
            heap.list.free_memory(),
            MIB - 3 * CHUNK_HEADER_SIZE - 900 + 2 * (300 + CHUNK_HEADER_SIZE)
        );
    }

    #[test]
    fn full_round_trip_restores_initial_size() {
        let mut heap = TestHeap::with_payload(4096);
        let mut ptrs = Vec::new();
        for size in [17, 256, 31, 800, 5] {
            ptrs.push(heap.list.allocate(size).unwrap());
        }
        // Free in a scrambled order.
        for i in [3, 0, 4, 1, 2] {
            unsafe {
                heap.list.free(ptrs[i]);
            }
        }
        assert_eq!(heap.list.free_memory(), 4096);
        assert_eq!(chunk_sizes(&heap.list), [4096]);
    }

    #[test]
    fn adjacent_frees_coalesce_into_one_chunk() {
        let mut heap = TestHeap::with_payload(4096);
        let a = heap.list.allocate(300).unwrap();
        let b = heap.list.allocate(300).unwrap();
        // A third allocation keeps the tail from merging into the pair.
        let _guard = heap.list.allocate(300).unwrap();

        unsafe {
            heap.list.free(b);
            heap.list.free(a);
        }
        heap.list.defragment();

        // The pair merged into one chunk: both sizes plus the reclaimed
        // header of the second chunk.
        let sizes = chunk_sizes(&heap.list);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0], 300 + CHUNK_HEADER_SIZE + 300);
    }

    #[test]
    fn free_does_not_coalesce_by_itself() {
        let mut heap = TestHeap::with_payload(4096);
        let a = heap.list.allocate(100).unwrap();
        let b = heap.list.allocate(100).unwrap();
        let _guard = heap.list.allocate(100).unwrap();

        unsafe {
            heap.list.free(a);
            heap.list.free(b);
        }
        // Three chunks until someone defragments.
        assert_eq!(chunk_sizes(&heap.list).len(), 3);
        heap.list.defragment();
        assert_eq!(chunk_sizes(&heap.list).len(), 2);
    }

    #[test]
    fn small_excess_is_absorbed_not_split() {
        let mut heap = TestHeap::with_payload(128);
        // Excess of exactly one header must not produce a zero-size chunk.
        let a = heap.list.allocate(128 - CHUNK_HEADER_SIZE).unwrap();
        assert_eq!(chunk_sizes(&heap.list).len(), 0);
        assert_eq!(heap.list.free_memory(), 0);

        unsafe {
            heap.list.free(a);
        }
        // The absorbed excess comes back with the chunk.
        assert_eq!(heap.list.free_memory(), 128);
    }

    #[test]
    fn failed_scan_defragments_and_retries() {
        let mut heap = TestHeap::with_payload(1000);
        let a = heap.list.allocate(400).unwrap();
        let b = heap.list.allocate(400).unwrap();
        unsafe {
            heap.list.free(a);
            heap.list.free(b);
        }
        // The list now holds 400 + 400 + tail as separate chunks; only
        // the defragmented heap can serve 900 bytes.
        let big = heap.list.allocate(900).unwrap();
        unsafe {
            heap.list.free(big);
        }
        assert_eq!(heap.list.free_memory(), 1000);
    }

    #[test]
    fn exhaustion_reports_out_of_heap_memory() {
        let mut heap = TestHeap::with_payload(256);
        assert_eq!(heap.list.allocate(512), Err(OutOfHeapMemory));
        // The failure left the heap intact.
        assert_eq!(heap.list.free_memory(), 256);
    }

    #[test]
    fn first_fit_prefers_the_lowest_hole() {
        let mut heap = TestHeap::with_payload(2048);
        let a = heap.list.allocate(200).unwrap();
        let _b = heap.list.allocate(200).unwrap();
        unsafe {
            heap.list.free(a);
        }
        // The freed low hole fits and is preferred over the big tail.
        let c = heap.list.allocate(100).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn aligned_allocations_are_aligned_and_round_trip() {
        let mut heap = TestHeap::with_payload(4096);
        // Skew the heap so the payload is almost certainly misaligned.
        let _skew = heap.list.allocate(3).unwrap();

        let p = heap.list.allocate_aligned(64, 64).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);
        let q = heap.list.allocate_aligned(16, 128).unwrap();
        assert_eq!(q.as_ptr() as usize % 128, 0);

        unsafe {
            heap.list.free(p);
            heap.list.free(q);
        }
        let total = heap.list.free_memory();
        // Alignment may strand small heads permanently only if they were
        // absorbed; with the header-sized skew rule everything returns.
        assert_eq!(total, 4096 - 3 - CHUNK_HEADER_SIZE);
    }
}
