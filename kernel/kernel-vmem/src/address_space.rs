//! # Address Space (Sv39, single root)
//!
//! Strongly-typed helpers to build and manipulate one virtual address space,
//! a tree of [`PageTable`]s rooted at a physical frame whose page number
//! goes into `satp`.
//!
//! ## Design
//!
//! - Intermediate tables are created on demand with V-only pointer entries;
//!   all permission bits live in the leaf. The walker allocates missing
//!   tables through [`FrameAlloc`] and zeroes them before linking.
//! - `unsafe` is confined to turning a physical frame into a typed table
//!   reference through the [`PhysMapper`].
//! - This kernel installs 4 KiB leaves only. [`query`](AddressSpace::query)
//!   still resolves megapage/gigapage leaves so a translation left behind by
//!   firmware does not read as unmapped.
//!
//! ## Safety
//!
//! Mutating active mappings requires TLB maintenance; `activate` issues an
//! `sfence.vma` after switching roots. The fault path runs with translation
//! disabled, so it never races the hardware walker on the tables it edits.

use crate::entry::{PageFlags, Sv39Entry};
use crate::page_table::{PageTable, vpn_indices};
use crate::{FrameAlloc, PhysMapper};
use kernel_addresses::{
    PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress, VirtualPage,
};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// View an address space through its root table frame.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// The root table frame (what `satp` points at when active).
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Borrow the table in `frame` as a typed [`PageTable`].
    #[inline]
    fn table_mut(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        // Safety: page-table frames are allocated, zeroed and linked only by
        // this walker; the mapper contract covers validity and writability.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// The leaf entry translating `va`, at whatever level it terminates,
    /// or `None` when the walk ends in an invalid entry.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<Sv39Entry> {
        let indices = vpn_indices(va);
        let mut table = self.table_mut(self.root);
        for &index in &indices {
            let entry = table.get(index);
            if !entry.valid() {
                return None;
            }
            if entry.is_leaf() {
                return Some(entry);
            }
            table = self.table_mut(PhysicalPage::from_addr(entry.physical_address()));
        }
        // A valid pointer entry at the last level is malformed; treat the
        // address as untranslated.
        None
    }

    /// Translate `va` to its physical address, honoring leaves at any level.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let indices = vpn_indices(va);
        let mut table = self.table_mut(self.root);
        for (level, &index) in indices.iter().enumerate() {
            let entry = table.get(index);
            if !entry.valid() {
                return None;
            }
            if entry.is_leaf() {
                let base = entry.physical_address();
                return Some(match level {
                    0 => base.page::<Size1G>().join(va.offset::<Size1G>()),
                    1 => base.page::<Size2M>().join(va.offset::<Size2M>()),
                    _ => base.page::<Size4K>().join(va.offset::<Size4K>()),
                });
            }
            table = self.table_mut(PhysicalPage::from_addr(entry.physical_address()));
        }
        None
    }

    /// Install a 4 KiB leaf mapping `page → frame` with `flags`, creating
    /// any missing intermediate tables from `alloc` (zeroed before linking).
    ///
    /// Returns `None` on frame-allocation failure, `Some(())` otherwise.
    /// An existing leaf on the walk path must have been ruled out by the
    /// caller; the walk only ever descends through pointer entries.
    #[must_use]
    pub fn map_leaf<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        page: VirtualPage<Size4K>,
        frame: PhysicalPage<Size4K>,
        flags: PageFlags,
    ) -> Option<()> {
        let va = page.base();
        let [i2, i1, i0] = vpn_indices(va);

        let mut table = self.table_mut(self.root);
        for index in [i2, i1] {
            let entry = table.get(index);
            let next = match entry.next_table() {
                Some(next) => next,
                None => {
                    debug_assert!(!entry.valid(), "pointer chain hit a leaf");
                    let next = alloc.alloc_4k()?;
                    self.table_mut(next).zero();
                    table.set(index, Sv39Entry::pointer(next));
                    next
                }
            };
            table = self.table_mut(next);
        }

        table.set(i0, Sv39Entry::leaf(frame, flags));
        log::trace!("install 4K leaf {} -> {}", page.base(), frame.base());
        Some(())
    }

    /// Load `satp` with this address space's root and flush the TLB.
    ///
    /// # Safety
    /// The mappings must cover the currently executing code, or the next
    /// instruction fetch faults.
    #[cfg(target_arch = "riscv64")]
    pub unsafe fn activate(&self) {
        const SATP_MODE_SV39: u64 = 8 << 60;
        let satp = (self.root.base().as_u64() >> 12) | SATP_MODE_SV39;
        unsafe {
            core::arch::asm!(
                "csrw satp, {satp}",
                "sfence.vma zero, zero",
                satp = in(reg) satp,
            );
        }
    }
}

/// Disable translation on the calling hart (`satp` mode "bare").
///
/// The trap dispatcher calls this before fault handling and re-activates
/// the table afterwards.
///
/// # Safety
/// The calling code must be reachable through physical addresses (identity
/// mapped) once translation is off.
#[cfg(target_arch = "riscv64")]
pub unsafe fn disable_translation() {
    unsafe {
        core::arch::asm!("csrw satp, zero", "sfence.vma zero, zero");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// A trivial bump allocator: hands out the next 4 KiB frame, never
    /// reuses. Good enough to build page-table chains in tests.
    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl BumpAlloc {
        const fn new(start: u64, end: u64) -> Self {
            Self { next: start, end }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next + 4096 > self.end {
                return None;
            }
            let frame = PhysicalPage::from_addr(PhysicalAddress::new(self.next));
            self.next += 4096;
            Some(frame)
        }
    }

    /// A 4 KiB-aligned raw frame; the test's "physical RAM" backing store.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Simulated physical memory: frame `n` lives at physical `n * 4096`.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Aligned4K([0u8; 4096]));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let index = (pa.as_u64() >> 12) as usize;
            let offset = (pa.as_u64() & 0xFFF) as usize;
            let base = core::ptr::from_ref(&self.frames[index]).cast_mut().cast::<u8>();
            // Safety: the caller promises T matches the bytes at `pa`.
            unsafe { &mut *base.add(offset).cast::<T>() }
        }
    }

    fn fresh_space<'m>(phys: &'m TestPhys, alloc: &mut BumpAlloc) -> AddressSpace<'m, TestPhys> {
        let root = alloc.alloc_4k().unwrap();
        let aspace = AddressSpace::from_root(phys, root);
        aspace.table_mut(root).zero();
        aspace
    }

    #[test]
    fn map_leaf_creates_all_three_levels() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x0000_0012_3456_7000);
        let frame = PhysicalPage::from_addr(PhysicalAddress::new(0x0003_0000));
        aspace
            .map_leaf(
                &mut alloc,
                VirtualPage::containing(va),
                frame,
                PageFlags::READ | PageFlags::WRITE | PageFlags::GLOBAL,
            )
            .expect("map_leaf");

        // Walk the tables by hand and verify the chain.
        let [i2, i1, i0] = vpn_indices(va);
        let l2 = aspace.table_mut(aspace.root_page());
        let e2 = l2.get(i2);
        assert!(e2.valid() && !e2.is_leaf());

        let l1 = aspace.table_mut(PhysicalPage::from_addr(e2.physical_address()));
        let e1 = l1.get(i1);
        assert!(e1.valid() && !e1.is_leaf());

        let l0 = aspace.table_mut(PhysicalPage::from_addr(e1.physical_address()));
        let e0 = l0.get(i0);
        assert!(e0.valid() && e0.is_leaf());
        assert_eq!(e0.physical_address().as_u64(), 0x0003_0000);
        assert!(e0.writable() && e0.global() && !e0.user());
    }

    #[test]
    fn query_resolves_with_page_offset() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x0000_0000_4000_0000);
        let frame = PhysicalPage::from_addr(PhysicalAddress::new(0x0002_0000));
        aspace
            .map_leaf(&mut alloc, VirtualPage::containing(va), frame, PageFlags::READ)
            .expect("map_leaf");

        assert_eq!(
            aspace.query(va + 0x123),
            Some(PhysicalAddress::new(0x0002_0123))
        );
        assert!(aspace.query(va + 0x1000).is_none());
    }

    #[test]
    fn leaf_entry_reports_presence() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x0000_0000_0060_0000);
        assert!(aspace.leaf_entry(va).is_none());

        let frame = PhysicalPage::from_addr(PhysicalAddress::new(0x0001_0000));
        aspace
            .map_leaf(&mut alloc, VirtualPage::containing(va), frame, PageFlags::READ)
            .expect("map_leaf");

        let leaf = aspace.leaf_entry(va).expect("installed");
        assert_eq!(leaf.physical_address().as_u64(), 0x0001_0000);
        // A neighboring page in the same table is still unmapped.
        assert!(aspace.leaf_entry(va + 0x1000).is_none());
    }

    #[test]
    fn map_leaf_fails_when_tables_cannot_be_allocated() {
        let phys = TestPhys::with_frames(2);
        // Exactly one frame: enough for the root, not for the L1 table.
        let mut alloc = BumpAlloc::new(0, 1 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let frame = PhysicalPage::from_addr(PhysicalAddress::new(0x1000));
        let va = VirtualAddress::new(0x4000_0000);
        assert!(
            aspace
                .map_leaf(&mut alloc, VirtualPage::containing(va), frame, PageFlags::READ)
                .is_none()
        );
    }

    #[test]
    fn two_mappings_share_intermediate_tables() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);

        let va_a = VirtualAddress::new(0x0000_0000_0040_0000);
        let va_b = va_a + 0x1000;
        for (va, pa) in [(va_a, 0x0001_0000_u64), (va_b, 0x0002_0000)] {
            aspace
                .map_leaf(
                    &mut alloc,
                    VirtualPage::containing(va),
                    PhysicalPage::from_addr(PhysicalAddress::new(pa)),
                    PageFlags::READ,
                )
                .expect("map_leaf");
        }

        // Root + one L1 + one L0 = three table frames after the root.
        assert_eq!(alloc.next >> 12, 3);
        assert_eq!(aspace.query(va_a), Some(PhysicalAddress::new(0x0001_0000)));
        assert_eq!(aspace.query(va_b), Some(PhysicalAddress::new(0x0002_0000)));
    }
}
