//! # Page Table Manager
//!
//! One [`Vmm`] per address space, owning the region tree and the hardware
//! translation root behind a single lock. Mapping is **lazy**: `map_pages`
//! only registers a region; translation entries are installed one page at a
//! time by [`handle_fault`](Vmm::handle_fault) on first access.
//!
//! The external trap dispatcher disables translation before invoking the
//! fault handler and re-enables it afterwards; the handler itself only
//! resolves the mapping, it never resumes execution.
//!
//! Lock ordering: the frame-allocator lock is the innermost lock. The fault
//! path holds the address-space lock for the whole walk-and-populate
//! sequence and takes the frame lock only for individual, bounded
//! allocations inside it. The heap lock is never held across any of these
//! calls.

use crate::frame_alloc::{FrameBitmap, LockedFrames, OutOfPhysicalMemory};
use alloc::vec::Vec;
use kernel_addresses::{
    PhysicalAddress, PhysicalBlock, PhysicalPage, Size4K, VirtualAddress, VirtualPage,
};
use kernel_config::memory::PAGE_SIZE;
use kernel_sync::SpinMutex;
use kernel_vmem::{
    AddressSpace, MemoryRegion, MisconfiguredRegion, PageFlags, PageTable, PhysMapper, RegionTree,
};

/// Failure to register a mapping.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error(transparent)]
    OutOfPhysicalMemory(#[from] OutOfPhysicalMemory),
    #[error(transparent)]
    MisconfiguredRegion(#[from] MisconfiguredRegion),
}

/// Why a translation fault could not be resolved.
///
/// Out-of-memory aside, these are unrecoverable within the memory
/// subsystem: there is no isolation boundary to protect, so the trap
/// dispatcher halts the faulting context after the report.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    /// No region covers the faulting address.
    #[error("fault at unmapped address {vaddr}")]
    Unmapped { vaddr: VirtualAddress },
    /// The access exceeds the covering region's permissions.
    #[error("access {requested:?} at {vaddr} exceeds region permissions {allowed:?}")]
    Permission {
        vaddr: VirtualAddress,
        requested: PageFlags,
        allowed: PageFlags,
    },
    /// A translation entry is already present: the hardware should not
    /// have faulted, so this fault is genuine (double fault).
    #[error("fault at {vaddr} which is already mapped")]
    AlreadyMapped { vaddr: VirtualAddress },
    /// Backing or intermediate tables could not be allocated.
    #[error(transparent)]
    OutOfPhysicalMemory(#[from] OutOfPhysicalMemory),
}

struct Inner {
    regions: RegionTree,
    root: PhysicalPage<Size4K>,
}

/// The virtual-memory manager of one address space.
pub struct Vmm<'m, M: PhysMapper> {
    mapper: &'m M,
    frames: &'m SpinMutex<FrameBitmap>,
    inner: SpinMutex<Inner>,
}

impl<'m, M: PhysMapper> Vmm<'m, M> {
    /// Create an address space with a fresh, empty root table.
    ///
    /// # Errors
    /// [`OutOfPhysicalMemory`] when the root table frame cannot be
    /// allocated.
    pub fn new(
        mapper: &'m M,
        frames: &'m SpinMutex<FrameBitmap>,
    ) -> Result<Self, OutOfPhysicalMemory> {
        let block = frames.lock().allocate(PAGE_SIZE)?;
        let root = PhysicalPage::from_addr(block.start);
        // Safety: the frame was just allocated for exclusive use as the
        // root table.
        unsafe {
            mapper.phys_to_mut::<PageTable>(root.base()).zero();
        }
        Ok(Self {
            mapper,
            frames,
            inner: SpinMutex::new(Inner {
                regions: RegionTree::new(),
                root,
            }),
        })
    }

    /// Register a lazily backed mapping of `[start, end)` (page-rounded
    /// outwards) with `flags`.
    ///
    /// No translation entries are installed; backing is allocated on first
    /// fault. Whatever the range displaces from the map releases its
    /// physical backing here.
    pub fn map_pages(&self, start: VirtualAddress, end: VirtualAddress, flags: PageFlags) {
        let region = MemoryRegion::new_managed(
            start.align_down::<Size4K>(),
            end.align_up::<Size4K>(),
            flags,
        );
        let mut inner = self.inner.lock();
        let released = inner.regions.insert(region);
        self.release(released);
    }

    /// Register a mapping of `[virtual_start, virtual_end)` onto the
    /// caller-provided physical range.
    ///
    /// The kernel neither allocates nor zeroes nor frees this backing.
    ///
    /// # Errors
    /// [`MisconfiguredRegion`] when the two ranges differ in size.
    pub fn map_pages_fixed(
        &self,
        virtual_start: VirtualAddress,
        virtual_end: VirtualAddress,
        physical_start: PhysicalAddress,
        physical_end: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let region = MemoryRegion::new_fixed(
            virtual_start,
            virtual_end,
            physical_start,
            physical_end,
            flags,
        )?;
        let mut inner = self.inner.lock();
        let released = inner.regions.insert(region);
        self.release(released);
        Ok(())
    }

    /// Remove every mapping inside `[start, end)`, releasing owned backing.
    pub fn unmap_pages(&self, start: VirtualAddress, end: VirtualAddress) {
        let mut inner = self.inner.lock();
        let released = inner.regions.unmap(start, end);
        self.release(released);
    }

    /// Resolve a translation fault at `vaddr` for an access of kind
    /// `access`.
    ///
    /// The caller (trap dispatcher) has translation disabled for the
    /// duration of this call and re-enables it afterwards. On success the
    /// faulting page is mapped (and zeroed, if this kernel owns its
    /// backing) before returning.
    ///
    /// # Errors
    /// See [`FaultError`]; every error is reported with the faulting
    /// address before being returned.
    pub fn handle_fault(&self, vaddr: VirtualAddress, access: PageFlags) -> Result<(), FaultError> {
        let mut inner = self.inner.lock();
        let result = self.resolve_fault(&mut inner, vaddr, access);
        if let Err(e) = &result {
            log::error!("unresolvable page fault: {e}");
        }
        result
    }

    fn resolve_fault(
        &self,
        inner: &mut Inner,
        vaddr: VirtualAddress,
        access: PageFlags,
    ) -> Result<(), FaultError> {
        let aspace = AddressSpace::from_root(self.mapper, inner.root);

        let Some(handle) = inner.regions.find(vaddr) else {
            return Err(FaultError::Unmapped { vaddr });
        };
        let region = inner.regions.region(handle);
        if !region.flags.contains(access) {
            return Err(FaultError::Permission {
                vaddr,
                requested: access,
                allowed: region.flags,
            });
        }
        if aspace.leaf_entry(vaddr).is_some() {
            return Err(FaultError::AlreadyMapped { vaddr });
        }

        // Attach backing on the first touch of a managed region.
        if region.managed && region.backing.is_none() {
            let block = self.frames.lock().allocate(region.len())?;
            inner.regions.region_mut(handle).backing = Some(block);
        }

        let region = inner.regions.region(handle);
        let page = VirtualPage::<Size4K>::containing(vaddr);
        let Some(frame_addr) = region.phys_for(page.base()) else {
            // A live region without backing at this point is a placeholder
            // that never should have been faulted through.
            return Err(FaultError::Unmapped { vaddr });
        };
        let frame = PhysicalPage::from_addr(frame_addr);

        let mut tables = LockedFrames::new(self.frames);
        aspace
            .map_leaf(&mut tables, page, frame, region.flags)
            .ok_or(OutOfPhysicalMemory)?;

        if region.managed {
            // Anonymous memory must not leak previous contents. Fixed
            // physical mappings are never zeroed.
            // Safety: the frame belongs to this region's freshly allocated
            // backing; translation is off, so physical access is direct.
            unsafe {
                let page_bytes = self.mapper.phys_to_mut::<u8>(frame.base());
                core::ptr::write_bytes(core::ptr::from_mut(page_bytes), 0, PAGE_SIZE as usize);
            }
        }
        Ok(())
    }

    /// Install this address space as the hart's translation root.
    ///
    /// # Safety
    /// The space must map the currently executing code; see
    /// [`AddressSpace::activate`].
    #[cfg(target_arch = "riscv64")]
    pub unsafe fn activate(&self) {
        let inner = self.inner.lock();
        let aspace = AddressSpace::from_root(self.mapper, inner.root);
        unsafe { aspace.activate() }
    }

    /// Give displaced physical backing back to the frame allocator.
    ///
    /// Called with the address-space lock held; the frame lock nests
    /// inside per the lock-ordering invariant.
    fn release(&self, blocks: Vec<PhysicalBlock>) {
        for block in blocks {
            self.frames.lock().free(block);
        }
    }
}
