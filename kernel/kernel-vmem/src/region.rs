//! # Memory Regions
//!
//! A [`MemoryRegion`] describes one contiguous virtual range `[virtual_start,
//! virtual_end)` with its permission flags and, once touched, its physical
//! backing. Regions are the nodes of the [region tree](crate::RegionTree);
//! the tree maintains the non-overlap invariant, the region itself only
//! provides the range arithmetic.
//!
//! A *managed* region's backing is allocated on first fault and must be
//! returned to the frame allocator when the region (or a part of it) is
//! destroyed. The trim/split helpers therefore report exactly which physical
//! sub-range the caller has to release; a region never frees anything
//! itself.

use crate::entry::PageFlags;
use kernel_addresses::{PhysicalAddress, PhysicalBlock, VirtualAddress};

/// Creation of a fixed mapping whose virtual and physical ranges differ in
/// size.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error(
    "virtual range {virtual_start}..{virtual_end} does not match the size of physical range {physical_start}..{physical_end}"
)]
pub struct MisconfiguredRegion {
    pub virtual_start: VirtualAddress,
    pub virtual_end: VirtualAddress,
    pub physical_start: PhysicalAddress,
    pub physical_end: PhysicalAddress,
}

/// One entry of the address-space map.
#[derive(Clone, Debug)]
pub struct MemoryRegion {
    /// First virtual address covered.
    pub virtual_start: VirtualAddress,
    /// One past the last virtual address covered.
    pub virtual_end: VirtualAddress,
    /// Permissions installed into leaf entries for this range.
    pub flags: PageFlags,
    /// The kernel owns the backing: it is allocated lazily on first touch
    /// and must be released when the region is destroyed.
    pub managed: bool,
    /// Physical backing, present once allocated (managed) or from creation
    /// (fixed mappings).
    pub backing: Option<PhysicalBlock>,
}

impl MemoryRegion {
    /// A lazily backed region; physical memory is attached on first fault.
    #[must_use]
    pub const fn new_managed(
        virtual_start: VirtualAddress,
        virtual_end: VirtualAddress,
        flags: PageFlags,
    ) -> Self {
        Self {
            virtual_start,
            virtual_end,
            flags,
            managed: true,
            backing: None,
        }
    }

    /// A region over a caller-supplied physical range (device memory, the
    /// kernel image, ...). The kernel never allocates or frees its backing.
    ///
    /// # Errors
    /// [`MisconfiguredRegion`] when the two ranges differ in size.
    pub fn new_fixed(
        virtual_start: VirtualAddress,
        virtual_end: VirtualAddress,
        physical_start: PhysicalAddress,
        physical_end: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<Self, MisconfiguredRegion> {
        if virtual_end - virtual_start != physical_end - physical_start {
            return Err(MisconfiguredRegion {
                virtual_start,
                virtual_end,
                physical_start,
                physical_end,
            });
        }
        Ok(Self {
            virtual_start,
            virtual_end,
            flags,
            managed: false,
            backing: Some(PhysicalBlock::new(
                physical_start,
                physical_end - physical_start,
            )),
        })
    }

    /// The zero-permission region used by the unmap protocol.
    #[must_use]
    pub const fn placeholder(virtual_start: VirtualAddress, virtual_end: VirtualAddress) -> Self {
        Self {
            virtual_start,
            virtual_end,
            flags: PageFlags::empty(),
            managed: false,
            backing: None,
        }
    }

    /// Length of the virtual range in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.virtual_end - self.virtual_start
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.virtual_start == self.virtual_end
    }

    /// `true` if `va` lies inside `[virtual_start, virtual_end)`.
    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.virtual_start <= va && va < self.virtual_end
    }

    /// The physical address backing `va`, if the region is backed.
    #[inline]
    #[must_use]
    pub fn phys_for(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        debug_assert!(self.contains(va));
        let backing = self.backing?;
        Some(backing.start + (va - self.virtual_start))
    }

    /// Shrink the region to `[virtual_start, new_end)`.
    ///
    /// Returns the physical sub-range the region no longer covers when the
    /// region is managed and backed; the caller releases it.
    pub fn trim_end(&mut self, new_end: VirtualAddress) -> Option<PhysicalBlock> {
        debug_assert!(self.virtual_start <= new_end && new_end <= self.virtual_end);
        let cut = self.virtual_end - new_end;
        self.virtual_end = new_end;

        let released = match &mut self.backing {
            Some(backing) => {
                backing.size -= cut;
                Some(PhysicalBlock::new(backing.start + backing.size, cut))
            }
            None => None,
        };
        released.filter(|b| self.managed && !b.is_empty())
    }

    /// Advance the region start to `new_start`.
    ///
    /// Returns the released physical head sub-range under the same rules as
    /// [`trim_end`](Self::trim_end).
    pub fn trim_start(&mut self, new_start: VirtualAddress) -> Option<PhysicalBlock> {
        debug_assert!(self.virtual_start <= new_start && new_start <= self.virtual_end);
        let cut = new_start - self.virtual_start;
        self.virtual_start = new_start;

        let released = match &mut self.backing {
            Some(backing) => {
                let head = PhysicalBlock::new(backing.start, cut);
                backing.start += cut;
                backing.size -= cut;
                Some(head)
            }
            None => None,
        };
        released.filter(|b| self.managed && !b.is_empty())
    }

    /// Split off the tail `[at, virtual_end)` as a new region inheriting
    /// flags, managed-ness and the corresponding physical sub-range; `self`
    /// keeps `[virtual_start, at)`.
    #[must_use]
    pub fn split_tail(&mut self, at: VirtualAddress) -> Self {
        debug_assert!(self.virtual_start <= at && at <= self.virtual_end);
        let head_len = at - self.virtual_start;

        let tail_backing = self.backing.map(|b| {
            PhysicalBlock::new(b.start + head_len, b.size - head_len)
        });
        if let Some(backing) = &mut self.backing {
            backing.size = head_len;
        }

        let tail = Self {
            virtual_start: at,
            virtual_end: self.virtual_end,
            flags: self.flags,
            managed: self.managed,
            backing: tail_backing,
        };
        self.virtual_end = at;
        tail
    }

    /// Tear the region down, yielding the backing to release if the kernel
    /// owns it.
    #[must_use]
    pub fn into_backing(self) -> Option<PhysicalBlock> {
        if self.managed {
            self.backing.filter(|b| !b.is_empty())
        } else {
            None
        }
    }
}
