//! # Sv39 Page-Table Entries
//!
//! One entry format is shared by all three levels. An entry with any of
//! R/W/X set is a leaf; a valid entry with R=W=X=0 points at the next-level
//! table. The physical page number sits at bits 53:10.

use bitfield_struct::bitfield;
use kernel_addresses::{PhysicalAddress, PhysicalPage, Size4K};

bitflags::bitflags! {
    /// Software-visible page permission flags.
    ///
    /// Bit positions match the hardware entry layout (bit 0 is the Valid
    /// bit, owned by the walker and deliberately absent here), so a region's
    /// flags install into a leaf entry without translation.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PageFlags: u16 {
        /// Loads through this mapping are permitted.
        const READ     = 1 << 1;
        /// Stores through this mapping are permitted.
        const WRITE    = 1 << 2;
        /// Instruction fetch through this mapping is permitted.
        const EXECUTE  = 1 << 3;
        /// User-mode code may use this mapping.
        const USER     = 1 << 4;
        /// Mapping is global (present in every address space; kernel ranges).
        const GLOBAL   = 1 << 5;
        /// Page has been read since the bit was last cleared.
        const ACCESSED = 1 << 6;
        /// Page has been written since the bit was last cleared.
        const DIRTY    = 1 << 7;
    }
}

impl PageFlags {
    /// Permissions for kernel code/data mapped at boot: read, write,
    /// execute, global, with A/D preset so no update faults occur on
    /// hardware without Svadu.
    #[must_use]
    pub const fn kernel_rwx() -> Self {
        Self::READ
            .union(Self::WRITE)
            .union(Self::EXECUTE)
            .union(Self::GLOBAL)
            .union(Self::ACCESSED)
            .union(Self::DIRTY)
    }
}

/// A single Sv39 page-table entry.
///
/// Layout per the RISC-V privileged specification:
///
/// ```text
/// | 63    | 62‒61 | 60‒54    | 53‒10 | 9‒8 | 7‒0             |
/// | NAPOT | PBMT  | reserved | PPN   | RSW | D A G U X W R V |
/// ```
///
/// The NAPOT/PBMT extension bits are never set by this kernel.
#[bitfield(u64)]
pub struct Sv39Entry {
    /// **Valid** (bit 0): the entry participates in translation.
    pub valid: bool,
    /// **Readable** (bit 1): leaf permission; part of the leaf/pointer distinction.
    pub readable: bool,
    /// **Writable** (bit 2).
    pub writable: bool,
    /// **Executable** (bit 3).
    pub executable: bool,
    /// **User** (bit 4): accessible with U-mode privileges.
    pub user: bool,
    /// **Global** (bit 5): mapping exists in all address spaces.
    pub global: bool,
    /// **Accessed** (bit 6).
    pub accessed: bool,
    /// **Dirty** (bit 7).
    pub dirty: bool,
    /// **RSW** (bits 9:8): reserved for software, ignored by hardware.
    #[bits(2)]
    pub rsw: u8,
    /// Physical page number (bits 53:10).
    #[bits(44)]
    ppn: u64,
    /// Reserved (bits 60:54); must be zero.
    #[bits(7)]
    __reserved: u8,
    /// Svpbmt memory attributes (bits 62:61); unused, must be zero.
    #[bits(2)]
    __pbmt: u8,
    /// Svnapot (bit 63); unused, must be zero.
    __napot: bool,
}

impl Sv39Entry {
    /// A valid pointer entry referencing the next-level table.
    ///
    /// Pointer entries have R=W=X=0; all permission checking happens at the
    /// leaf.
    #[inline]
    #[must_use]
    pub const fn pointer(next: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_valid(true)
            .with_ppn(next.base().as_u64() >> 12)
    }

    /// A valid 4 KiB leaf entry mapping `frame` with `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        Self::new()
            .with_valid(true)
            .with_readable(flags.contains(PageFlags::READ))
            .with_writable(flags.contains(PageFlags::WRITE))
            .with_executable(flags.contains(PageFlags::EXECUTE))
            .with_user(flags.contains(PageFlags::USER))
            .with_global(flags.contains(PageFlags::GLOBAL))
            .with_accessed(flags.contains(PageFlags::ACCESSED))
            .with_dirty(flags.contains(PageFlags::DIRTY))
            .with_ppn(frame.base().as_u64() >> 12)
    }

    /// The physical address this entry references (table or leaf base).
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.ppn() << 12)
    }

    /// `true` if this is a leaf (any of R/W/X set).
    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.readable() || self.writable() || self.executable()
    }

    /// The next-level table frame, if this is a valid pointer entry.
    #[inline]
    #[must_use]
    pub fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.valid() && !self.is_leaf() {
            Some(PhysicalPage::from_addr(self.physical_address()))
        } else {
            None
        }
    }

    /// Extract the software-visible permission flags of a leaf.
    #[inline]
    #[must_use]
    pub fn flags(self) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::READ, self.readable());
        flags.set(PageFlags::WRITE, self.writable());
        flags.set(PageFlags::EXECUTE, self.executable());
        flags.set(PageFlags::USER, self.user());
        flags.set(PageFlags::GLOBAL, self.global());
        flags.set(PageFlags::ACCESSED, self.accessed());
        flags.set(PageFlags::DIRTY, self.dirty());
        flags
    }
}
