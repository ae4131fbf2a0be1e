//! # Boot-Time Memory Singletons
//!
//! The one frame allocator and the one kernel address space, created once
//! during boot. There is no user/kernel address-space split yet: all harts
//! share the kernel table.
//!
//! Boot calls [`init`] exactly once (before any dynamic allocation and
//! before secondary harts come up), installs the kernel mapping as part of
//! it, then calls [`activate`]. The trap dispatcher disables translation,
//! forwards translation faults to [`handle_kernel_fault`], re-enables
//! translation and either resumes or halts the faulting context.

use crate::allocator::init_heap;
use kernel_addresses::{PhysicalAddress, VirtualAddress};
use kernel_alloc::frame_alloc::{FrameBitmap, OutOfPhysicalMemory};
use kernel_alloc::phys_mapper::IdentityPhysMapper;
use kernel_alloc::vmm::{FaultError, MapError, Vmm};
use kernel_config::memory::{FRAME_WINDOW_PAGES, FREE_MEMORY_END, FREE_MEMORY_START, KERNEL_START};
use kernel_sync::{SpinMutex, SyncOnceCell};
use kernel_vmem::PageFlags;

/// The physical frame allocator over the configured free-memory window.
///
/// Innermost lock in the kernel: it is taken while the page-table lock is
/// held, never the other way around, and never while holding the heap lock.
pub static FRAMES: SpinMutex<FrameBitmap> = SpinMutex::new(FrameBitmap::new(
    PhysicalAddress::new(FREE_MEMORY_START),
    FRAME_WINDOW_PAGES,
));

/// Physical memory is reached directly: translation is off during fault
/// handling, and the kernel window is identity-mapped otherwise.
static PHYS: IdentityPhysMapper = IdentityPhysMapper;

/// The kernel address space, created once by [`init`].
static KERNEL_SPACE: SyncOnceCell<Vmm<'static, IdentityPhysMapper>> = SyncOnceCell::new();

#[derive(Debug, thiserror::Error)]
pub enum MemoryInitError {
    #[error("memory subsystem initialized twice")]
    AlreadyInitialized,
    #[error(transparent)]
    OutOfPhysicalMemory(#[from] OutOfPhysicalMemory),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Bring the memory subsystem up, in dependency order: heap backing out of
/// the frame window, then the kernel address space with the kernel image
/// and the free window identity-mapped (lazily populated, like every other
/// mapping).
///
/// Single-initialization contract: exactly one caller, during boot, before
/// secondary harts start and before the first dynamic allocation.
///
/// # Errors
/// [`MemoryInitError`]; a failure here is fatal to boot.
pub fn init() -> Result<(), MemoryInitError> {
    init_heap(&FRAMES)?;

    let space = Vmm::new(&PHYS, &FRAMES)?;
    space.map_pages_fixed(
        VirtualAddress::new(KERNEL_START),
        VirtualAddress::new(FREE_MEMORY_END),
        PhysicalAddress::new(KERNEL_START),
        PhysicalAddress::new(FREE_MEMORY_END),
        PageFlags::kernel_rwx(),
    )?;

    KERNEL_SPACE
        .set(space)
        .map_err(|_| MemoryInitError::AlreadyInitialized)?;
    log::info!("memory: kernel address space ready");
    Ok(())
}

/// The kernel address space, if [`init`] has run.
#[must_use]
pub fn kernel_space() -> Option<&'static Vmm<'static, IdentityPhysMapper>> {
    KERNEL_SPACE.get()
}

/// Trap-boundary entry: resolve a translation fault against the kernel
/// address space.
///
/// The dispatcher has translation disabled around this call. An `Err`
/// return is unrecoverable; the dispatcher halts the faulting context
/// (the fault was already reported with its diagnostic context).
///
/// # Errors
/// See [`FaultError`].
pub fn handle_kernel_fault(vaddr: VirtualAddress, access: PageFlags) -> Result<(), FaultError> {
    let Some(space) = KERNEL_SPACE.get() else {
        log::error!("page fault at {vaddr} before memory initialization");
        return Err(FaultError::Unmapped { vaddr });
    };
    space.handle_fault(vaddr, access)
}

/// Install the kernel table as the calling hart's translation root.
///
/// Boot calls this once per hart, after [`init`] has completed.
///
/// # Safety
/// The kernel mapping installed by [`init`] must cover the caller's code.
///
/// # Panics
/// When called before [`init`].
#[cfg(target_arch = "riscv64")]
pub unsafe fn activate() {
    let space = KERNEL_SPACE
        .get()
        .expect("memory::activate before memory::init");
    unsafe { space.activate() }
}

/// Disable translation on the calling hart ("bare" mode).
///
/// The trap dispatcher brackets [`handle_kernel_fault`] between this and
/// [`activate`]; fault resolution always runs with translation off.
///
/// # Safety
/// The caller's code must be reachable at its physical address once
/// translation is off.
#[cfg(target_arch = "riscv64")]
pub unsafe fn deactivate() {
    unsafe { kernel_vmem::address_space::disable_translation() }
}
