//! Copy-on-write fault handling and the fork-path share primitives
//!
//! A write fault on a present read-only page either upgrades the mapping in
//! place (sole owner) or splits off a private copy (shared frame). The fork
//! path shares one page read-only across two address spaces, or duplicates
//! a swapped-out mapping against its slot.

use core::ptr::{self, NonNull};

use super::paging::{self, PageFlags, PageTableEntry};
use super::process::ProcessTable;
use super::swap;
use super::{MemError, MemoryManager, PhysAddr, VirtAddr, PAGE_SIZE};

/// Resolve a write fault on a present page.
///
/// The refcount decides: below one is an invariant violation, exactly one
/// means the faulter owns the frame and the writable bit flips in place,
/// above one splits the faulter onto a fresh copy while the remaining
/// sharers keep the original.
pub fn handle_cow_fault(
    mm: &MemoryManager,
    procs: &dyn ProcessTable,
    pte: NonNull<PageTableEntry>,
) -> Result<(), MemError> {
    let entry = unsafe { *pte.as_ptr() };
    if entry.is_writable() {
        return Err(MemError::AlreadyWritable);
    }
    let pa = entry.phys_addr();
    let perm = entry.flags().bits();

    let rc = mm.frames.lock().refcount(pa);
    if rc < 1 {
        return Err(MemError::BadRefcount);
    }
    if rc == 1 {
        // sole owner: upgrade in place, no allocation
        unsafe {
            (*pte.as_ptr()).set_raw(entry.raw() | PageFlags::WRITABLE);
        }
        procs.reload_root(procs.current());
        return Ok(());
    }

    let mem = mm.alloc_frame(procs)?;
    unsafe {
        ptr::copy_nonoverlapping(
            mm.phys_to_virt(pa) as *const u8,
            mm.phys_to_virt(mem),
            PAGE_SIZE,
        );
    }
    {
        let mut frames = mm.frames.lock();
        frames.remove_sharer(pa, pte);
        // decrement through the normal path; the other sharers keep the
        // frame above zero
        frames.free(pa);
    }
    unsafe {
        (*pte.as_ptr()).set_raw(mem | perm | PageFlags::WRITABLE);
    }
    mm.frames.lock().add_sharer(mem, pte);
    procs.reload_root(procs.current());
    crate::log_debug!("[COW] split frame {:#x} -> {:#x}", pa, mem);
    Ok(())
}

/// Record one more mapping of `pa`: bump the refcount and remember the PTE.
pub fn share(mm: &MemoryManager, pa: PhysAddr, pte: NonNull<PageTableEntry>) {
    let mut frames = mm.frames.lock();
    frames.inc_refcount(pa);
    frames.add_sharer(pa, pte);
}

/// Forget one mapping of `pa`: drop the back-reference (zeroing the PTE)
/// and release the reference.
pub fn unshare(mm: &MemoryManager, pa: PhysAddr, pte: NonNull<PageTableEntry>) {
    let mut frames = mm.frames.lock();
    frames.remove_sharer(pa, pte);
    frames.free(pa);
}

/// Fork-path step for one page at `va`.
///
/// A present page gets mapped into the child and both mappings go
/// read-only; the next write from either side takes the COW fault. A
/// swapped page is duplicated against its slot instead, which also forces
/// the slot's saved permission read-only.
pub fn fork_page(
    mm: &MemoryManager,
    procs: &dyn ProcessTable,
    parent_root: PhysAddr,
    child_root: PhysAddr,
    va: VirtAddr,
) -> Result<(), MemError> {
    let ppte = paging::walk(mm, parent_root, va).ok_or(MemError::Unmapped)?;
    let entry = unsafe { *ppte.as_ptr() };

    if entry.is_present() {
        let pa = entry.phys_addr();
        let perm = entry.flags().bits() & !PageFlags::WRITABLE;
        unsafe {
            (*ppte.as_ptr()).set_raw(pa | perm);
        }
        let cpte = paging::map_page(
            mm,
            procs,
            child_root,
            va,
            pa,
            PageFlags::new(perm & !PageFlags::PRESENT),
        )?;
        {
            let mut frames = mm.frames.lock();
            frames.inc_refcount(pa);
            frames.add_sharer(pa, ppte);
            frames.add_sharer(pa, cpte);
        }
        procs.reload_root(procs.current());
        Ok(())
    } else if entry.is_swapped() {
        let cpte = paging::walk_alloc(mm, procs, child_root, va)?;
        unsafe {
            (*cpte.as_ptr()).set_raw(entry.raw());
        }
        let slot = swap::swap_slot_from_pte(entry.raw());
        let mut store = mm.swap.lock();
        store.inc_refcount(slot);
        store.add_sharer(slot, ppte);
        store.add_sharer(slot, cpte);
        Ok(())
    } else {
        Err(MemError::Unmapped)
    }
}
