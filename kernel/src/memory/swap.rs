//! Swap store and the swap-out / swap-in paths
//!
//! A fixed table of `SWAP_SLOTS` slots mirrors the frame table: saved
//! permission bits, a refcount, and the reverse map of the swapped-out
//! PTEs. Slot `i` owns the 8 disk sectors starting at `2 + 8·i`. The store
//! lock is never held across device I/O; taking a slot off the free set
//! before the lock drops is what keeps two evictions from claiming it.

use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use super::disk;
use super::paging::{PageFlags, PageTableEntry};
use super::process::ProcessTable;
use super::{MemError, MemoryManager, NPROC, PAGE_SHIFT, PAGE_SIZE, SWAP_SLOTS};

/// First sector of `slot`'s 8-sector window in the swap area.
pub const fn swap_sector(slot: usize) -> u64 {
    (2 + 8 * slot) as u64
}

/// The not-present PTE encoding for a page evicted to `slot`.
pub const fn swapped_pte(slot: usize) -> u32 {
    ((2 + 8 * slot as u32) << PAGE_SHIFT) | PageFlags::SWAPPED
}

/// Slot index back out of a swapped PTE.
pub fn swap_slot_from_pte(raw: u32) -> usize {
    (((raw >> PAGE_SHIFT) - 2) / 8) as usize
}

#[derive(Clone, Copy)]
struct SwapSlot {
    free: bool,
    saved_perm: u32,
    refcount: u32,
    sharers: [Option<NonNull<PageTableEntry>>; NPROC],
}

impl SwapSlot {
    const FREE: SwapSlot = SwapSlot {
        free: true,
        saved_perm: 0,
        refcount: 0,
        sharers: [None; NPROC],
    };
}

pub struct SwapStore {
    slots: Vec<SwapSlot>,
}

// Back-references point into managed memory, guarded by the store lock.
unsafe impl Send for SwapStore {}

impl SwapStore {
    pub(crate) fn new() -> Self {
        SwapStore {
            slots: vec![SwapSlot::FREE; SWAP_SLOTS],
        }
    }

    /// First free slot by linear scan, marked taken.
    pub(crate) fn acquire_slot(&mut self) -> Result<usize, MemError> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.free {
                slot.free = false;
                return Ok(i);
            }
        }
        Err(MemError::OutOfSwap)
    }

    /// Stamp slot metadata once the victim page is on disk. The sharer
    /// snapshot keeps its indices.
    pub(crate) fn record(
        &mut self,
        slot: usize,
        perm: u32,
        refcount: u32,
        sharers: &[Option<NonNull<PageTableEntry>>; NPROC],
    ) {
        let s = &mut self.slots[slot];
        s.saved_perm = perm;
        s.refcount = refcount;
        s.sharers = *sharers;
    }

    pub(crate) fn set_saved_perm(&mut self, slot: usize, perm: u32) {
        self.slots[slot].saved_perm = perm;
    }

    pub(crate) fn saved_perm(&self, slot: usize) -> u32 {
        self.slots[slot].saved_perm
    }

    pub(crate) fn refcount(&self, slot: usize) -> u32 {
        self.slots[slot].refcount
    }

    pub(crate) fn sharers(&self, slot: usize) -> [Option<NonNull<PageTableEntry>>; NPROC] {
        self.slots[slot].sharers
    }

    pub(crate) fn is_free(&self, slot: usize) -> bool {
        self.slots[slot].free
    }

    pub(crate) fn slots_in_use(&self) -> usize {
        self.slots.iter().filter(|s| !s.free).count()
    }

    /// Return the slot to the free set: refcount 0, reverse map empty.
    pub(crate) fn release(&mut self, slot: usize) {
        self.slots[slot] = SwapSlot::FREE;
    }

    pub(crate) fn release_if_empty(&mut self, slot: usize) {
        if self.slots[slot].refcount == 0 {
            self.release(slot);
        }
    }

    pub(crate) fn dec_refcount(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        s.refcount = s.refcount.saturating_sub(1);
    }

    /// One more swapped-out mapping of this slot. The saved permission
    /// loses WRITABLE so a resurrected forked page faults on first write.
    pub(crate) fn inc_refcount(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        s.refcount += 1;
        s.saved_perm &= !PageFlags::WRITABLE;
    }

    /// Record a swapped-out PTE. Idempotent; first empty slot wins.
    pub(crate) fn add_sharer(&mut self, slot: usize, pte: NonNull<PageTableEntry>) {
        let sharers = &mut self.slots[slot].sharers;
        let mut empty = None;
        for (j, s) in sharers.iter().enumerate() {
            match *s {
                Some(p) if p == pte => return,
                None if empty.is_none() => empty = Some(j),
                _ => {}
            }
        }
        if let Some(j) = empty {
            sharers[j] = Some(pte);
        }
    }

    /// Clear every back-reference equal to `pte` and zero the PTE itself.
    pub(crate) fn remove_sharer(&mut self, slot: usize, pte: NonNull<PageTableEntry>) {
        for s in self.slots[slot].sharers.iter_mut() {
            if *s == Some(pte) {
                *s = None;
            }
        }
        unsafe {
            (*pte.as_ptr()).clear();
        }
    }
}

/// Evict one victim page to disk to refill the free list.
///
/// The replacement policy supplies the victim; when its first scan comes up
/// empty the access bits are cleared and the scan retried once. The sharer
/// list is snapshotted before any PTE is rewritten and that snapshot
/// becomes the slot's reverse map, index for index.
pub(crate) fn swap_out(mm: &MemoryManager, procs: &dyn ProcessTable) -> Result<(), MemError> {
    let victim = procs.victim();
    let vpte = match procs.victim_page(victim) {
        Some(pte) => pte,
        None => {
            procs.clear_access_bits(victim);
            procs.victim_page(victim).ok_or(MemError::NoVictimPage)?
        }
    };
    let entry = unsafe { *vpte.as_ptr() };
    let pa = entry.phys_addr();
    let perm = entry.flags().bits() & !PageFlags::PRESENT;

    let slot = {
        let mut store = mm.swap.lock();
        let slot = store.acquire_slot()?;
        store.set_saved_perm(slot, perm);
        slot
    };

    // device I/O with no locks held; the slot is already off the free set
    let page = unsafe { &*(mm.phys_to_virt(pa) as *const [u8; PAGE_SIZE]) };
    disk::page_to_disk(&*mm.disk, page, swap_sector(slot))?;

    let (refcount, sharers) = {
        let frames = mm.frames.lock();
        (frames.refcount(pa), frames.sharers(pa))
    };

    let swapped = swapped_pte(slot);
    unsafe {
        (*vpte.as_ptr()).set_raw(swapped);
    }
    for pte in sharers.iter().flatten() {
        unsafe {
            (*pte.as_ptr()).set_raw(swapped);
        }
    }
    procs.tlb_shootdown();

    mm.swap.lock().record(slot, perm, refcount, &sharers);
    {
        let mut frames = mm.frames.lock();
        frames.set_refcount(pa, 0);
        frames.free(pa);
    }
    procs.adjust_rss(victim, -(PAGE_SIZE as i64));
    mm.swapped_out.fetch_add(1, Ordering::Relaxed);
    crate::log_debug!("[SWAP] evicted frame {:#x} to slot {} (rc {})", pa, slot, refcount);
    Ok(())
}

/// Resolve a not-present fault on a swapped PTE: read the page back into a
/// fresh frame, rewrite every recorded sharer, release the slot.
pub(crate) fn handle_swap_fault(
    mm: &MemoryManager,
    procs: &dyn ProcessTable,
    pte: NonNull<PageTableEntry>,
) -> Result<(), MemError> {
    let entry = unsafe { *pte.as_ptr() };
    if !entry.is_swapped() {
        return Err(MemError::NotSwapped);
    }
    let slot = swap_slot_from_pte(entry.raw());

    let mem = mm.alloc_frame(procs)?;
    let page = unsafe { &mut *(mm.phys_to_virt(mem) as *mut [u8; PAGE_SIZE]) };
    disk::disk_to_page(&*mm.disk, page, swap_sector(slot))?;

    let (saved_perm, refcount, sharers) = {
        let store = mm.swap.lock();
        (store.saved_perm(slot), store.refcount(slot), store.sharers(slot))
    };
    let restored = (mem | saved_perm | PageFlags::PRESENT) & !PageFlags::SWAPPED;
    unsafe {
        (*pte.as_ptr()).set_raw(restored);
    }
    {
        let mut frames = mm.frames.lock();
        frames.set_refcount(mem, refcount);
        for (i, sharer) in sharers.iter().enumerate() {
            if let Some(p) = sharer {
                unsafe {
                    (*p.as_ptr()).set_raw(restored);
                }
                frames.rewrite_sharer(mem, i, *p);
            }
        }
    }
    procs.tlb_shootdown();
    mm.swap.lock().release(slot);
    procs.adjust_rss(procs.current(), PAGE_SIZE as i64);
    mm.swapped_in.fetch_add(1, Ordering::Relaxed);
    crate::log_debug!("[SWAP] restored slot {} into frame {:#x} (rc {})", slot, mem, refcount);
    Ok(())
}
