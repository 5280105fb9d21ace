//! Memory Management Subsystem
//!
//! Physical frame allocator fused with reference-counted copy-on-write fork
//! support and demand-paged swap. Every candidate frame carries a reference
//! count plus a reverse map of the PTEs mapping it, so COW splits and swap
//! traffic can rewrite each sharing mapping while the free list stays
//! consistent under concurrent page faults.
//!
//! The process table and the block device are collaborators reached through
//! traits; everything else lives here.

pub mod cow;
pub mod disk;
pub mod frame;
pub mod paging;
pub mod process;
pub mod swap;

#[cfg(test)]
pub mod sim;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use disk::BlockDevice;
use frame::FrameAllocator;
use paging::PageTableEntry;
use process::ProcessTable;
use swap::SwapStore;

/// Physical address under the 32-bit paging model.
pub type PhysAddr = u32;
/// User virtual address.
pub type VirtAddr = u32;

/// Page / frame size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// log2 of the page size
pub const PAGE_SHIFT: u32 = 12;
/// Top of managed physical memory.
pub const PHYSTOP: PhysAddr = 0x0E00_0000;
/// Maximum number of address spaces that can map one frame or slot.
pub const NPROC: usize = 64;
/// Disk sectors reserved for the swap area.
pub const SWAPBLOCKS: usize = 6400;
/// Number of swap slots (one evicted page each).
pub const SWAP_SLOTS: usize = SWAPBLOCKS / 8;

/// Round `pa` up to the next frame boundary.
pub const fn page_round_up(pa: PhysAddr) -> PhysAddr {
    (pa + (PAGE_SIZE as PhysAddr - 1)) & !(PAGE_SIZE as PhysAddr - 1)
}

/// Runtime dispositions of the subsystem. Every variant except the disk one
/// is an invariant violation and terminal for the faulting path; the
/// outermost handler decides whether to halt the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No free swap slot remains.
    OutOfSwap,
    /// The replacement policy found no evictable page.
    NoVictimPage,
    /// A present page took a write fault with refcount below one.
    BadRefcount,
    /// Not-present fault on a PTE without the swap marker.
    NotSwapped,
    /// Write fault on a PTE that is already writable.
    AlreadyWritable,
    /// The address has no mapping at all.
    Unmapped,
    /// The block device failed a sector transfer.
    DiskIo,
}

/// Window mapping the managed physical range onto addressable memory. On
/// hardware this is the kernel's direct map; hosted tests back it with an
/// aligned allocation, so several subsystems can coexist in one process.
#[derive(Clone, Copy)]
pub struct DirectMap {
    base: PhysAddr,
    top: PhysAddr,
    virt_base: usize,
}

impl DirectMap {
    fn new(base: PhysAddr, top: PhysAddr, virt_base: usize) -> Self {
        DirectMap {
            base,
            top,
            virt_base,
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn top(&self) -> PhysAddr {
        self.top
    }

    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && pa < self.top
    }

    /// Convert a managed physical address to a usable pointer.
    pub fn phys_to_virt(&self, pa: PhysAddr) -> *mut u8 {
        assert!(self.contains(pa), "phys_to_virt: {:#x} outside window", pa);
        (self.virt_base + (pa - self.base) as usize) as *mut u8
    }

    /// Convert a pointer into the window back to its physical address.
    pub fn virt_to_phys(&self, p: *const u8) -> PhysAddr {
        self.base + (p as usize - self.virt_base) as PhysAddr
    }
}

/// Subsystem statistics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub frames_free: usize,
    pub slots_used: usize,
    pub pages_swapped_out: u64,
    pub pages_swapped_in: u64,
}

/// The memory subsystem context: frame allocator, swap store, and the block
/// device backing the swap area. One per kernel.
pub struct MemoryManager {
    map: DirectMap,
    pub(crate) frames: Mutex<FrameAllocator>,
    pub(crate) swap: Mutex<SwapStore>,
    pub(crate) disk: Arc<dyn BlockDevice>,
    pub(crate) swapped_out: AtomicU64,
    pub(crate) swapped_in: AtomicU64,
}

impl MemoryManager {
    /// Create a manager over the physical window `[base, top)`.
    ///
    /// # Safety
    ///
    /// `window` must point to `top - base` bytes that stay valid and
    /// exclusively owned by this manager for its whole lifetime. `base`,
    /// `top` and `window` must all be page aligned.
    pub unsafe fn new(
        base: PhysAddr,
        top: PhysAddr,
        window: *mut u8,
        disk: Arc<dyn BlockDevice>,
    ) -> Self {
        assert_eq!(base as usize % PAGE_SIZE, 0, "unaligned window base");
        assert_eq!(top as usize % PAGE_SIZE, 0, "unaligned window top");
        assert_eq!(window as usize % PAGE_SIZE, 0, "unaligned window memory");
        assert!(base < top && top <= PHYSTOP, "bad window {:#x}..{:#x}", base, top);
        let map = DirectMap::new(base, top, window as usize);
        MemoryManager {
            map,
            frames: Mutex::new(FrameAllocator::new(map)),
            swap: Mutex::new(SwapStore::new()),
            disk,
            swapped_out: AtomicU64::new(0),
            swapped_in: AtomicU64::new(0),
        }
    }

    /// Phase-1 init: register the frames covered by the bootstrap mapping.
    pub fn init_phase1(&self, start: PhysAddr, end: PhysAddr) {
        self.frames.lock().free_range(start, end);
    }

    /// Phase-2 init: register the remaining frames. Every public operation
    /// serializes on the allocator lock from here on.
    pub fn init_phase2(&self, start: PhysAddr, end: PhysAddr) {
        self.frames.lock().free_range(start, end);
        crate::log!("[FRAME] allocator ready: {} frames free", self.num_free());
    }

    pub fn phys_to_virt(&self, pa: PhysAddr) -> *mut u8 {
        self.map.phys_to_virt(pa)
    }

    /// Allocate one frame: refcount 1, empty reverse map. When the free
    /// list is empty a victim page is swapped out and the pop retried, so
    /// the only failures are swap exhaustion and a missing victim.
    pub fn alloc_frame(&self, procs: &dyn ProcessTable) -> Result<PhysAddr, MemError> {
        loop {
            if let Some(pa) = self.frames.lock().try_alloc() {
                return Ok(pa);
            }
            swap::swap_out(self, procs)?;
        }
    }

    /// Release one reference to `pa`. The frame is poisoned and relinked
    /// when the count reaches zero; with the count already at zero this is
    /// a no-op.
    pub fn free_frame(&self, pa: PhysAddr) {
        self.frames.lock().free(pa);
    }

    pub fn refcount(&self, pa: PhysAddr) -> u32 {
        self.frames.lock().refcount(pa)
    }

    pub fn set_refcount(&self, pa: PhysAddr, value: u32) {
        self.frames.lock().set_refcount(pa, value);
    }

    pub fn inc_refcount(&self, pa: PhysAddr) {
        self.frames.lock().inc_refcount(pa);
    }

    /// Record a PTE back-reference for `pa`. Idempotent.
    pub fn add_sharer(&self, pa: PhysAddr, pte: NonNull<PageTableEntry>) {
        self.frames.lock().add_sharer(pa, pte);
    }

    /// Drop a PTE back-reference for `pa`, zeroing the PTE itself.
    pub fn remove_sharer(&self, pa: PhysAddr, pte: NonNull<PageTableEntry>) {
        self.frames.lock().remove_sharer(pa, pte);
    }

    pub fn sharer_count(&self, pa: PhysAddr) -> usize {
        self.frames.lock().sharer_count(pa)
    }

    pub fn num_free(&self) -> usize {
        self.frames.lock().num_free()
    }

    /// Snapshot of the free list, head first.
    pub fn free_list(&self) -> Vec<PhysAddr> {
        self.frames.lock().free_list()
    }

    /// Resolve a page fault at `va` in the faulting process's address
    /// space: COW split for a present read-only page, swap-in for a
    /// swapped-out one.
    pub fn handle_page_fault(
        &self,
        procs: &dyn ProcessTable,
        va: VirtAddr,
    ) -> Result<(), MemError> {
        let root = procs.root(procs.current());
        let pte = paging::walk(self, root, va).ok_or(MemError::Unmapped)?;
        let entry = unsafe { *pte.as_ptr() };
        if entry.is_unused() {
            return Err(MemError::Unmapped);
        }
        if entry.is_present() {
            cow::handle_cow_fault(self, procs, pte)
        } else {
            swap::handle_swap_fault(self, procs, pte)
        }
    }

    /// Drop the mapping at `va`, whether the page is resident or swapped.
    pub fn unmap_page(&self, root: PhysAddr, va: VirtAddr) -> Result<(), MemError> {
        let pte = paging::walk(self, root, va).ok_or(MemError::Unmapped)?;
        let entry = unsafe { *pte.as_ptr() };
        if entry.is_present() {
            let pa = entry.phys_addr();
            self.frames.lock().remove_sharer(pa, pte);
            self.free_frame(pa);
        } else if entry.is_swapped() {
            let slot = swap::swap_slot_from_pte(entry.raw());
            let mut store = self.swap.lock();
            store.remove_sharer(slot, pte);
            store.dec_refcount(slot);
            store.release_if_empty(slot);
        } else {
            return Err(MemError::Unmapped);
        }
        Ok(())
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            frames_free: self.num_free(),
            slots_used: self.swap.lock().slots_in_use(),
            pages_swapped_out: self.swapped_out.load(Ordering::Relaxed),
            pages_swapped_in: self.swapped_in.load(Ordering::Relaxed),
        }
    }
}
