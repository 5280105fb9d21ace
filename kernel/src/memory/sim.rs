//! Hosted test rig
//!
//! An aligned RAM window stands in for physical memory and a stub process
//! table runs a scripted replacement policy against the in-memory block
//! device. Only compiled for tests.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use super::disk::MemDisk;
use super::paging::{self, PageFlags, PageTableEntry};
use super::process::{Pid, ProcessTable};
use super::{MemoryManager, PhysAddr, VirtAddr, PAGE_SIZE};

/// Base physical address of every test window.
pub const TEST_BASE: PhysAddr = 0x0020_0000;

/// One page-aligned page of backing RAM.
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct RawPage(pub [u8; PAGE_SIZE]);

/// Read a PTE through its back-reference.
pub fn pte_raw(pte: NonNull<PageTableEntry>) -> u32 {
    unsafe { pte.as_ref() }.raw()
}

/// Scripted stand-in for the process table.
pub struct StubProcs {
    current: AtomicUsize,
    victim: AtomicUsize,
    roots: Mutex<BTreeMap<Pid, PhysAddr>>,
    rss: Mutex<BTreeMap<Pid, i64>>,
    /// Victim PTEs handed out in push order.
    ready: Mutex<Vec<usize>>,
    /// Victim PTEs withheld until the access bits are cleared once.
    gated: Mutex<Vec<usize>>,
    pub cleared: AtomicUsize,
    pub reloads: AtomicUsize,
    pub shootdowns: AtomicUsize,
}

impl StubProcs {
    pub fn new() -> Self {
        StubProcs {
            current: AtomicUsize::new(0),
            victim: AtomicUsize::new(0),
            roots: Mutex::new(BTreeMap::new()),
            rss: Mutex::new(BTreeMap::new()),
            ready: Mutex::new(Vec::new()),
            gated: Mutex::new(Vec::new()),
            cleared: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
            shootdowns: AtomicUsize::new(0),
        }
    }

    pub fn set_current(&self, pid: Pid) {
        self.current.store(pid, Ordering::Relaxed);
    }

    pub fn set_victim(&self, pid: Pid) {
        self.victim.store(pid, Ordering::Relaxed);
    }

    pub fn register(&self, pid: Pid, root: PhysAddr) {
        self.roots.lock().insert(pid, root);
        self.rss.lock().insert(pid, 0);
    }

    pub fn rss(&self, pid: Pid) -> i64 {
        *self.rss.lock().get(&pid).unwrap_or(&0)
    }

    pub fn push_victim_page(&self, pte: NonNull<PageTableEntry>) {
        self.ready.lock().push(pte.as_ptr() as usize);
    }

    pub fn push_gated_victim_page(&self, pte: NonNull<PageTableEntry>) {
        self.gated.lock().push(pte.as_ptr() as usize);
    }
}

impl ProcessTable for StubProcs {
    fn current(&self) -> Pid {
        self.current.load(Ordering::Relaxed)
    }

    fn root(&self, pid: Pid) -> PhysAddr {
        self.roots.lock()[&pid]
    }

    fn adjust_rss(&self, pid: Pid, delta: i64) {
        *self.rss.lock().entry(pid).or_insert(0) += delta;
    }

    fn victim(&self) -> Pid {
        self.victim.load(Ordering::Relaxed)
    }

    fn victim_page(&self, _pid: Pid) -> Option<NonNull<PageTableEntry>> {
        let mut ready = self.ready.lock();
        if ready.is_empty() {
            None
        } else {
            NonNull::new(ready.remove(0) as *mut PageTableEntry)
        }
    }

    fn clear_access_bits(&self, _pid: Pid) {
        self.cleared.fetch_add(1, Ordering::Relaxed);
        let mut gated = self.gated.lock();
        self.ready.lock().append(&mut gated);
    }

    fn reload_root(&self, _pid: Pid) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    fn tlb_shootdown(&self) {
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a scenario needs, wired together over `pages` frames of RAM.
pub struct Rig {
    pub mm: Arc<MemoryManager>,
    pub disk: Arc<MemDisk>,
    pub procs: StubProcs,
    _ram: Box<[RawPage]>,
}

impl Rig {
    pub fn new(pages: usize) -> Rig {
        let mut ram: Box<[RawPage]> = vec![RawPage([0; PAGE_SIZE]); pages].into_boxed_slice();
        let window = ram.as_mut_ptr() as *mut u8;
        let base = TEST_BASE;
        let top = base + (pages * PAGE_SIZE) as PhysAddr;
        let disk = Arc::new(MemDisk::new());
        let mm = Arc::new(unsafe { MemoryManager::new(base, top, window, disk.clone()) });

        let split = base + ((pages / 2) * PAGE_SIZE) as PhysAddr;
        mm.init_phase1(base, split);
        mm.init_phase2(split, top);

        Rig {
            mm,
            disk,
            procs: StubProcs::new(),
            _ram: ram,
        }
    }

    /// New process: fresh page-directory root registered with the stub.
    pub fn spawn(&self, pid: Pid) -> PhysAddr {
        let root = paging::new_root(&self.mm, &self.procs).unwrap();
        self.procs.register(pid, root);
        root
    }

    /// Map a fresh user page for `pid`, registering the initial
    /// back-reference and charging the RSS.
    pub fn map_user(
        &self,
        pid: Pid,
        va: VirtAddr,
        flags: PageFlags,
    ) -> (PhysAddr, NonNull<PageTableEntry>) {
        let root = self.procs.root(pid);
        let pa = self.mm.alloc_frame(&self.procs).unwrap();
        let pte = paging::map_page(&self.mm, &self.procs, root, va, pa, flags).unwrap();
        self.mm.add_sharer(pa, pte);
        self.procs.adjust_rss(pid, PAGE_SIZE as i64);
        (pa, pte)
    }

    /// The PTE backing `va` in `pid`'s address space.
    pub fn pte(&self, pid: Pid, va: VirtAddr) -> NonNull<PageTableEntry> {
        paging::walk(&self.mm, self.procs.root(pid), va).expect("address not mapped")
    }

    pub fn fill_page(&self, pa: PhysAddr, byte: u8) {
        unsafe {
            core::ptr::write_bytes(self.mm.phys_to_virt(pa), byte, PAGE_SIZE);
        }
    }

    pub fn page_byte(&self, pa: PhysAddr, offset: usize) -> u8 {
        unsafe { *self.mm.phys_to_virt(pa).add(offset) }
    }

    /// Empty the free list, returning the held frames.
    pub fn drain_free(&self) -> Vec<PhysAddr> {
        let mut held = Vec::new();
        while self.mm.num_free() > 0 {
            held.push(self.mm.alloc_frame(&self.procs).unwrap());
        }
        held
    }
}
