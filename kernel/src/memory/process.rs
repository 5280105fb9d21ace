//! Interface to the process table
//!
//! The fault paths never own process state. The faulting address space,
//! resident-set accounting, the page-replacement policy, and TLB
//! maintenance all live behind this trait; the kernel's process table
//! implements it, and hosted tests stub it.

use core::ptr::NonNull;

use super::paging::PageTableEntry;
use super::PhysAddr;

/// Process identifier.
pub type Pid = usize;

pub trait ProcessTable: Send + Sync {
    /// The process taking the current fault.
    fn current(&self) -> Pid;

    /// Page-directory root of `pid`'s address space.
    fn root(&self, pid: Pid) -> PhysAddr;

    /// Adjust `pid`'s resident set size by `delta` bytes.
    fn adjust_rss(&self, pid: Pid, delta: i64);

    /// The process the replacement policy evicts from next.
    fn victim(&self) -> Pid;

    /// An evictable page of `pid`, or `None` when every candidate was
    /// referenced since the last scan.
    fn victim_page(&self, pid: Pid) -> Option<NonNull<PageTableEntry>>;

    /// Clear the accessed bits on `pid`'s pages so a rescan can pick one.
    fn clear_access_bits(&self, pid: Pid);

    /// Reload `pid`'s root page table, flushing the local TLB.
    fn reload_root(&self, pid: Pid);

    /// Flush stale translations on every core. Invoked after PTEs other
    /// than the faulter's own were rewritten.
    fn tlb_shootdown(&self);
}
