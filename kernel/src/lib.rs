//! EmberOS kernel subsystems.
//!
//! The crate currently hosts the physical memory manager: a 4 KiB frame
//! allocator fused with reference-counted copy-on-write fork support and
//! demand-paged swap. Hardware seams (block device, process table) are
//! traits, so the subsystem builds for bare-metal targets while its tests
//! run hosted.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod logger;
pub mod memory;
